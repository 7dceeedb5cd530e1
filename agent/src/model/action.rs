//! Update actions sent by the service

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Action requested by the service via the desired twin property.
///
/// `Download`, `Install` and `Apply` are legacy single-phase actions kept
/// for backward-compatible inputs; the engine flattens them to
/// `ApplyDeployment` on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Download,
    Install,
    Apply,
    ApplyDeployment,
    Cancel,
}

impl UpdateAction {
    pub fn as_i32(&self) -> i32 {
        match self {
            UpdateAction::Download => 0,
            UpdateAction::Install => 1,
            UpdateAction::Apply => 2,
            UpdateAction::ApplyDeployment => 3,
            UpdateAction::Cancel => 255,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(UpdateAction::Download),
            1 => Some(UpdateAction::Install),
            2 => Some(UpdateAction::Apply),
            3 => Some(UpdateAction::ApplyDeployment),
            255 => Some(UpdateAction::Cancel),
            _ => None,
        }
    }

    /// Flatten legacy phase actions into the deployment action.
    pub fn normalize(&self) -> Self {
        match self {
            UpdateAction::Download | UpdateAction::Install | UpdateAction::Apply => {
                UpdateAction::ApplyDeployment
            }
            other => *other,
        }
    }
}

impl Serialize for UpdateAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for UpdateAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i32::deserialize(deserializer)?;
        UpdateAction::from_i32(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown update action: {}", value)))
    }
}
