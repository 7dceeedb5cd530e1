//! Reported workflow states

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// State reported by the agent via the reported twin property.
///
/// Terminal states for a deployment are `Idle` (success) and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    DeploymentInProgress,
    DownloadStarted,
    DownloadSucceeded,
    InstallStarted,
    InstallSucceeded,
    ApplyStarted,
    Failed,
}

impl UpdateState {
    pub fn as_i32(&self) -> i32 {
        match self {
            UpdateState::Idle => 0,
            UpdateState::DeploymentInProgress => 3,
            UpdateState::DownloadStarted => 4,
            UpdateState::DownloadSucceeded => 5,
            UpdateState::InstallStarted => 6,
            UpdateState::InstallSucceeded => 7,
            UpdateState::ApplyStarted => 8,
            UpdateState::Failed => 255,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(UpdateState::Idle),
            3 => Some(UpdateState::DeploymentInProgress),
            4 => Some(UpdateState::DownloadStarted),
            5 => Some(UpdateState::DownloadSucceeded),
            6 => Some(UpdateState::InstallStarted),
            7 => Some(UpdateState::InstallSucceeded),
            8 => Some(UpdateState::ApplyStarted),
            255 => Some(UpdateState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Idle | UpdateState::Failed)
    }

    /// Whether `next` is a legal successor of `self` in the deployment
    /// state graph. Any non-terminal state may fail (cancellation included).
    pub fn can_transition_to(&self, next: UpdateState) -> bool {
        if !self.is_terminal() && next == UpdateState::Failed {
            return true;
        }

        matches!(
            (self, next),
            (UpdateState::Idle, UpdateState::DeploymentInProgress)
                | (UpdateState::DeploymentInProgress, UpdateState::DownloadStarted)
                | (UpdateState::DeploymentInProgress, UpdateState::Idle)
                | (UpdateState::DownloadStarted, UpdateState::DownloadSucceeded)
                | (UpdateState::DownloadSucceeded, UpdateState::InstallStarted)
                | (UpdateState::InstallStarted, UpdateState::InstallSucceeded)
                | (UpdateState::InstallSucceeded, UpdateState::ApplyStarted)
                | (UpdateState::ApplyStarted, UpdateState::Idle)
                | (UpdateState::Failed, UpdateState::DeploymentInProgress)
        )
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdateState::Idle => "Idle",
            UpdateState::DeploymentInProgress => "DeploymentInProgress",
            UpdateState::DownloadStarted => "DownloadStarted",
            UpdateState::DownloadSucceeded => "DownloadSucceeded",
            UpdateState::InstallStarted => "InstallStarted",
            UpdateState::InstallSucceeded => "InstallSucceeded",
            UpdateState::ApplyStarted => "ApplyStarted",
            UpdateState::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

impl Serialize for UpdateState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for UpdateState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i32::deserialize(deserializer)?;
        UpdateState::from_i32(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown update state: {}", value)))
    }
}
