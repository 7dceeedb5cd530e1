//! Storage layout and agent settings

pub mod layout;
pub mod settings;
