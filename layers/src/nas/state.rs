//! NAS attachment states

use serde::Serialize;
use std::fmt;

/// Attachment state of the UE NAS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NasState {
    #[default]
    Off,
    Attaching,
    IdleRegistered,
    ConnectingToEpc,
    /// Primary leg connected
    Active,
    /// Primary leg and at least one secondary leg connected
    SecondActive,
}

impl NasState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NasState::Off => "OFF",
            NasState::Attaching => "ATTACHING",
            NasState::IdleRegistered => "IDLE_REGISTERED",
            NasState::ConnectingToEpc => "CONNECTING_TO_EPC",
            NasState::Active => "ACTIVE",
            NasState::SecondActive => "SECOND_ACTIVE",
        }
    }
}

impl fmt::Display for NasState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
