use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a boundary crossing. This set is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossingState {
    /// No crossing hosted.
    Idle,
    /// Gate evaluation in progress.
    Entering,
    /// Every gate passed; the caller's operation is executing.
    Active,
    /// Operation finished; audit write in progress.
    Exiting,
    /// An exception is pending acknowledgment by the caller.
    Faulted,
}

impl CrossingState {
    /// States in which a correlation id must be present.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CrossingState::Entering | CrossingState::Active | CrossingState::Exiting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrossingState::Idle => "IDLE",
            CrossingState::Entering => "ENTERING",
            CrossingState::Active => "ACTIVE",
            CrossingState::Exiting => "EXITING",
            CrossingState::Faulted => "FAULTED",
        }
    }
}

impl Default for CrossingState {
    fn default() -> Self {
        CrossingState::Idle
    }
}

impl fmt::Display for CrossingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
