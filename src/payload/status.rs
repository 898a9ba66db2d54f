use serde::{Deserialize, Serialize};
use std::fmt;

/// Provisioning status of a data asset.
///
/// Ordered: a payload only ever moves forward through
/// `Pending -> InProgress -> Verified -> {Complete, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    #[default]
    Pending,
    InProgress,
    Verified,
    Failed,
    Complete,
}

impl AssetStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AssetStatus::Failed | AssetStatus::Complete)
    }

    fn rank(self) -> u8 {
        match self {
            AssetStatus::Pending => 0,
            AssetStatus::InProgress => 1,
            AssetStatus::Verified => 2,
            AssetStatus::Failed | AssetStatus::Complete => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// Staying put is allowed so replayed handlers can re-apply the status
    /// they already set. Failure is reachable from any non-terminal status.
    pub fn can_advance_to(self, next: AssetStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next == AssetStatus::Failed || next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssetStatus::Pending => "PENDING",
            AssetStatus::InProgress => "IN_PROGRESS",
            AssetStatus::Verified => "VERIFIED",
            AssetStatus::Failed => "FAILED",
            AssetStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a remote run: data-source run, crawler, or profiling job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
