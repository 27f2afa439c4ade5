//! Pipeline status enum and the lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle status of a pipeline record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Record exists, no resources prepared yet.
    Created,
    /// Directories and resources are set up.
    Prepared,
    /// A run is in progress (a running entry exists).
    Running,
    /// All template steps finished without error.
    Completed,
    /// A step failed or the run was crash-recovered.
    Failed,
    /// Relocated to the archive store.
    Archived,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "prepared" => Ok(Self::Prepared),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown pipeline status '{other}'")),
        }
    }
}

impl PipelineStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Created,
        Self::Prepared,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Archived,
    ];

    /// Returns the persisted text form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    /// Returns true if the status ends a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Archived)
    }

    /// Returns true if the pipeline may be moved to the archive.
    #[must_use]
    pub fn is_archivable(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the statuses reachable in one step.
    #[must_use]
    pub fn successors(&self) -> &'static [Self] {
        match self {
            Self::Created => &[Self::Prepared],
            Self::Prepared => &[Self::Running],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed => &[Self::Archived],
            Self::Failed => &[Self::Created, Self::Archived],
            Self::Archived => &[],
        }
    }

    /// Checks if a transition between two statuses is allowed.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        self.successors().contains(&to)
    }
}
