//! Job status and pipeline stage enums, plus the legal transition table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Analyzing,
    Converting,
    Compiling,
    Testing,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Analyzing,
        JobStatus::Converting,
        JobStatus::Compiling,
        JobStatus::Testing,
        JobStatus::Reviewing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The stage executed while the job sits in this status, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            JobStatus::Analyzing => Some(Stage::Analyze),
            JobStatus::Converting => Some(Stage::Convert),
            JobStatus::Compiling => Some(Stage::Compile),
            JobStatus::Testing => Some(Stage::Test),
            JobStatus::Reviewing => Some(Stage::Review),
            _ => None,
        }
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// Same-status updates are not edges; the store handles them separately.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self.is_terminal() || self == next {
            return false;
        }
        if next == Cancelled {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Analyzing)
                | (Analyzing, Converting)
                | (Analyzing, Failed)
                | (Converting, Compiling)
                | (Converting, Failed)
                | (Compiling, Testing)
                | (Compiling, Converting)
                | (Compiling, Failed)
                | (Testing, Reviewing)
                | (Testing, Converting)
                | (Testing, Failed)
                | (Reviewing, Completed)
                | (Reviewing, Converting)
                | (Reviewing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Analyzing => "ANALYZING",
            JobStatus::Converting => "CONVERTING",
            JobStatus::Compiling => "COMPILING",
            JobStatus::Testing => "TESTING",
            JobStatus::Reviewing => "REVIEWING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value '{0}'")]
pub struct ParseEnumError(pub String);

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError(s.to_string()))
    }
}

/// One phase of the conversion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyze,
    Convert,
    Compile,
    Test,
    Review,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Analyze,
        Stage::Convert,
        Stage::Compile,
        Stage::Test,
        Stage::Review,
    ];

    /// The job status that corresponds to running this stage.
    pub fn status(self) -> JobStatus {
        match self {
            Stage::Analyze => JobStatus::Analyzing,
            Stage::Convert => JobStatus::Converting,
            Stage::Compile => JobStatus::Compiling,
            Stage::Test => JobStatus::Testing,
            Stage::Review => JobStatus::Reviewing,
        }
    }

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        match self {
            Stage::Analyze => 0,
            Stage::Convert => 1,
            Stage::Compile => 2,
            Stage::Test => 3,
            Stage::Review => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analyze => "analyze",
            Stage::Convert => "convert",
            Stage::Compile => "compile",
            Stage::Test => "test",
            Stage::Review => "review",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ParseEnumError(s.to_string()))
    }
}
