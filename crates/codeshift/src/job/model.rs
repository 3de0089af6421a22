use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::JobStatus;

/// Opaque job identifier (UUID v4 text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One input file of a conversion batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Relative path inside the submitted batch.
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Lower-cased extension without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.rsplit(['/', '\\']).next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// What a client hands to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub name: String,
    pub source_files: Vec<SourceFile>,
    pub target_profile: String,
    #[serde(default)]
    pub priority: i32,
}

impl JobSubmission {
    pub fn new(
        name: impl Into<String>,
        target_profile: impl Into<String>,
        source_files: Vec<SourceFile>,
    ) -> Self {
        Self {
            name: name.into(),
            source_files,
            target_profile: target_profile.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A conversion job as committed in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Immutable once submitted.
    pub source_files: Vec<SourceFile>,
    pub target_profile: String,
    pub priority: i32,
    pub status: JobStatus,
    pub compile_attempts: u32,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Only set on `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Only set on `Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
    /// Scheduler slot that admitted the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Advisory flag set by a cancellation request.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    /// Builds a fresh `Pending` job from an already validated submission.
    pub fn from_submission(submission: JobSubmission) -> Self {
        Self {
            id: JobId::generate(),
            name: submission.name,
            source_files: submission.source_files,
            target_profile: submission.target_profile,
            priority: submission.priority,
            status: JobStatus::Pending,
            compile_attempts: 0,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            output_file_path: None,
            worker: None,
            cancel_requested: false,
        }
    }

    pub fn total_source_bytes(&self) -> usize {
        self.source_files.iter().map(|f| f.content.len()).sum()
    }
}
