//! Job event broadcaster: every committed change to a job is published here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{Job, JobId, JobStatus};

/// What kind of commit produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobEventKind {
    Created,
    Transitioned { from: JobStatus },
    /// Same-status update (counters only).
    Updated,
    CancelRequested,
}

/// A committed change to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobEventKind,
    /// Status after the commit.
    pub status: JobStatus,
    pub retry_count: u32,
    pub compile_attempts: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
}

impl JobEvent {
    pub fn new(job: &Job, kind: JobEventKind) -> Self {
        Self {
            job_id: job.id.clone(),
            kind,
            status: job.status,
            retry_count: job.retry_count,
            compile_attempts: job.compile_attempts,
            timestamp: Utc::now(),
            error_message: job.error_message.clone(),
            output_file_path: job.output_file_path.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
