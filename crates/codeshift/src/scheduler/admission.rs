//! Submission checks and the admission queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::{Component, Path};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::config::Settings;
use crate::error::SubmitError;
use crate::job::{JobId, JobSubmission};

fn invalid(path: &str, reason: &str) -> SubmitError {
    SubmitError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn check_path(path: &str) -> Result<(), SubmitError> {
    if path.trim().is_empty() {
        return Err(invalid(path, "empty path"));
    }
    let normalized = path.replace('\\', "/");
    let as_path = Path::new(&normalized);
    if as_path.has_root() || normalized.chars().nth(1) == Some(':') {
        return Err(invalid(path, "absolute paths are not allowed"));
    }
    for component in as_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(invalid(path, "path escapes the batch root")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(path, "absolute paths are not allowed"))
            }
        }
    }
    Ok(())
}

/// Rejects input errors before a job is created.
pub fn validate_submission(settings: &Settings, submission: &JobSubmission) -> Result<(), SubmitError> {
    if submission.name.trim().is_empty() {
        return Err(SubmitError::EmptyName);
    }
    if submission.source_files.is_empty() {
        return Err(SubmitError::NoSourceFiles);
    }

    let limits = &settings.submission;
    if submission.source_files.len() > limits.max_files {
        return Err(SubmitError::TooManyFiles {
            count: submission.source_files.len(),
            max: limits.max_files,
        });
    }

    let mut seen = HashSet::new();
    let mut total_bytes = 0usize;
    for file in &submission.source_files {
        check_path(&file.path)?;
        if !seen.insert(file.path.as_str()) {
            return Err(SubmitError::DuplicatePath(file.path.clone()));
        }
        if !limits.allowed_extensions.is_empty() {
            let allowed = file
                .extension()
                .map(|ext| limits.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
                .unwrap_or(false);
            if !allowed {
                return Err(SubmitError::UnsupportedExtension(file.path.clone()));
            }
        }
        total_bytes = total_bytes.saturating_add(file.content.len());
    }
    if total_bytes > limits.max_total_bytes {
        return Err(SubmitError::TooLarge {
            bytes: total_bytes,
            max: limits.max_total_bytes,
        });
    }

    let profile = submission.target_profile.trim();
    if profile.is_empty() {
        return Err(SubmitError::UnknownProfile(submission.target_profile.clone()));
    }
    if !settings.profiles.is_empty() && settings.profile(profile).is_none() {
        return Err(SubmitError::UnknownProfile(submission.target_profile.clone()));
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: i32,
    seq: u64,
    job_id: JobId,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

/// Jobs waiting for a slot, highest priority first and FIFO within a
/// priority.
#[derive(Default)]
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Admission queue lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn push(&self, job_id: JobId, priority: i32) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Queued {
                priority,
                seq,
                job_id,
            });
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<JobId> {
        self.lock().heap.pop().map(|q| q.job_id)
    }

    /// Waits until a job is available.
    pub async fn pop(&self) -> JobId {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job_id) = self.try_pop() {
                return job_id;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
