//! Job store: authoritative in-memory job records with write-through
//! persistence.
//!
//! Status changes go through [`JobStore::transition`], a compare-and-set on
//! the recorded status. Each successful commit is persisted and published on
//! the [`JobEventBroadcaster`] while the write lock is held, so observers see
//! commits in the order they happened.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::broadcast::job_events::{JobEvent, JobEventBroadcaster, JobEventKind};
use crate::db::attempt_repo::{self, AttemptRow};
use crate::db::job_repo::{self, JobRow, SourceFileRow};
use crate::db::{Database, DatabaseError};
use crate::error::StoreError;
use crate::job::{
    AttemptClose, AttemptOutcome, Job, JobId, JobStatus, SourceFile, Stage, StageAttempt,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(s: &str, column: &'static str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::Corrupt {
            column,
            value: s.to_string(),
        })
}

fn parse_opt_timestamp(
    s: Option<&str>,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_timestamp(s, column)).transpose()
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn job_to_row(job: &Job, seq: i64) -> JobRow {
    JobRow {
        id: job.id.to_string(),
        seq,
        name: job.name.clone(),
        target_profile: job.target_profile.clone(),
        priority: job.priority,
        status: job.status.as_str().to_string(),
        compile_attempts: job.compile_attempts,
        retry_count: job.retry_count,
        created_at: format_timestamp(job.created_at),
        started_at: job.started_at.map(format_timestamp),
        completed_at: job.completed_at.map(format_timestamp),
        error_message: job.error_message.clone(),
        output_file_path: job.output_file_path.clone(),
        worker: job.worker.clone(),
        cancel_requested: job.cancel_requested,
        updated_at: format_timestamp(Utc::now()),
    }
}

fn row_to_job(row: JobRow, files: Vec<SourceFileRow>) -> Result<Job, DatabaseError> {
    let status = row.status.parse::<JobStatus>().map_err(|_| DatabaseError::Corrupt {
        column: "jobs.status",
        value: row.status.clone(),
    })?;
    Ok(Job {
        id: JobId::from(row.id),
        name: row.name,
        source_files: files
            .into_iter()
            .map(|f| SourceFile::new(f.path, f.content))
            .collect(),
        target_profile: row.target_profile,
        priority: row.priority,
        status,
        compile_attempts: row.compile_attempts,
        retry_count: row.retry_count,
        created_at: parse_timestamp(&row.created_at, "jobs.created_at")?,
        started_at: parse_opt_timestamp(row.started_at.as_deref(), "jobs.started_at")?,
        completed_at: parse_opt_timestamp(row.completed_at.as_deref(), "jobs.completed_at")?,
        error_message: row.error_message,
        output_file_path: row.output_file_path,
        worker: row.worker,
        cancel_requested: row.cancel_requested,
    })
}

fn attempt_to_row(attempt: &StageAttempt) -> AttemptRow {
    AttemptRow {
        job_id: attempt.job_id.to_string(),
        stage: attempt.stage.as_str().to_string(),
        attempt_number: attempt.attempt_number,
        started_at: format_timestamp(attempt.started_at),
        ended_at: attempt.ended_at.map(format_timestamp),
        outcome: attempt.outcome.map(|o| o.as_str().to_string()),
        detail: attempt.detail.clone(),
        metrics: serde_json::to_string(&attempt.metrics).unwrap_or_else(|_| "{}".to_string()),
    }
}

fn row_to_attempt(row: AttemptRow) -> Result<StageAttempt, DatabaseError> {
    let stage = row.stage.parse::<Stage>().map_err(|_| DatabaseError::Corrupt {
        column: "stage_attempts.stage",
        value: row.stage.clone(),
    })?;
    let outcome = row
        .outcome
        .as_deref()
        .map(|o| {
            o.parse::<AttemptOutcome>().map_err(|_| DatabaseError::Corrupt {
                column: "stage_attempts.outcome",
                value: o.to_string(),
            })
        })
        .transpose()?;
    let metrics: BTreeMap<String, u64> =
        serde_json::from_str(&row.metrics).map_err(|_| DatabaseError::Corrupt {
            column: "stage_attempts.metrics",
            value: row.metrics.clone(),
        })?;
    Ok(StageAttempt {
        job_id: JobId::from(row.job_id),
        stage,
        attempt_number: row.attempt_number,
        started_at: parse_timestamp(&row.started_at, "stage_attempts.started_at")?,
        ended_at: parse_opt_timestamp(row.ended_at.as_deref(), "stage_attempts.ended_at")?,
        outcome,
        detail: row.detail,
        metrics,
    })
}

// ─── Public types ───────────────────────────────────────────────────────────

/// Extra fields applied atomically with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Consume one unit of the retry budget.
    pub bump_retry: bool,
    /// Recorded only when entering `Failed`.
    pub error_message: Option<String>,
    /// Recorded only when entering `Completed`.
    pub output_file_path: Option<String>,
    pub worker: Option<String>,
}

impl TransitionFields {
    pub fn retry() -> Self {
        Self {
            bump_retry: true,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn completed(output_file_path: impl Into<String>) -> Self {
        Self {
            output_file_path: Some(output_file_path.into()),
            ..Default::default()
        }
    }
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobQuery {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Result of [`JobStore::request_cancel`].
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job had not started and is now `Cancelled`.
    Cancelled(Job),
    /// The job is running; the flag is set and the scheduler finishes the
    /// cancellation at its next checkpoint.
    Flagged(Job),
}

// ─── JobStore ───────────────────────────────────────────────────────────────

struct Entry {
    job: Job,
    attempts: Vec<StageAttempt>,
    seq: i64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: i64,
}

/// Persistent job store backed by rusqlite.
///
/// Uses `std::sync::RwLock` for both database handle and cache.
/// All database operations are synchronous and sub-millisecond.
pub struct JobStore {
    db: RwLock<Option<Database>>,
    inner: RwLock<Inner>,
    events: JobEventBroadcaster,
}

impl JobStore {
    pub fn new(events: JobEventBroadcaster) -> Self {
        Self {
            db: RwLock::new(None),
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
                next_seq: 1,
            }),
            events,
        }
    }

    /// Sets the database connection used for write-through persistence.
    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    /// Gets a cloned database handle if available.
    pub fn get_database(&self) -> Option<Database> {
        let guard = match self.db.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn persist<F>(&self, what: &str, job_id: &JobId, f: F)
    where
        F: FnOnce(&Database) -> Result<(), DatabaseError>,
    {
        if let Some(db) = self.get_database() {
            if let Err(e) = f(&db) {
                log::error!("Failed to persist {} for job {}: {}", what, job_id, e);
            }
        }
    }

    /// Inserts a new job.
    pub fn create(&self, job: Job) -> Result<JobId, StoreError> {
        let mut inner = self.write();
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let id = job.id.clone();
        self.persist("new job", &id, |db| {
            let files: Vec<SourceFileRow> = job
                .source_files
                .iter()
                .enumerate()
                .map(|(i, f)| SourceFileRow {
                    position: i as u32,
                    path: f.path.clone(),
                    content: f.content.clone(),
                })
                .collect();
            job_repo::insert(db, &job_to_row(&job, seq), &files)
        });
        self.events.send(JobEvent::new(&job, JobEventKind::Created));

        log::debug!("Created job {} ({})", id, job.name);
        inner.jobs.insert(
            id.clone(),
            Entry {
                job,
                attempts: Vec::new(),
                seq,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        self.read()
            .jobs
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Job and its attempts, read under one lock.
    pub fn snapshot(&self, id: &JobId) -> Result<(Job, Vec<StageAttempt>), StoreError> {
        self.read()
            .jobs
            .get(id)
            .map(|e| (e.job.clone(), e.attempts.clone()))
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub fn attempts(&self, id: &JobId) -> Result<Vec<StageAttempt>, StoreError> {
        self.snapshot(id).map(|(_, attempts)| attempts)
    }

    /// Jobs newest first. Jobs created in the same instant keep their
    /// reverse insertion order.
    pub fn list(&self, query: &JobQuery) -> Vec<Job> {
        let inner = self.read();
        let mut entries: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| query.status.map_or(true, |s| e.job.status == s))
            .collect();
        entries.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|e| e.job.clone())
            .collect()
    }

    /// Number of known jobs.
    pub fn len(&self) -> usize {
        self.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compare-and-set on the job status.
    ///
    /// Fails with `Conflict` when the recorded status is not `from`. `from ==
    /// to` performs an in-place update of the counters for a non-terminal
    /// job. Once a cancellation has been requested only `Cancelled` is
    /// accepted.
    pub fn transition(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, StoreError> {
        let mut inner = self.write();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let job = &mut entry.job;

        if job.status != from {
            return Err(StoreError::Conflict {
                job_id: id.clone(),
                expected: from,
                actual: job.status,
            });
        }
        if from.is_terminal() {
            return Err(StoreError::Terminal {
                job_id: id.clone(),
                status: from,
            });
        }
        if from != to && !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        if job.cancel_requested && to != JobStatus::Cancelled {
            return Err(StoreError::CancellationPending(id.clone()));
        }

        let now = Utc::now();
        job.status = to;
        if from == JobStatus::Pending && to == JobStatus::Analyzing && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if to == JobStatus::Compiling && from != JobStatus::Compiling {
            job.compile_attempts += 1;
        }
        if fields.bump_retry {
            job.retry_count += 1;
        }
        if to == JobStatus::Failed {
            job.error_message = fields.error_message;
        }
        if to == JobStatus::Completed {
            job.output_file_path = fields.output_file_path;
        }
        if let Some(worker) = fields.worker {
            job.worker = Some(worker);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }

        let job = job.clone();
        let seq = entry.seq;
        self.persist("transition", id, |db| job_repo::update(db, &job_to_row(&job, seq)));

        let kind = if from == to {
            JobEventKind::Updated
        } else {
            JobEventKind::Transitioned { from }
        };
        self.events.send(JobEvent::new(&job, kind));

        log::debug!("Job {}: {} -> {}", id, from, to);
        Ok(job)
    }

    /// Records a cancellation request.
    ///
    /// A `Pending` job is cancelled on the spot; a running job only gets the
    /// advisory flag. Terminal jobs are rejected.
    pub fn request_cancel(&self, id: &JobId) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.write();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let job = &mut entry.job;

        if job.status.is_terminal() {
            return Err(StoreError::Terminal {
                job_id: id.clone(),
                status: job.status,
            });
        }

        let outcome = if job.status == JobStatus::Pending {
            let from = job.status;
            job.status = JobStatus::Cancelled;
            job.cancel_requested = true;
            job.completed_at = Some(Utc::now());
            let job = job.clone();
            self.events
                .send(JobEvent::new(&job, JobEventKind::Transitioned { from }));
            CancelOutcome::Cancelled(job)
        } else {
            job.cancel_requested = true;
            let job = job.clone();
            self.events
                .send(JobEvent::new(&job, JobEventKind::CancelRequested));
            CancelOutcome::Flagged(job)
        };

        let (CancelOutcome::Cancelled(job) | CancelOutcome::Flagged(job)) = &outcome;
        let seq = entry.seq;
        self.persist("cancellation", id, |db| job_repo::update(db, &job_to_row(job, seq)));

        log::info!("Cancellation requested for job {} ({})", id, job.status);
        Ok(outcome)
    }

    /// Opens the next attempt of `stage` for a running job.
    pub fn open_attempt(&self, id: &JobId, stage: Stage) -> Result<StageAttempt, StoreError> {
        let mut inner = self.write();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if entry.job.status.is_terminal() {
            return Err(StoreError::Terminal {
                job_id: id.clone(),
                status: entry.job.status,
            });
        }

        let number = entry.attempts.iter().filter(|a| a.stage == stage).count() as u32 + 1;
        let attempt = StageAttempt::open(id.clone(), stage, number);
        self.persist("attempt", id, |db| attempt_repo::insert(db, &attempt_to_row(&attempt)));
        entry.attempts.push(attempt.clone());
        Ok(attempt)
    }

    /// Closes an open attempt. Closed attempts are never modified again.
    pub fn close_attempt(
        &self,
        id: &JobId,
        stage: Stage,
        attempt_number: u32,
        close: AttemptClose,
    ) -> Result<StageAttempt, StoreError> {
        let mut inner = self.write();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let attempt = entry
            .attempts
            .iter_mut()
            .find(|a| a.stage == stage && a.attempt_number == attempt_number && !a.is_closed())
            .ok_or_else(|| StoreError::AttemptNotOpen {
                job_id: id.clone(),
                stage,
                attempt: attempt_number,
            })?;

        attempt.ended_at = Some(Utc::now());
        attempt.outcome = Some(close.outcome);
        attempt.detail = close.detail;
        attempt.metrics = close.metrics;

        let attempt = attempt.clone();
        self.persist("attempt", id, |db| attempt_repo::close(db, &attempt_to_row(&attempt)));
        Ok(attempt)
    }

    /// Replaces the cache with everything recorded in the database.
    ///
    /// Returns the number of jobs loaded. No collaborator is involved: status,
    /// counters and attempts come back exactly as committed.
    pub fn load_from_database(&self) -> Result<usize, DatabaseError> {
        let Some(db) = self.get_database() else {
            return Ok(0);
        };

        let rows = job_repo::list_all(&db)?;
        let mut jobs = HashMap::with_capacity(rows.len());
        let mut max_seq = 0;
        for row in rows {
            let files = job_repo::source_files(&db, &row.id)?;
            let attempts = attempt_repo::list_for_job(&db, &row.id)?
                .into_iter()
                .map(row_to_attempt)
                .collect::<Result<Vec<_>, _>>()?;
            let seq = row.seq;
            max_seq = max_seq.max(seq);
            let job = row_to_job(row, files)?;
            jobs.insert(job.id.clone(), Entry { job, attempts, seq });
        }

        let count = jobs.len();
        let mut inner = self.write();
        inner.jobs = jobs;
        inner.next_seq = max_seq + 1;

        log::info!("Loaded {} jobs from database", count);
        Ok(count)
    }
}
