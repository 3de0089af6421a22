//! Job scheduler: admission, stage sequencing and cancellation.
//!
//! A fixed number of slot tasks pull jobs from the [`AdmissionQueue`] and
//! drive them through the stages. Only the scheduler changes job status, and
//! only through compare-and-set transitions on the [`JobStore`]. Cancellation
//! is checked before every stage and again when a stage result arrives.

pub mod admission;
pub mod machine;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broadcast::{
    CancelOutcome, JobEvent, JobEventBroadcaster, JobQuery, JobStore, LogSink, LogSubscription,
    TransitionFields,
};
use crate::config::{validate_settings, Settings};
use crate::db::Database;
use crate::error::{CodeshiftError, SchedulerError, StorageError, StoreError};
use crate::job::{
    AttemptClose, AttemptOutcome, Job, JobId, JobStatus, JobSubmission, StageAttempt,
};
use crate::pipeline::{
    Converter, ExecutionContext, StageInput, StageOutcome, StageRunner, Verifier,
};
use crate::status::{self, DetailedStatus, JobCounts, StatusProjector};
use crate::storage::FileStorage;

pub use admission::{validate_submission, AdmissionQueue};
pub use machine::{decide, Decision};

const INTERRUPTED: &str = "interrupted by restart";

/// What [`JobScheduler::resume_interrupted`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub requeued: usize,
    pub failed: usize,
    pub cancelled: usize,
}

fn lookup_error(e: StoreError) -> SchedulerError {
    match e {
        StoreError::NotFound(id) => SchedulerError::NotFound(id),
        other => SchedulerError::Store(other),
    }
}

struct Shared {
    settings: Settings,
    store: Arc<JobStore>,
    logs: Arc<LogSink>,
    runner: StageRunner,
    storage: FileStorage,
    queue: AdmissionQueue,
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock_tokens(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Cancellation token lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn token_for(&self, id: &JobId) -> CancellationToken {
        self.lock_tokens()
            .entry(id.clone())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn enqueue(&self, job: &Job) {
        self.token_for(&job.id);
        self.queue.push(job.id.clone(), job.priority);
    }

    /// Closes the log and forgets the token of a job that reached a terminal
    /// status. Safe to call more than once.
    fn finalize(&self, job: &Job) {
        let line = match job.status {
            JobStatus::Completed => format!(
                "Job completed; output in {}",
                job.output_file_path.as_deref().unwrap_or("<none>")
            ),
            JobStatus::Failed => format!(
                "Job failed: {}",
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
            _ => format!("Job {}", job.status.as_str().to_lowercase()),
        };
        let closed = self
            .logs
            .close(&job.id, job.status, Some(&format!("{}\n", line)));
        self.lock_tokens().remove(&job.id);
        if closed {
            info!(
                job_id = %job.id,
                status = %job.status,
                retry_count = job.retry_count,
                compile_attempts = job.compile_attempts,
                "Job finished"
            );
        }
    }

    /// Re-reads a job after a lost transition and finalizes it if another
    /// writer already ended it.
    fn settle(&self, id: &JobId) {
        if let Ok(job) = self.store.get(id) {
            if job.status.is_terminal() {
                self.finalize(&job);
            }
        }
    }

    /// Commits a transition. Returns the job when it should keep running.
    fn commit(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Option<Job> {
        match self.store.transition(id, from, to, fields) {
            Ok(job) if job.status.is_terminal() => {
                self.finalize(&job);
                None
            }
            Ok(job) => Some(job),
            Err(StoreError::CancellationPending(_)) => {
                self.cancel_now(id, from);
                None
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Transition lost, re-reading job");
                self.settle(id);
                None
            }
        }
    }

    fn cancel_now(&self, id: &JobId, from: JobStatus) {
        match self
            .store
            .transition(id, from, JobStatus::Cancelled, TransitionFields::default())
        {
            Ok(job) => self.finalize(&job),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Cancellation transition lost, re-reading job");
                self.settle(id);
            }
        }
    }

    async fn drive(&self, id: JobId, slot: usize) {
        let job = match self.store.get(&id) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Queued job disappeared");
                return;
            }
        };
        if job.status != JobStatus::Pending {
            debug!(status = %job.status, "Skipping job that is no longer pending");
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let token = self.token_for(&id);
        let worker = format!("slot-{}", slot);
        let admitted = TransitionFields {
            worker: Some(worker.clone()),
            ..Default::default()
        };
        let Some(mut job) = self.commit(&id, JobStatus::Pending, JobStatus::Analyzing, admitted)
        else {
            return;
        };
        self.logs.append(&id, &format!("Job admitted on {}\n", worker));
        info!(profile = %job.target_profile, files = job.source_files.len(), "Job admitted");

        let ctx = ExecutionContext::new(
            &job,
            self.settings.profile(&job.target_profile),
            token.clone(),
        );
        let max_retries = self.settings.retry.max_retries;
        let mut input = StageInput::default();

        loop {
            let status = job.status;
            if job.cancel_requested || token.is_cancelled() {
                self.cancel_now(&id, status);
                return;
            }
            if self.shutdown.is_cancelled() {
                info!(status = %status, "Scheduler shutting down; leaving job for recovery");
                return;
            }
            let Some(stage) = status.stage() else {
                return;
            };

            let result = self.runner.run(&job, stage, &input, &ctx).await;

            let current = match self.store.get(&id) {
                Ok(current) => current,
                Err(_) => return,
            };
            if current.cancel_requested
                || token.is_cancelled()
                || result.outcome == StageOutcome::Cancelled
            {
                self.cancel_now(&id, status);
                return;
            }
            if result.is_success() {
                if let Some(artifact) = &result.artifact {
                    input.absorb(artifact);
                }
            }

            let decision = decide(status, &result, current.retry_count, max_retries);
            debug!(stage = %stage, outcome = ?result.outcome, decision = ?decision, "Stage resolved");

            let next = match decision {
                Decision::Advance(JobStatus::Completed) => {
                    self.complete(&id, &input).await;
                    return;
                }
                Decision::Advance(next) => {
                    self.commit(&id, status, next, TransitionFields::default())
                }
                Decision::LoopBack(feedback) => {
                    self.logs.append(
                        &id,
                        &format!(
                            "{} failed; back to conversion (retry {} of {})\n",
                            stage,
                            current.retry_count + 1,
                            max_retries
                        ),
                    );
                    input.feedback = Some(feedback);
                    self.commit(&id, status, JobStatus::Converting, TransitionFields::retry())
                }
                Decision::Rerun => {
                    self.logs.append(
                        &id,
                        &format!(
                            "{} failed; running it again (retry {} of {})\n",
                            stage,
                            current.retry_count + 1,
                            max_retries
                        ),
                    );
                    self.commit(&id, status, status, TransitionFields::retry())
                }
                Decision::Fail(message) => {
                    self.commit(&id, status, JobStatus::Failed, TransitionFields::failed(message))
                }
                Decision::Cancel => {
                    self.cancel_now(&id, status);
                    None
                }
            };
            match next {
                Some(updated) => job = updated,
                None => return,
            }
        }
    }

    /// Writes the approved output and ends the job.
    async fn complete(&self, id: &JobId, input: &StageInput) {
        let files = input.generated.clone().unwrap_or_default().files;
        let storage = self.storage.clone();
        let job_id = id.clone();
        let stored = tokio::task::spawn_blocking(move || storage.store_output(&job_id, &files))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))
            .and_then(|result| result);

        match stored {
            Ok(dir) => {
                self.commit(
                    id,
                    JobStatus::Reviewing,
                    JobStatus::Completed,
                    TransitionFields::completed(dir.display().to_string()),
                );
            }
            Err(e) => {
                error!(error = %e, "Storing generated output failed");
                self.commit(
                    id,
                    JobStatus::Reviewing,
                    JobStatus::Failed,
                    TransitionFields::failed(format!("storing output failed: {}", e)),
                );
            }
        }
    }
}

async fn run_slot(shared: Arc<Shared>, slot: usize) {
    debug!(slot, "Scheduler slot started");
    loop {
        let id = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            id = shared.queue.pop() => id,
        };
        let span = info_span!("job", job_id = %id, slot);
        shared.drive(id, slot).instrument(span).await;
    }
    debug!(slot, "Scheduler slot stopped");
}

async fn next_update(
    rx: &mut broadcast::Receiver<JobEvent>,
    store: &JobStore,
    id: &JobId,
) -> Option<DetailedStatus> {
    loop {
        match rx.recv().await {
            Ok(event) if event.job_id != *id => continue,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(job_id = %id, skipped, "Status update stream lagged");
            }
            Err(RecvError::Closed) => return None,
        }
        let (job, attempts) = store.snapshot(id).ok()?;
        return Some(StatusProjector::project(&job, &attempts));
    }
}

struct UpdateState {
    rx: broadcast::Receiver<JobEvent>,
    pending: Option<DetailedStatus>,
    done: bool,
}

/// Owns the job state machine and the slots that run jobs.
pub struct JobScheduler {
    shared: Arc<Shared>,
    slots: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Builds a scheduler from settings, opening the configured database (if
    /// any) and restoring every recorded job and log from it.
    pub fn new(
        settings: Settings,
        converter: Arc<dyn Converter>,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self, CodeshiftError> {
        let db = match &settings.storage.database_path {
            Some(path) => Some(Database::open(path)?),
            None => None,
        };
        Self::with_database(settings, db, converter, verifier)
    }

    pub fn with_database(
        settings: Settings,
        db: Option<Database>,
        converter: Arc<dyn Converter>,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self, CodeshiftError> {
        validate_settings(&settings)?;

        let events = JobEventBroadcaster::new(settings.logging.event_capacity);
        let store = Arc::new(JobStore::new(events));
        let logs = Arc::new(LogSink::new());

        if let Some(db) = db {
            store.set_database(db.clone());
            store.load_from_database()?;
            logs.set_database(db);
            logs.load_from_database(|id| {
                store
                    .get(id)
                    .ok()
                    .map(|job| job.status)
                    .filter(|status| status.is_terminal())
            })?;
            for job in store.list(&JobQuery::default()) {
                if job.status.is_terminal() {
                    logs.close(&job.id, job.status, None);
                } else {
                    logs.register(&job.id);
                }
            }
        }

        let runner = StageRunner::new(
            converter,
            verifier,
            Arc::clone(&store),
            Arc::clone(&logs),
            &settings,
        );
        let storage = FileStorage::new(&settings.storage.output_directory);

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                store,
                logs,
                runner,
                storage,
                queue: AdmissionQueue::new(),
                tokens: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
            slots: Mutex::new(Vec::new()),
        })
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Scheduler slot lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Spawns the slot tasks. Must run inside a tokio runtime; calling it
    /// again is a no-op.
    pub fn start(&self) {
        let mut slots = self.lock_slots();
        if !slots.is_empty() || self.shared.shutdown.is_cancelled() {
            return;
        }
        let count = self.shared.settings.scheduler.max_concurrent_jobs.max(1);
        for slot in 0..count {
            slots.push(tokio::spawn(run_slot(Arc::clone(&self.shared), slot)));
        }
        info!(slots = count, "Scheduler started");
    }

    /// Stops admitting jobs and waits for the slots to stop. A running job
    /// finishes its current stage and stays at that status for
    /// [`resume_interrupted`](Self::resume_interrupted) to handle.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles = std::mem::take(&mut *self.lock_slots());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler slot panicked");
            }
        }
        info!("Scheduler stopped");
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.shared.store
    }

    pub fn logs(&self) -> &Arc<LogSink> {
        &self.shared.logs
    }

    /// Validates and records a new job, then queues it for admission.
    pub fn submit(&self, submission: JobSubmission) -> Result<JobId, SchedulerError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(crate::error::SubmitError::ShuttingDown.into());
        }
        validate_submission(&self.shared.settings, &submission)?;

        let job = Job::from_submission(submission);
        let id = job.id.clone();
        self.shared.logs.register(&id);
        self.shared.store.create(job.clone())?;
        self.shared.enqueue(&job);

        info!(
            job_id = %id,
            priority = job.priority,
            files = job.source_files.len(),
            bytes = job.total_source_bytes(),
            "Job submitted"
        );
        Ok(id)
    }

    /// Requests cancellation.
    ///
    /// A job still waiting for admission is cancelled immediately. A running
    /// job is flagged and its token fired; it ends `Cancelled` at the next
    /// checkpoint.
    pub fn cancel(&self, id: &JobId) -> Result<Job, SchedulerError> {
        match self.shared.store.request_cancel(id) {
            Ok(CancelOutcome::Cancelled(job)) => {
                self.shared.finalize(&job);
                Ok(job)
            }
            Ok(CancelOutcome::Flagged(job)) => {
                if let Some(token) = self.shared.lock_tokens().get(id) {
                    token.cancel();
                }
                self.shared
                    .logs
                    .append(id, &format!("Cancellation requested during {}\n", job.status));
                Ok(job)
            }
            Err(StoreError::Terminal { job_id, status }) => {
                Err(SchedulerError::AlreadyTerminal { job_id, status })
            }
            Err(e) => Err(lookup_error(e)),
        }
    }

    pub fn job(&self, id: &JobId) -> Result<Job, SchedulerError> {
        self.shared.store.get(id).map_err(lookup_error)
    }

    pub fn attempts(&self, id: &JobId) -> Result<Vec<StageAttempt>, SchedulerError> {
        self.shared.store.attempts(id).map_err(lookup_error)
    }

    pub fn detailed_status(&self, id: &JobId) -> Result<DetailedStatus, SchedulerError> {
        let (job, attempts) = self.shared.store.snapshot(id).map_err(lookup_error)?;
        Ok(StatusProjector::project(&job, &attempts))
    }

    pub fn list(&self, query: &JobQuery) -> Vec<Job> {
        self.shared.store.list(query)
    }

    pub fn counts(&self) -> JobCounts {
        status::summarize(&self.shared.store.list(&JobQuery::default()))
    }

    /// Jobs waiting for a slot, including cancelled ones not yet popped.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn log_snapshot(&self, id: &JobId) -> Result<String, SchedulerError> {
        self.job(id)?;
        Ok(self.shared.logs.snapshot(id)?)
    }

    /// Live log: snapshot so far, then new chunks, then the end marker.
    pub fn subscribe_logs(&self, id: &JobId) -> Result<LogSubscription, SchedulerError> {
        self.job(id)?;
        Ok(self.shared.logs.subscribe(id)?)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.store.subscribe()
    }

    /// Current status, then a fresh projection after every committed change
    /// of the job. Ends after the first terminal status.
    pub fn status_updates(
        &self,
        id: &JobId,
    ) -> Result<BoxStream<'static, DetailedStatus>, SchedulerError> {
        let rx = self.shared.store.subscribe();
        let first = self.detailed_status(id)?;
        let store = Arc::clone(&self.shared.store);
        let id = id.clone();

        let state = UpdateState {
            rx,
            pending: Some(first),
            done: false,
        };
        let updates = stream::unfold(state, move |mut state| {
            let store = Arc::clone(&store);
            let id = id.clone();
            async move {
                if state.done {
                    return None;
                }
                let status = match state.pending.take() {
                    Some(status) => status,
                    None => next_update(&mut state.rx, &store, &id).await?,
                };
                state.done = status.status.is_terminal();
                Some((status, state))
            }
        });
        Ok(updates.boxed())
    }

    /// Resolves once the job is terminal.
    pub async fn wait_for_terminal(&self, id: &JobId) -> Result<Job, SchedulerError> {
        let mut rx = self.shared.store.subscribe();
        loop {
            let job = self.job(id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            match rx.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(SchedulerError::ShutDown),
            }
        }
    }

    /// Handles jobs restored from the database after a restart.
    ///
    /// `Pending` jobs are queued again in submission order. Jobs recovered
    /// mid-stage end `Failed` (or `Cancelled` if a cancellation was already
    /// recorded); their open attempts are closed. No collaborator call is
    /// replayed. Jobs submitted through this scheduler are left alone.
    pub fn resume_interrupted(&self) -> Recovery {
        let shared = &self.shared;
        let mut recovery = Recovery::default();

        let mut jobs = shared.store.list(&JobQuery::default());
        jobs.reverse();
        for job in jobs {
            if job.status.is_terminal() || shared.lock_tokens().contains_key(&job.id) {
                continue;
            }
            if job.status == JobStatus::Pending {
                shared.enqueue(&job);
                recovery.requeued += 1;
                continue;
            }

            if let Ok(attempts) = shared.store.attempts(&job.id) {
                for attempt in attempts.iter().filter(|a| !a.is_closed()) {
                    let close = AttemptClose::new(AttemptOutcome::Failure, INTERRUPTED);
                    if let Err(e) =
                        shared
                            .store
                            .close_attempt(&job.id, attempt.stage, attempt.attempt_number, close)
                    {
                        warn!(job_id = %job.id, error = %e, "Could not close interrupted attempt");
                    }
                }
            }

            if job.cancel_requested {
                shared.cancel_now(&job.id, job.status);
                recovery.cancelled += 1;
            } else {
                shared.commit(
                    &job.id,
                    job.status,
                    JobStatus::Failed,
                    TransitionFields::failed(INTERRUPTED),
                );
                recovery.failed += 1;
            }
        }

        info!(
            requeued = recovery.requeued,
            failed = recovery.failed,
            cancelled = recovery.cancelled,
            "Recovered jobs after restart"
        );
        recovery
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
