use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::broadcast::{JobStore, LogSink};
use crate::config::{RetrySettings, Settings, TimeoutSettings};
use crate::job::{metric, AttemptClose, AttemptOutcome, Job, Stage};
use crate::sanitize::{self, DETAIL_LIMIT};

use super::collaborator::{Converter, Verifier};
use super::context::{ExecutionContext, StageArtifact, StageInput};
use super::error::{CollaboratorError, FailureClass};
use super::output::{LogSession, StageOutput};

/// How a stage execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure(FailureClass),
    /// Every try hit the stage timeout.
    Timeout,
    /// The job's cancellation token fired during the stage.
    Cancelled,
}

impl StageOutcome {
    /// Failure class for the retry policy; timeouts count as infrastructure.
    pub fn failure_class(self) -> Option<FailureClass> {
        match self {
            StageOutcome::Failure(class) => Some(class),
            StageOutcome::Timeout => Some(FailureClass::Infrastructure),
            StageOutcome::Success | StageOutcome::Cancelled => None,
        }
    }
}

/// Tagged result of one stage execution, including any in-runner retries.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
    /// One-line summary of the last try.
    pub detail: String,
    /// Produced by the last try, also when the collaborator rejected the work.
    pub artifact: Option<StageArtifact>,
    /// Tries made, each recorded as a stage attempt.
    pub attempts: u32,
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        self.outcome == StageOutcome::Success
    }
}

enum Invocation {
    Finished(Result<StageArtifact, CollaboratorError>),
    TimedOut,
    Cancelled,
}

impl From<Result<Result<StageArtifact, CollaboratorError>, tokio::time::error::Elapsed>>
    for Invocation
{
    fn from(result: Result<Result<StageArtifact, CollaboratorError>, tokio::time::error::Elapsed>) -> Self {
        match result {
            Ok(finished) => Invocation::Finished(finished),
            Err(_) => Invocation::TimedOut,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn metrics_for(artifact: &StageArtifact) -> Vec<(&'static str, u64)> {
    match artifact {
        StageArtifact::Analysis(report) => vec![
            (metric::FUNCTIONS, report.function_count),
            (metric::STRUCTS, report.struct_count),
            (metric::SQL, report.sql_count),
        ],
        StageArtifact::Generated(files) => vec![(metric::GENERATED_FILES, files.len() as u64)],
        StageArtifact::Compiled(report) => vec![(metric::DIAGNOSTICS, report.diagnostic_count())],
        StageArtifact::Tested(report) => vec![
            (metric::TESTS_PASSED, report.passed),
            (metric::TESTS_FAILED, report.failed),
        ],
        StageArtifact::Reviewed(_) => Vec::new(),
    }
}

fn success_detail(artifact: &StageArtifact) -> String {
    match artifact {
        StageArtifact::Analysis(r) => format!(
            "{} functions, {} structs, {} SQL statements",
            r.function_count, r.struct_count, r.sql_count
        ),
        StageArtifact::Generated(files) => format!("{} files generated", files.len()),
        StageArtifact::Compiled(_) => "compiled".to_string(),
        StageArtifact::Tested(r) => format!("{} passed, {} failed", r.passed, r.failed),
        StageArtifact::Reviewed(_) => "approved".to_string(),
    }
}

/// Runs single stages against the collaborators.
///
/// Records every try as a stage attempt and streams collaborator output into
/// the job log. Never touches the job status.
pub struct StageRunner {
    converter: Arc<dyn Converter>,
    verifier: Arc<dyn Verifier>,
    store: Arc<JobStore>,
    logs: Arc<LogSink>,
    timeouts: TimeoutSettings,
    retry: RetrySettings,
    abort_in_flight: bool,
}

impl StageRunner {
    pub fn new(
        converter: Arc<dyn Converter>,
        verifier: Arc<dyn Verifier>,
        store: Arc<JobStore>,
        logs: Arc<LogSink>,
        settings: &Settings,
    ) -> Self {
        Self {
            converter,
            verifier,
            store,
            logs,
            timeouts: settings.timeouts.clone(),
            retry: settings.retry.clone(),
            abort_in_flight: settings.scheduler.abort_in_flight_on_cancel,
        }
    }

    /// Executes `stage` for `job`.
    ///
    /// Infrastructure failures and timeouts are tried again up to
    /// `retry.infra_attempts` times in total, with linear backoff. Semantic
    /// failures return immediately.
    pub async fn run(
        &self,
        job: &Job,
        stage: Stage,
        input: &StageInput,
        ctx: &ExecutionContext,
    ) -> StageResult {
        let max_tries = self.retry.infra_attempts.max(1);
        let limit = self.timeouts.for_stage(stage);
        let mut tries = 0;

        loop {
            tries += 1;
            let attempt_number = match self.store.open_attempt(&job.id, stage) {
                Ok(attempt) => attempt.attempt_number,
                Err(e) => {
                    warn!(job_id = %job.id, stage = %stage, error = %e, "Could not open stage attempt");
                    return StageResult {
                        stage,
                        outcome: StageOutcome::Failure(FailureClass::Infrastructure),
                        detail: e.to_string(),
                        artifact: None,
                        attempts: tries - 1,
                    };
                }
            };

            let span = info_span!("stage", job_id = %job.id, stage = %stage, attempt = attempt_number);
            let mut result = self
                .attempt(job, stage, attempt_number, limit, input, ctx)
                .instrument(span)
                .await;
            result.attempts = tries;

            let retryable = result.outcome.failure_class() == Some(FailureClass::Infrastructure);
            if !retryable || tries >= max_tries {
                return result;
            }
            if ctx.is_cancelled() {
                return Self::cancelled(stage, tries);
            }

            let backoff = self.retry.backoff(tries);
            debug!(
                job_id = %job.id,
                stage = %stage,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying after infrastructure failure"
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Self::cancelled(stage, tries),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn cancelled(stage: Stage, attempts: u32) -> StageResult {
        StageResult {
            stage,
            outcome: StageOutcome::Cancelled,
            detail: "cancelled".to_string(),
            artifact: None,
            attempts,
        }
    }

    async fn attempt(
        &self,
        job: &Job,
        stage: Stage,
        attempt_number: u32,
        limit: Duration,
        input: &StageInput,
        ctx: &ExecutionContext,
    ) -> StageResult {
        let session = LogSession::open(Arc::clone(&self.logs), job.id.clone(), stage, attempt_number);
        // A panicking collaborator is an infrastructure failure like any other.
        let call = AssertUnwindSafe(self.invoke(job, stage, input, ctx, &session))
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|payload| {
                    Err(CollaboratorError::Unavailable(format!(
                        "collaborator panicked: {}",
                        panic_message(&*payload)
                    )))
                })
            });

        let invocation = if self.abort_in_flight {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Invocation::Cancelled,
                result = tokio::time::timeout(limit, call) => Invocation::from(result),
            }
        } else {
            Invocation::from(tokio::time::timeout(limit, call).await)
        };

        let (outcome, attempt_outcome, detail, artifact) = match invocation {
            Invocation::Finished(Ok(artifact)) => match artifact.rejection() {
                None => (
                    StageOutcome::Success,
                    AttemptOutcome::Success,
                    success_detail(&artifact),
                    Some(artifact),
                ),
                Some(text) => (
                    StageOutcome::Failure(FailureClass::Semantic),
                    AttemptOutcome::Failure,
                    sanitize::truncate_detail(&text, DETAIL_LIMIT),
                    Some(artifact),
                ),
            },
            Invocation::Finished(Err(e)) => (
                StageOutcome::Failure(e.class()),
                AttemptOutcome::Failure,
                sanitize::truncate_detail(&e.to_string(), DETAIL_LIMIT),
                None,
            ),
            Invocation::TimedOut => (
                StageOutcome::Timeout,
                AttemptOutcome::Timeout,
                format!("timed out after {}s", limit.as_secs()),
                None,
            ),
            Invocation::Cancelled => (
                StageOutcome::Cancelled,
                AttemptOutcome::Failure,
                "cancelled".to_string(),
                None,
            ),
        };

        session.finish(&format!("{}: {}", attempt_outcome, detail));

        let mut close = AttemptClose::new(attempt_outcome, detail.clone());
        if let Some(artifact) = &artifact {
            for (key, value) in metrics_for(artifact) {
                close = close.with_metric(key, value);
            }
        }
        if let Err(e) = self.store.close_attempt(&job.id, stage, attempt_number, close) {
            warn!(error = %e, "Could not close stage attempt");
        }

        match outcome {
            StageOutcome::Success => info!(detail = %detail, "Stage attempt succeeded"),
            _ => info!(outcome = %attempt_outcome, detail = %detail, "Stage attempt did not succeed"),
        }

        StageResult {
            stage,
            outcome,
            detail,
            artifact,
            attempts: 1,
        }
    }

    async fn invoke(
        &self,
        job: &Job,
        stage: Stage,
        input: &StageInput,
        ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<StageArtifact, CollaboratorError> {
        match stage {
            Stage::Analyze => self
                .converter
                .analyze(&job.source_files, ctx, out)
                .await
                .map(StageArtifact::Analysis),
            Stage::Convert => {
                let analysis = input
                    .analysis
                    .as_ref()
                    .ok_or(CollaboratorError::MissingInput("analysis"))?;
                self.converter
                    .convert(analysis, input.feedback.as_ref(), ctx, out)
                    .await
                    .map(StageArtifact::Generated)
            }
            Stage::Compile => {
                let generated = input
                    .generated
                    .as_ref()
                    .ok_or(CollaboratorError::MissingInput("generated files"))?;
                self.verifier
                    .compile(generated, ctx, out)
                    .await
                    .map(StageArtifact::Compiled)
            }
            Stage::Test => {
                let generated = input
                    .generated
                    .as_ref()
                    .ok_or(CollaboratorError::MissingInput("generated files"))?;
                self.verifier
                    .test(generated, ctx, out)
                    .await
                    .map(StageArtifact::Tested)
            }
            Stage::Review => {
                let generated = input
                    .generated
                    .as_ref()
                    .ok_or(CollaboratorError::MissingInput("generated files"))?;
                let tests = input
                    .test_report
                    .as_ref()
                    .ok_or(CollaboratorError::MissingInput("test report"))?;
                self.converter
                    .review(generated, tests, ctx, out)
                    .await
                    .map(StageArtifact::Reviewed)
            }
        }
    }
}
