//! Job state machine: what a stage result means for the job.
//!
//! Pure functions only; the scheduler commits the decision through the job
//! store.

use crate::job::{JobStatus, Stage};
use crate::pipeline::{FailureClass, Feedback, StageOutcome, StageResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Move on to the next status. `Completed` follows a successful review.
    Advance(JobStatus),
    /// Back to `Converting` with the failure threaded in; costs one retry.
    LoopBack(Feedback),
    /// Run the same stage again in place; costs one retry.
    Rerun,
    Fail(String),
    Cancel,
}

/// Next status after a successful stage.
pub fn next_status(status: JobStatus) -> Option<JobStatus> {
    match status {
        JobStatus::Analyzing => Some(JobStatus::Converting),
        JobStatus::Converting => Some(JobStatus::Compiling),
        JobStatus::Compiling => Some(JobStatus::Testing),
        JobStatus::Testing => Some(JobStatus::Reviewing),
        JobStatus::Reviewing => Some(JobStatus::Completed),
        _ => None,
    }
}

pub fn budget_exhausted_message(retry_count: u32, stage: Stage, detail: &str) -> String {
    format!(
        "retry budget exhausted ({} retries); last {} failure: {}",
        retry_count, stage, detail
    )
}

/// Decides how the job at `status` proceeds after `result`.
///
/// Analysis failures are terminal. Any other failure needs
/// `retry_count < max_retries` to loop; semantic failures of compile, test
/// and review go back to conversion, everything else re-runs in place.
pub fn decide(status: JobStatus, result: &StageResult, retry_count: u32, max_retries: u32) -> Decision {
    let class = match result.outcome {
        StageOutcome::Cancelled => return Decision::Cancel,
        StageOutcome::Success => {
            return match next_status(status) {
                Some(next) => Decision::Advance(next),
                None => Decision::Fail(format!("no stage follows {}", status)),
            };
        }
        outcome => outcome
            .failure_class()
            .unwrap_or(FailureClass::Infrastructure),
    };

    if result.stage == Stage::Analyze {
        return Decision::Fail(format!("analysis failed: {}", result.detail));
    }
    if retry_count >= max_retries {
        return Decision::Fail(budget_exhausted_message(
            retry_count,
            result.stage,
            &result.detail,
        ));
    }

    match (class, result.stage) {
        (FailureClass::Semantic, Stage::Compile | Stage::Test | Stage::Review) => {
            let diagnostics = result
                .artifact
                .as_ref()
                .and_then(|a| a.rejection())
                .unwrap_or_else(|| result.detail.clone());
            Decision::LoopBack(Feedback {
                stage: result.stage,
                summary: result.detail.clone(),
                diagnostics,
            })
        }
        _ => Decision::Rerun,
    }
}
