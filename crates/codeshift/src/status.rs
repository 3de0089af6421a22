//! Read-side projections of committed job state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{metric, AttemptOutcome, Job, JobId, JobStatus, Stage, StageAttempt};

/// Progress shown when a job has reached `status`.
pub fn progress_weight(status: JobStatus) -> u8 {
    match status {
        JobStatus::Pending => 0,
        JobStatus::Analyzing => 10,
        JobStatus::Converting => 30,
        JobStatus::Compiling => 65,
        JobStatus::Testing => 85,
        JobStatus::Reviewing => 95,
        JobStatus::Completed => 100,
        JobStatus::Failed | JobStatus::Cancelled => 0,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    pub function_count: Option<u64>,
    pub struct_count: Option<u64>,
    pub sql_count: Option<u64>,
    pub generated_files: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResults {
    /// Latest compile verdict, once compilation has run.
    pub compile_success: Option<bool>,
    pub test_success: Option<bool>,
    pub tests_passed: Option<u64>,
    pub tests_failed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStatus {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub current_stage: Option<Stage>,
    pub progress_percent: u8,
    pub stage_metrics: StageMetrics,
    pub verification_results: VerificationResults,
    pub retry_count: u32,
    pub compile_attempts: u32,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn latest<'a>(
    attempts: &'a [StageAttempt],
    stage: Stage,
    accept: impl Fn(&StageAttempt) -> bool,
) -> Option<&'a StageAttempt> {
    attempts
        .iter()
        .rev()
        .find(|a| a.stage == stage && a.is_closed() && accept(*a))
}

/// Builds client-facing views from a job and its attempts.
pub struct StatusProjector;

impl StatusProjector {
    pub fn project(job: &Job, attempts: &[StageAttempt]) -> DetailedStatus {
        let current_stage = job.status.stage().or_else(|| match job.status {
            JobStatus::Failed | JobStatus::Cancelled => attempts.last().map(|a| a.stage),
            _ => None,
        });

        let analysis = latest(attempts, Stage::Analyze, StageAttempt::succeeded);
        let conversion = latest(attempts, Stage::Convert, StageAttempt::succeeded);
        let verdict = |a: &StageAttempt| a.outcome != Some(AttemptOutcome::Timeout);
        let compile = latest(attempts, Stage::Compile, verdict);
        let test = latest(attempts, Stage::Test, verdict);

        DetailedStatus {
            job_id: job.id.clone(),
            name: job.name.clone(),
            status: job.status,
            current_stage,
            progress_percent: Self::progress(job, attempts),
            stage_metrics: StageMetrics {
                function_count: analysis.and_then(|a| a.metric(metric::FUNCTIONS)),
                struct_count: analysis.and_then(|a| a.metric(metric::STRUCTS)),
                sql_count: analysis.and_then(|a| a.metric(metric::SQL)),
                generated_files: conversion.and_then(|a| a.metric(metric::GENERATED_FILES)),
            },
            verification_results: VerificationResults {
                compile_success: compile.map(StageAttempt::succeeded),
                test_success: test.map(StageAttempt::succeeded),
                tests_passed: test.and_then(|a| a.metric(metric::TESTS_PASSED)),
                tests_failed: test.and_then(|a| a.metric(metric::TESTS_FAILED)),
            },
            retry_count: job.retry_count,
            compile_attempts: job.compile_attempts,
            cancel_requested: job.cancel_requested,
            error_message: job.error_message.clone(),
            output_file_path: job.output_file_path.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }

    /// Weight of the furthest stage ever entered, so a loop-back to
    /// conversion never lowers it. Failed and cancelled jobs keep it.
    pub fn progress(job: &Job, attempts: &[StageAttempt]) -> u8 {
        if job.status == JobStatus::Completed {
            return 100;
        }
        let from_attempts = attempts
            .iter()
            .map(|a| progress_weight(a.stage.status()))
            .max()
            .unwrap_or(0);
        progress_weight(job.status).max(from_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub status: JobStatus,
    pub count: usize,
}

/// Aggregate view over all jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub total: usize,
    pub by_status: Vec<StatusCount>,
    /// Jobs past admission and not yet finished.
    pub active: Vec<JobId>,
}

impl JobCounts {
    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status
            .iter()
            .find(|c| c.status == status)
            .map_or(0, |c| c.count)
    }
}

pub fn summarize(jobs: &[Job]) -> JobCounts {
    let by_status = JobStatus::ALL
        .into_iter()
        .map(|status| StatusCount {
            status,
            count: jobs.iter().filter(|j| j.status == status).count(),
        })
        .collect();
    let active = jobs
        .iter()
        .filter(|j| j.status.stage().is_some())
        .map(|j| j.id.clone())
        .collect();
    JobCounts {
        total: jobs.len(),
        by_status,
        active,
    }
}
