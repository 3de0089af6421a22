use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::JobId;
use super::status::{ParseEnumError, Stage};

/// Metric keys recorded on stage attempts.
pub mod metric {
    pub const FUNCTIONS: &str = "functions";
    pub const STRUCTS: &str = "structs";
    pub const SQL: &str = "sql";
    pub const GENERATED_FILES: &str = "generated_files";
    pub const DIAGNOSTICS: &str = "diagnostics";
    pub const TESTS_PASSED: &str = "tests_passed";
    pub const TESTS_FAILED: &str = "tests_failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "failure" => Ok(AttemptOutcome::Failure),
            "timeout" => Ok(AttemptOutcome::Timeout),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

/// One execution of one stage. Append-only: opened when the attempt starts,
/// closed exactly once when it resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAttempt {
    pub job_id: JobId,
    pub stage: Stage,
    /// 1-based, counted per (job, stage).
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, u64>,
}

impl StageAttempt {
    pub fn open(job_id: JobId, stage: Stage, attempt_number: u32) -> Self {
        Self {
            job_id,
            stage,
            attempt_number,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            detail: String::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Some(AttemptOutcome::Success)
    }

    pub fn metric(&self, key: &str) -> Option<u64> {
        self.metrics.get(key).copied()
    }
}

/// Closing data for an open attempt.
#[derive(Debug, Clone)]
pub struct AttemptClose {
    pub outcome: AttemptOutcome,
    pub detail: String,
    pub metrics: BTreeMap<String, u64>,
}

impl AttemptClose {
    pub fn new(outcome: AttemptOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: detail.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: u64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }
}
