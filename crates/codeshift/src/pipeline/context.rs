use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::collaborator::{AnalysisReport, CompileReport, GeneratedFiles, ReviewVerdict, TestReport};
use crate::config::ProfileSettings;
use crate::job::{Job, JobId, Stage};

/// Per-job execution profile. Built once when the job is admitted and passed
/// to every collaborator call; never shared between jobs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub profile_id: String,
    pub llm_provider: Option<String>,
    pub cli_tool: Option<String>,
    /// Opaque rule set for the target profile.
    pub rules: Option<serde_json::Value>,
    /// Cancelled when the job is cancelled. Collaborators may watch it to
    /// abort cooperatively.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(job: &Job, profile: Option<&ProfileSettings>, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.id.clone(),
            profile_id: job.target_profile.clone(),
            llm_provider: profile.and_then(|p| p.llm_provider.clone()),
            cli_tool: profile.and_then(|p| p.cli_tool.clone()),
            rules: profile.and_then(|p| p.rules.clone()),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Diagnostics from a failed verification or review, threaded into the next
/// conversion attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// Stage whose failure produced this feedback.
    pub stage: Stage,
    /// One-line summary.
    pub summary: String,
    /// Full collaborator output.
    pub diagnostics: String,
}

/// Output of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageArtifact {
    Analysis(AnalysisReport),
    Generated(GeneratedFiles),
    Compiled(CompileReport),
    Tested(TestReport),
    Reviewed(ReviewVerdict),
}

impl StageArtifact {
    /// Full failure text when the collaborator ran but rejected the work.
    pub fn rejection(&self) -> Option<String> {
        match self {
            StageArtifact::Compiled(report) if !report.success => Some(report.diagnostics.clone()),
            StageArtifact::Tested(report) if !report.success => Some(report.report.clone()),
            StageArtifact::Reviewed(verdict) if !verdict.approved => Some(
                verdict
                    .feedback
                    .clone()
                    .unwrap_or_else(|| "changes requested".to_string()),
            ),
            _ => None,
        }
    }
}

/// Artifacts from earlier stages of the same job.
#[derive(Debug, Clone, Default)]
pub struct StageInput {
    pub analysis: Option<AnalysisReport>,
    pub generated: Option<GeneratedFiles>,
    pub test_report: Option<TestReport>,
    pub feedback: Option<Feedback>,
}

impl StageInput {
    /// Keeps what later stages need from a finished stage.
    pub fn absorb(&mut self, artifact: &StageArtifact) {
        match artifact {
            StageArtifact::Analysis(report) => self.analysis = Some(report.clone()),
            StageArtifact::Generated(files) => {
                self.generated = Some(files.clone());
                self.test_report = None;
            }
            StageArtifact::Tested(report) => self.test_report = Some(report.clone()),
            StageArtifact::Compiled(_) | StageArtifact::Reviewed(_) => {}
        }
    }
}
