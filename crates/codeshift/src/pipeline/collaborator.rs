//! Contracts for the external systems a stage calls out to.
//!
//! The LLM-driven converter and the compiler/test toolchain live outside this
//! crate. They receive the job's [`ExecutionContext`] explicitly and stream
//! progress through a [`StageOutput`] while they work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::{ExecutionContext, Feedback};
use super::error::CollaboratorError;
use super::output::StageOutput;
use crate::job::SourceFile;

/// Result of analyzing a source batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub function_count: u64,
    pub struct_count: u64,
    pub sql_count: u64,
    /// Opaque analysis output handed back to the converter.
    #[serde(default)]
    pub artifacts: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// Relative to the project root.
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFiles {
    pub files: Vec<GeneratedFile>,
}

impl GeneratedFiles {
    pub fn new(files: Vec<GeneratedFile>) -> Self {
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileReport {
    pub success: bool,
    pub diagnostics: String,
}

impl CompileReport {
    /// Non-blank diagnostic lines.
    pub fn diagnostic_count(&self) -> u64 {
        self.diagnostics
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count() as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub success: bool,
    pub report: String,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// LLM-driven analysis, conversion and review.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn analyze(
        &self,
        files: &[SourceFile],
        ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<AnalysisReport, CollaboratorError>;

    /// `feedback` carries the diagnostics of the failure that sent the job
    /// back to conversion, if any.
    async fn convert(
        &self,
        analysis: &AnalysisReport,
        feedback: Option<&Feedback>,
        ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<GeneratedFiles, CollaboratorError>;

    async fn review(
        &self,
        generated: &GeneratedFiles,
        tests: &TestReport,
        ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<ReviewVerdict, CollaboratorError>;
}

/// Compiler and test-runner toolchain.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn compile(
        &self,
        generated: &GeneratedFiles,
        ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<CompileReport, CollaboratorError>;

    async fn test(
        &self,
        generated: &GeneratedFiles,
        ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<TestReport, CollaboratorError>;
}
