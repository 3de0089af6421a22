//! Scripted collaborators.
//!
//! Each fake pops the next scripted result for a call and falls back to a
//! successful default when the script is empty. Calls and their inputs are
//! recorded for assertions.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use codeshift::job::{JobId, SourceFile};
use codeshift::pipeline::{
    AnalysisReport, CollaboratorError, CompileReport, Converter, ExecutionContext, Feedback,
    GeneratedFile, GeneratedFiles, ReviewVerdict, StageOutput, TestReport, Verifier,
};

/// Blocks one collaborator call until the test opens it.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once the gated call is in progress.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

type Script<T> = Mutex<VecDeque<Result<T, CollaboratorError>>>;

fn next<T>(script: &Script<T>, default: impl FnOnce() -> T) -> Result<T, CollaboratorError> {
    script.lock().unwrap().pop_front().unwrap_or_else(|| Ok(default()))
}

pub fn default_analysis() -> AnalysisReport {
    AnalysisReport {
        function_count: 4,
        struct_count: 2,
        sql_count: 3,
        artifacts: serde_json::json!({ "units": ["ledger"] }),
    }
}

pub fn default_generated() -> GeneratedFiles {
    GeneratedFiles::new(vec![
        GeneratedFile::new("pom.xml", "<project/>"),
        GeneratedFile::new(
            "src/main/java/com/acme/Ledger.java",
            "public class Ledger {}",
        ),
    ])
}

#[derive(Default)]
pub struct FakeConverter {
    pub analyze_script: Script<AnalysisReport>,
    pub convert_script: Script<GeneratedFiles>,
    pub review_script: Script<ReviewVerdict>,

    pub analyze_calls: AtomicU32,
    pub convert_calls: AtomicU32,
    pub review_calls: AtomicU32,

    /// Job ids in the order they were analyzed.
    pub analyzed: Mutex<Vec<JobId>>,
    /// Feedback passed to each convert call.
    pub feedback_seen: Mutex<Vec<Option<Feedback>>>,
    /// LLM provider of each analyze call's context.
    pub providers_seen: Mutex<Vec<Option<String>>>,

    /// Gates the next analyze / convert call only.
    pub analyze_gate: Mutex<Option<Arc<Gate>>>,
    pub convert_gate: Mutex<Option<Arc<Gate>>>,
    /// Analyze never returns.
    pub hang_analyze: AtomicBool,
    /// Number of upcoming analyze calls that panic.
    pub panic_analyze: AtomicU32,
}

impl FakeConverter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_analyze(&self, result: Result<AnalysisReport, CollaboratorError>) {
        self.analyze_script.lock().unwrap().push_back(result);
    }

    pub fn script_convert(&self, result: Result<GeneratedFiles, CollaboratorError>) {
        self.convert_script.lock().unwrap().push_back(result);
    }

    pub fn script_review(&self, result: Result<ReviewVerdict, CollaboratorError>) {
        self.review_script.lock().unwrap().push_back(result);
    }

    pub fn gate_analyze(&self) -> Arc<Gate> {
        let gate = Gate::new();
        *self.analyze_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn gate_convert(&self) -> Arc<Gate> {
        let gate = Gate::new();
        *self.convert_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> (u32, u32, u32) {
        (
            self.analyze_calls.load(Ordering::SeqCst),
            self.convert_calls.load(Ordering::SeqCst),
            self.review_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl Converter for FakeConverter {
    async fn analyze(
        &self,
        files: &[SourceFile],
        ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<AnalysisReport, CollaboratorError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        self.analyzed.lock().unwrap().push(ctx.job_id.clone());
        self.providers_seen
            .lock()
            .unwrap()
            .push(ctx.llm_provider.clone());
        for file in files {
            out.line(&format!("analyzing {}", file.path));
        }

        if self
            .panic_analyze
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("analyzer process crashed");
        }

        let gate = self.analyze_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.hang_analyze.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        next(&self.analyze_script, default_analysis)
    }

    async fn convert(
        &self,
        _analysis: &AnalysisReport,
        feedback: Option<&Feedback>,
        _ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<GeneratedFiles, CollaboratorError> {
        self.convert_calls.fetch_add(1, Ordering::SeqCst);
        self.feedback_seen.lock().unwrap().push(feedback.cloned());
        out.line("generating java sources");

        let gate = self.convert_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        next(&self.convert_script, default_generated)
    }

    async fn review(
        &self,
        _generated: &GeneratedFiles,
        _tests: &TestReport,
        _ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<ReviewVerdict, CollaboratorError> {
        self.review_calls.fetch_add(1, Ordering::SeqCst);
        out.line("reviewing generated project");
        next(&self.review_script, || ReviewVerdict {
            approved: true,
            feedback: None,
        })
    }
}

#[derive(Default)]
pub struct FakeVerifier {
    pub compile_script: Script<CompileReport>,
    pub test_script: Script<TestReport>,
    pub compile_calls: AtomicU32,
    pub test_calls: AtomicU32,
}

impl FakeVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_compile(&self, result: Result<CompileReport, CollaboratorError>) {
        self.compile_script.lock().unwrap().push_back(result);
    }

    pub fn script_test(&self, result: Result<TestReport, CollaboratorError>) {
        self.test_script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> (u32, u32) {
        (
            self.compile_calls.load(Ordering::SeqCst),
            self.test_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl Verifier for FakeVerifier {
    async fn compile(
        &self,
        _generated: &GeneratedFiles,
        _ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<CompileReport, CollaboratorError> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        out.line("mvn -q compile");
        next(&self.compile_script, || CompileReport {
            success: true,
            diagnostics: String::new(),
        })
    }

    async fn test(
        &self,
        _generated: &GeneratedFiles,
        _ctx: &ExecutionContext,
        out: &dyn StageOutput,
    ) -> Result<TestReport, CollaboratorError> {
        self.test_calls.fetch_add(1, Ordering::SeqCst);
        out.line("mvn -q test");
        next(&self.test_script, || TestReport {
            success: true,
            report: "Tests run: 5, Failures: 0".to_string(),
            passed: 5,
            failed: 0,
        })
    }
}

pub fn compile_error(diagnostics: &str) -> Result<CompileReport, CollaboratorError> {
    Ok(CompileReport {
        success: false,
        diagnostics: diagnostics.to_string(),
    })
}

pub fn failing_tests(report: &str) -> Result<TestReport, CollaboratorError> {
    Ok(TestReport {
        success: false,
        report: report.to_string(),
        passed: 4,
        failed: 1,
    })
}

pub fn rejected(feedback: &str) -> Result<ReviewVerdict, CollaboratorError> {
    Ok(ReviewVerdict {
        approved: false,
        feedback: Some(feedback.to_string()),
    })
}
