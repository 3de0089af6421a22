//! Test harness for isolated scheduler runs.
//!
//! The `TestHarness` struct owns everything a scheduler needs:
//! - A temporary output directory
//! - A database (in-memory unless a file path is requested)
//! - Scripted converter and verifier fakes
//!
//! Settings are built with `SettingsBuilder`, which starts from test-friendly
//! defaults (no infrastructure backoff, one slot).

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tempfile::TempDir;

use codeshift::config::ProfileSettings;
use codeshift::{
    Database, Job, JobId, JobScheduler, JobSubmission, LogItem, LogSubscription, Settings,
    SourceFile,
};

use super::fakes::{FakeConverter, FakeVerifier};

/// Upper bound for any wait in a test.
pub const WAIT: Duration = Duration::from_secs(10);

/// Builder for `Settings` instances.
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        let mut settings = Settings::default();
        settings.retry.infra_backoff_ms = 0;
        Self { settings }
    }

    pub fn max_concurrent_jobs(mut self, slots: usize) -> Self {
        self.settings.scheduler.max_concurrent_jobs = slots;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.settings.retry.max_retries = retries;
        self
    }

    pub fn infra_attempts(mut self, attempts: u32) -> Self {
        self.settings.retry.infra_attempts = attempts;
        self
    }

    pub fn analyze_timeout(mut self, secs: u64) -> Self {
        self.settings.timeouts.analyze = secs;
        self
    }

    pub fn abort_in_flight(mut self) -> Self {
        self.settings.scheduler.abort_in_flight_on_cancel = true;
        self
    }

    pub fn profile(mut self, id: &str, llm_provider: &str) -> Self {
        self.settings.profiles.push(ProfileSettings {
            id: id.to_string(),
            llm_provider: Some(llm_provider.to_string()),
            cli_tool: None,
            rules: None,
        });
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A submission with one Pro*C file for the `java-spring` profile.
pub fn submission(name: &str) -> JobSubmission {
    JobSubmission::new(
        name,
        "java-spring",
        vec![
            SourceFile::new("src/ledger.pc", "EXEC SQL SELECT balance INTO :b FROM ledger;"),
            SourceFile::new("include/ledger.h", "struct ledger { long balance; };"),
        ],
    )
}

/// Isolated scheduler environment.
pub struct TestHarness {
    temp_dir: TempDir,
    pub output_dir: PathBuf,
    pub db: Database,
    pub converter: Arc<FakeConverter>,
    pub verifier: Arc<FakeVerifier>,
    pub scheduler: JobScheduler,
}

impl TestHarness {
    /// Default settings over an in-memory database.
    pub fn new() -> Self {
        Self::with_settings(SettingsBuilder::new())
    }

    pub fn with_settings(builder: SettingsBuilder) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        Self::build(builder, db, TempDir::new().expect("Failed to create temp directory"))
    }

    /// Uses a database file inside the harness's temp directory.
    pub fn with_file_database(builder: SettingsBuilder) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join("data").join("codeshift.db"))
            .expect("Failed to open database file");
        Self::build(builder, db, temp_dir)
    }

    fn build(builder: SettingsBuilder, db: Database, temp_dir: TempDir) -> Self {
        let output_dir = temp_dir.path().join("output");
        let mut settings = builder.build();
        settings.storage.output_directory = output_dir.clone();

        let converter = FakeConverter::new();
        let verifier = FakeVerifier::new();
        let scheduler = JobScheduler::with_database(
            settings,
            Some(db.clone()),
            converter.clone(),
            verifier.clone(),
        )
        .expect("Failed to build scheduler");

        Self {
            temp_dir,
            output_dir,
            db,
            converter,
            verifier,
            scheduler,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Replaces the scheduler with a fresh one over the same database, as
    /// after a process restart. The new scheduler is not started.
    pub async fn restart(&mut self) {
        self.scheduler.shutdown().await;
        let settings = self.scheduler.settings().clone();
        self.converter = FakeConverter::new();
        self.verifier = FakeVerifier::new();
        self.scheduler = JobScheduler::with_database(
            settings,
            Some(self.db.clone()),
            self.converter.clone(),
            self.verifier.clone(),
        )
        .expect("Failed to rebuild scheduler");
    }

    /// Starts the scheduler and submits one job.
    pub fn submit(&self, name: &str) -> JobId {
        self.scheduler.start();
        self.scheduler
            .submit(submission(name))
            .expect("Failed to submit job")
    }

    pub async fn wait(&self, id: &JobId) -> Job {
        tokio::time::timeout(WAIT, self.scheduler.wait_for_terminal(id))
            .await
            .expect("Timed out waiting for job to finish")
            .expect("Failed to wait for job")
    }

    pub async fn run(&self, name: &str) -> Job {
        let id = self.submit(name);
        self.wait(&id).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a log subscription up to and including its end marker.
pub async fn drain(mut subscription: LogSubscription) -> Vec<LogItem> {
    let read = async {
        let mut items = Vec::new();
        while let Some(item) = subscription.next().await {
            let end = item.is_end();
            items.push(item);
            if end {
                break;
            }
        }
        items
    };
    tokio::time::timeout(WAIT, read)
        .await
        .expect("Timed out reading log subscription")
}

/// Concatenated text of every item.
pub fn text_of(items: &[LogItem]) -> String {
    items.iter().map(LogItem::text).collect()
}
