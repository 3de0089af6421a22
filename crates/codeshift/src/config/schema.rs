use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::Stage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: String,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub submission: SubmissionSettings,
    #[serde(default)]
    pub profiles: Vec<ProfileSettings>,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            scheduler: SchedulerSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            submission: SubmissionSettings::default(),
            profiles: Vec::new(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Looks up a configured profile by id.
    pub fn profile(&self, id: &str) -> Option<&ProfileSettings> {
        self.profiles.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Jobs allowed past PENDING at the same time.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Abort the in-flight collaborator call when a job is cancelled instead
    /// of waiting for it to return.
    #[serde(default)]
    pub abort_in_flight_on_cancel: bool,
}

fn default_max_concurrent_jobs() -> usize {
    1
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            abort_in_flight_on_cancel: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Job-level retry budget shared by every loop-back and re-run.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Total tries per stage execution for infrastructure errors.
    #[serde(default = "default_infra_attempts")]
    pub infra_attempts: u32,
    #[serde(default = "default_infra_backoff_ms")]
    pub infra_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_infra_attempts() -> u32 {
    3
}

fn default_infra_backoff_ms() -> u64 {
    500
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            infra_attempts: default_infra_attempts(),
            infra_backoff_ms: default_infra_backoff_ms(),
        }
    }
}

impl RetrySettings {
    /// Linear backoff before the `retry`-th infrastructure retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.infra_backoff_ms.saturating_mul(retry as u64))
    }
}

/// Per-stage timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_analyze_secs")]
    pub analyze: u64,
    #[serde(default = "default_convert_secs")]
    pub convert: u64,
    #[serde(default = "default_verify_secs")]
    pub compile: u64,
    #[serde(default = "default_verify_secs")]
    pub test: u64,
    #[serde(default = "default_verify_secs")]
    pub review: u64,
}

fn default_analyze_secs() -> u64 {
    120
}

fn default_convert_secs() -> u64 {
    600
}

fn default_verify_secs() -> u64 {
    300
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            analyze: default_analyze_secs(),
            convert: default_convert_secs(),
            compile: default_verify_secs(),
            test: default_verify_secs(),
            review: default_verify_secs(),
        }
    }
}

impl TimeoutSettings {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Analyze => self.analyze,
            Stage::Convert => self.convert,
            Stage::Compile => self.compile,
            Stage::Test => self.test,
            Stage::Review => self.review,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSettings {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    /// Lower-case extensions without the dot. Empty accepts anything.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_max_files() -> usize {
    500
}

fn default_max_total_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["c".to_string(), "h".to_string(), "pc".to_string()]
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_total_bytes: default_max_total_bytes(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

/// A target profile: which provider and tool a conversion uses, plus the
/// opaque rule set handed to the converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSettings {
    pub id: String,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub cli_tool: Option<String>,
    #[serde(default)]
    pub rules: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file; in-memory only when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./codeshift-output")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            output_directory: default_output_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Capacity of the job event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            event_capacity: default_event_capacity(),
        }
    }
}
