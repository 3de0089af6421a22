pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod sanitize;
pub mod scheduler;
pub mod status;
pub mod storage;

pub use broadcast::{JobEvent, JobQuery, JobStore, LogItem, LogSink, LogSubscription};
pub use config::{load_settings, load_settings_from_str, Settings};
pub use db::Database;
pub use error::{
    CodeshiftError, ConfigError, LogError, Result, SchedulerError, StorageError, StoreError,
    SubmitError,
};
pub use job::{Job, JobId, JobStatus, JobSubmission, SourceFile, Stage, StageAttempt};
pub use logging::init_tracing;
pub use pipeline::{
    AnalysisReport, CollaboratorError, CompileReport, Converter, ExecutionContext, Feedback,
    GeneratedFile, GeneratedFiles, ReviewVerdict, StageOutput, TestReport, Verifier,
};
pub use scheduler::{JobScheduler, Recovery};
pub use status::{DetailedStatus, JobCounts, StatusProjector};
pub use storage::FileStorage;
