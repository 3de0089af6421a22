use std::path::PathBuf;
use thiserror::Error;

use crate::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum CodeshiftError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Submission rejected: {0}")]
    Submit(#[from] SubmitError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Settings validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Duplicate profile id '{0}'")]
    DuplicateProfile(String),

    #[error("Failed to install log subscriber: {0}")]
    Logging(String),
}

/// Input errors: the job is never created.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Job name must not be empty")]
    EmptyName,

    #[error("Job has no source files")]
    NoSourceFiles,

    #[error("Invalid source path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Duplicate source path '{0}'")]
    DuplicatePath(String),

    #[error("Unsupported source file extension: '{0}'")]
    UnsupportedExtension(String),

    #[error("Too many source files: {count} (max {max})")]
    TooManyFiles { count: usize, max: usize },

    #[error("Source batch too large: {bytes} bytes (max {max})")]
    TooLarge { bytes: usize, max: usize },

    #[error("Unknown target profile '{0}'")]
    UnknownProfile(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Status conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Illegal transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job {job_id} is terminal ({status})")]
    Terminal { job_id: JobId, status: JobStatus },

    #[error("Cancellation pending for job {0}")]
    CancellationPending(JobId),

    #[error("No open {stage} attempt #{attempt} for job {job_id}")]
    AttemptNotOpen {
        job_id: JobId,
        stage: crate::job::Stage,
        attempt: u32,
    },
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("No log stream for job {0}")]
    UnknownJob(JobId),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid output path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("File already exists: {0}")]
    FileExists(PathBuf),

    #[error("Output writer task failed: {0}")]
    Join(String),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {job_id} already finished with status {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },

    #[error("Scheduler has shut down")]
    ShutDown,

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Log(#[from] LogError),
}

pub type Result<T> = std::result::Result<T, CodeshiftError>;
