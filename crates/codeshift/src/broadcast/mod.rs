//! Job state and log broadcasting.
//!
//! [`JobStore`] owns committed job state and publishes [`JobEvent`]s;
//! [`LogSink`] owns per-job execution logs and their live subscribers.

pub mod job_events;
pub mod job_store;
pub mod log_sink;

pub use job_events::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use job_store::{CancelOutcome, JobQuery, JobStore, TransitionFields};
pub use log_sink::{LogChunk, LogItem, LogSink, LogSubscription};
