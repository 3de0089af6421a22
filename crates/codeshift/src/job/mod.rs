//! Conversion job model: identifiers, submissions, committed job records and
//! stage attempts.

pub mod attempt;
pub mod model;
pub mod status;

pub use attempt::{metric, AttemptClose, AttemptOutcome, StageAttempt};
pub use model::{Job, JobId, JobSubmission, SourceFile};
pub use status::{JobStatus, ParseEnumError, Stage};
