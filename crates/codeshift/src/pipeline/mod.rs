//! Stage execution: collaborator contracts, per-job execution context and the
//! [`StageRunner`].

pub mod collaborator;
pub mod context;
pub mod error;
pub mod output;
pub mod runner;

pub use collaborator::{
    AnalysisReport, CompileReport, Converter, GeneratedFile, GeneratedFiles, ReviewVerdict,
    TestReport, Verifier,
};
pub use context::{ExecutionContext, Feedback, StageArtifact, StageInput};
pub use error::{CollaboratorError, FailureClass};
pub use output::{LogSession, StageOutput};
pub use runner::{StageOutcome, StageResult, StageRunner};
