use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a stage failure is handled by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Collaborator unreachable, crashed or timed out. Retried inside the
    /// runner before it costs the job anything.
    Infrastructure,
    /// Compile error, failing test, review rejection. Always consumes one
    /// unit of the job retry budget.
    Semantic,
}

/// Errors returned by a [`Converter`](super::Converter) or
/// [`Verifier`](super::Verifier).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Review failed: {0}")]
    Review(String),

    #[error("Tooling failed: {0}")]
    Tooling(String),

    #[error("Missing {0} from an earlier stage")]
    MissingInput(&'static str),
}

impl CollaboratorError {
    pub fn class(&self) -> FailureClass {
        match self {
            CollaboratorError::Unavailable(_) | CollaboratorError::Tooling(_) => {
                FailureClass::Infrastructure
            }
            CollaboratorError::Analysis(_)
            | CollaboratorError::Conversion(_)
            | CollaboratorError::Review(_)
            | CollaboratorError::MissingInput(_) => FailureClass::Semantic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            CollaboratorError::Unavailable("connection refused".into()).class(),
            FailureClass::Infrastructure
        );
        assert_eq!(
            CollaboratorError::Tooling("javac crashed".into()).class(),
            FailureClass::Infrastructure
        );
        assert_eq!(
            CollaboratorError::Conversion("unparseable".into()).class(),
            FailureClass::Semantic
        );
        assert_eq!(
            CollaboratorError::MissingInput("analysis").class(),
            FailureClass::Semantic
        );
    }
}
