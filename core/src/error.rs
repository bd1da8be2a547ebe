use thiserror::Error;

use crate::evaluator::EvaluatorState;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, ConsentError>;

/// Failures on the decision path.
///
/// Every evaluator-side failure surfaces as its own variant so the calling
/// layer can map it; none of them is ever turned into an "allow".
#[derive(Error, Debug)]
pub enum ConsentError {
    /// The evaluator is not running, crashed, or was stopped.
    #[error("rule evaluator unavailable: {reason}")]
    EvaluatorUnavailable { reason: String },

    /// The evaluator answered with text outside the reply grammar.
    #[error("malformed evaluator reply to `{query}`: {reply:?}")]
    MalformedReply { query: String, reply: String },

    /// The evaluator does not know the operation.
    #[error("evaluator does not support `{query}`")]
    UnsupportedQuery { query: String },

    #[error("consent store error: {0}")]
    ConsentStore(#[from] StoreError),

    #[error("evaluator binary not found: {program}")]
    BinaryNotFound { program: String },

    #[error("failed to launch evaluator `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot {action} evaluator while it is {state}")]
    InvalidTransition {
        action: &'static str,
        state: EvaluatorState,
    },
}

impl ConsentError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ConsentError::EvaluatorUnavailable {
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ConsentError::EvaluatorUnavailable { .. })
    }
}
