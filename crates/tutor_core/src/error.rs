//! crates/tutor_core/src/error.rs
//!
//! The error taxonomy of the learning session engine. Every variant is scoped
//! to the request that produced it; none is fatal to the process.

use std::time::Duration;
use uuid::Uuid;

use crate::domain::{ProgressRejected, QuotaBucket};
use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The document's outline has not been marked ready yet.
    #[error("Outline for document {0} is not ready")]
    StructureNotReady(Uuid),

    /// The user's bucket cannot cover the requested generation.
    #[error("Quota exceeded for {bucket}: {remaining} of {limit} remaining")]
    QuotaExceeded {
        bucket: QuotaBucket,
        remaining: u32,
        limit: u32,
    },

    #[error("Invalid answer: {0}")]
    InvalidAnswer(String),

    /// The operation is not legal in the session's current state, usually
    /// because the caller acted on a stale position.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Session {0} belongs to another user")]
    Forbidden(Uuid),

    #[error("Service port error: {0}")]
    Port(#[source] PortError),
}

impl From<ProgressRejected> for EngineError {
    fn from(rejected: ProgressRejected) -> Self {
        match rejected {
            ProgressRejected::NoSuchQuestion(_) => EngineError::InvalidAnswer(rejected.to_string()),
            _ => EngineError::InvalidTransition(rejected.to_string()),
        }
    }
}

impl From<PortError> for EngineError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Rejected(rejected) => rejected.into(),
            other => EngineError::Port(other),
        }
    }
}

impl EngineError {
    /// Whether the caller may safely repeat the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::GenerationFailed(_) | EngineError::GenerationTimeout(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_changes_become_caller_errors() {
        let err: EngineError = PortError::Rejected(ProgressRejected::NoSuchQuestion(4)).into();
        assert!(matches!(err, EngineError::InvalidAnswer(_)));

        let err: EngineError = PortError::Rejected(ProgressRejected::AlreadyResolved(0)).into();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        let err: EngineError = PortError::Unexpected("pool closed".into()).into();
        assert!(matches!(err, EngineError::Port(_)));
    }
}
