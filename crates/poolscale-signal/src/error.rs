//! Error types for the signal evaluation engine.

use std::fmt;

use thiserror::Error;

use poolscale_core::SignalIdentity;

/// Result type alias for signal operations.
pub type SignalResult<T> = Result<T, SignalError>;

/// Why an evaluation produced no usable answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationCause {
    /// No response within the evaluation timeout. The worker was killed.
    Timeout,
    /// The worker answered with something that is not a resource response.
    Malformed(String),
    /// The worker exited or closed its channel mid-request.
    Crashed(String),
    /// The handle was already closed or previously failed.
    Dead,
}

impl fmt::Display for EvaluationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationCause::Timeout => write!(f, "timed out"),
            EvaluationCause::Malformed(detail) => write!(f, "malformed response: {detail}"),
            EvaluationCause::Crashed(detail) => write!(f, "worker crashed: {detail}"),
            EvaluationCause::Dead => write!(f, "worker is not running"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    /// Fetching, unpacking, or spawning the signal failed.
    #[error("failed to load signal {signal}: {reason}")]
    Load {
        signal: SignalIdentity,
        reason: String,
    },

    /// The worker started but never acknowledged its parameters.
    #[error("signal {signal} failed to initialize: {reason}")]
    Init {
        signal: SignalIdentity,
        reason: String,
    },

    #[error("signal {signal} evaluation failed: {cause}")]
    Evaluation {
        signal: SignalIdentity,
        cause: EvaluationCause,
    },
}

impl SignalError {
    pub fn signal(&self) -> &SignalIdentity {
        match self {
            SignalError::Load { signal, .. }
            | SignalError::Init { signal, .. }
            | SignalError::Evaluation { signal, .. } => signal,
        }
    }

    /// Load and init failures mean the signal is misconfigured rather than
    /// misbehaving at runtime.
    pub fn is_configuration_failure(&self) -> bool {
        matches!(self, SignalError::Load { .. } | SignalError::Init { .. })
    }
}
