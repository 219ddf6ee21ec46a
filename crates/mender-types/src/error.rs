//! The crate-wide error taxonomy (§7, §4.10 of the design).
//!
//! Every fallible operation in the orchestrator returns `Result<T, CoreError>`
//! so that a state's `HandleError` can classify a failure without string
//! matching. `CoreError` composes with `anyhow::Error` at every call site that
//! doesn't need to classify — see the `From` impls below.

use thiserror::Error;

/// Crate-wide error classification.
///
/// Mirrors `shipper::types::ErrorClass` (`Retryable` / `Permanent` /
/// `Ambiguous`) but widened with the two distinguished outcomes the
/// distilled spec calls out explicitly: `Unauthorized` and `AlreadyInstalled`,
/// both of which are recognized by the transport/server response rather than
/// inferred from a generic failure.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Retryable: network failures, status-report failures, non-gating
    /// script failures. The state machine schedules a backoff wait.
    #[error("transient error: {source}")]
    Transient {
        #[source]
        source: anyhow::Error,
    },

    /// Non-retryable for this deployment: dependency mismatch, commit
    /// failure after the first payload, exceeded state-data ceiling.
    #[error("fatal error: {source}")]
    Fatal {
        #[source]
        source: anyhow::Error,
    },

    /// The server rejected the cached credential. Triggers token removal and
    /// reauthorization on the next poll.
    #[error("unauthorized")]
    Unauthorized,

    /// The server reports the requested artifact is already installed.
    /// Reported as success; the deployment returns to idle.
    #[error("already installed")]
    AlreadyInstalled,
}

impl CoreError {
    /// Wrap an arbitrary error as transient.
    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self::Transient { source: source.into() }
    }

    /// Wrap an arbitrary error as fatal.
    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self::Fatal { source: source.into() }
    }

    /// Whether the state machine should schedule a retry for this error
    /// rather than abandon the deployment.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient { .. })
    }

    /// Whether this error should set the broken-artifact marker if it occurs
    /// after the commit point.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal { .. })
    }
}

/// Any `anyhow::Error` becomes `Transient` by default — callers that know a
/// failure is fatal construct `CoreError::fatal` explicitly instead of
/// relying on `?`.
impl From<anyhow::Error> for CoreError {
    fn from(source: anyhow::Error) -> Self {
        CoreError::Transient { source }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(source: std::io::Error) -> Self {
        CoreError::Transient { source: source.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        let err = CoreError::transient(anyhow::anyhow!("boom"));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_is_not_retryable() {
        let err = CoreError::fatal(anyhow::anyhow!("boom"));
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn unauthorized_is_neither() {
        let err = CoreError::Unauthorized;
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn anyhow_conversion_is_transient() {
        let err: CoreError = anyhow::anyhow!("network down").into();
        assert!(err.is_retryable());
    }
}
