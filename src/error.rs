//! Engine error types
//!
//! Mirrors the error-kind taxonomy the orchestrator needs to branch on
//! (validation vs. transient vs. fatal) without resorting to exceptions for
//! control flow: callers match on [`EngineError`] instead of string-sniffing
//! an `anyhow::Error`.

use thiserror::Error;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-correctable input error: inactive project, invalid pipeline,
    /// cancel/retry on the wrong state. No state change has happened.
    #[error("validation error: {0}")]
    Validation(String),

    /// Infrastructure hiccup that the Auto-Recovery helper may retry:
    /// connection refused/reset/timeout, DNS failure, socket hangup, a busy
    /// or non-empty filesystem, or permission denied on a cache directory.
    #[error("transient error: {0}")]
    Transient(String),

    /// Pre-flight capacity check failed after cleanup; fatal for this
    /// deployment.
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    /// A pipeline step exited non-zero or timed out.
    #[error("step {step} failed: {message}")]
    StepFailure { step: String, message: String },

    /// Smart sync failed against one or more target paths.
    #[error("publish failed for path(s): {paths}")]
    PublishFailure { paths: String },

    /// SSH key materialisation failed: decrypt failure or an unrecognised
    /// private-key format. Fatal for the deployment that requested it.
    #[error("ssh key error: {0}")]
    SshKey(String),

    /// Any other failure, wrapped from a lower layer.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// True for errors the Auto-Recovery helper should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// Classify a lower-level I/O or process error by message pattern, the
    /// way the Auto-Recovery helper distinguishes retryable infrastructure
    /// noise from a fatal failure.
    pub fn classify_transient(message: &str) -> bool {
        const PATTERNS: &[&str] = &[
            "connection refused",
            "connection reset",
            "timed out",
            "timeout",
            "name resolution",
            "could not resolve host",
            "socket hang up",
            "resource busy",
            "device or resource busy",
            "directory not empty",
            "permission denied",
        ];
        let lower = message.to_lowercase();
        PATTERNS.iter().any(|p| lower.contains(p))
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_transient_patterns() {
        assert!(EngineError::classify_transient("Connection refused (os error 111)"));
        assert!(EngineError::classify_transient("Temporary failure in name resolution"));
        assert!(EngineError::classify_transient("rename: Directory not empty"));
        assert!(!EngineError::classify_transient("exit status 1"));
    }

    #[test]
    fn is_transient_matches_variant() {
        assert!(EngineError::Transient("x".into()).is_transient());
        assert!(!EngineError::Validation("x".into()).is_transient());
    }
}
