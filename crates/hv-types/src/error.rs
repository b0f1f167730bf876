//! Closed error taxonomy surfaced at the public boundary.

use std::fmt;

/// Stable error kind shared by every component's public operations.
///
/// Each variant carries a human-readable message; [`HvError::code`]
/// returns the stable code string a caller can match on without
/// depending on `Display` text.
#[derive(Debug, thiserror::Error)]
pub enum HvError {
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("image verification failed: {0}")]
    ImageVerificationFailed(String),

    #[error("hal unavailable: {0}")]
    HalUnavailable(String),

    #[error("target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("isolation violation: {0}")]
    IsolationViolation(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HvError {
    /// Stable code string for the closed taxonomy in .
    pub fn code(&self) -> &'static str {
        match self {
            HvError::CapacityExceeded(_) => "capacity-exceeded",
            HvError::NotFound(_) => "not-found",
            HvError::InvalidState(_) => "invalid-state",
            HvError::ValidationFailed(_) => "validation-failed",
            HvError::ImageVerificationFailed(_) => "image-verification-failed",
            HvError::HalUnavailable(_) => "hal-unavailable",
            HvError::TargetUnreachable(_) => "target-unreachable",
            HvError::PolicyDenied(_) => "policy-denied",
            HvError::IsolationViolation(_) => "isolation-violation",
            HvError::Timeout(_) => "timeout",
            HvError::Transport(_) => "transport",
            HvError::Io(_) => "transport",
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        HvError::NotFound(what.to_string())
    }

    pub fn invalid_state(what: impl fmt::Display) -> Self {
        HvError::InvalidState(what.to_string())
    }

    pub fn validation(what: impl fmt::Display) -> Self {
        HvError::ValidationFailed(what.to_string())
    }
}

pub type HvResult<T> = Result<T, HvError>;
