//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `geode`.
pub type GeodeResult<T> = Result<T, GeodeError>;

/// High-level error categories shared by the ordering and scheduling crates.
///
/// The variants remain intentionally broad: recoverable transaction failures travel through the
/// pre-dispatch abort protocol as messages, not through this type, so what is left here is
/// configuration validation, module lifecycle problems, and file I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeodeError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}
