use thiserror::Error;

/// Errors that can occur while resolving keys or acquiring and releasing locks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The key template has no dynamic segment, more than one, or the
    /// expression could not be evaluated against the call arguments.
    #[error("Invalid key expression: {0}")]
    InvalidExpression(String),

    /// Parameter names are missing or do not line up with the arguments.
    #[error("Invalid parameter binding: {0}")]
    InvalidParameterBinding(String),

    /// The lock could not be acquired within the configured wait time.
    #[error("Failed to try lock: {0}")]
    AcquisitionTimeout(String),

    /// The backing store is unreachable or answered unexpectedly.
    #[error("Store transport error: {0}")]
    StoreTransport(String),

    /// The lock was no longer owned by this holder when released.
    #[error("Release failed: {0}")]
    Release(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl LockError {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::StoreTransport(_))
    }
}
