//! Common error types for MONXRT.

use thiserror::Error;

/// Result type alias using MONXRT's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for MONXRT operations.
///
/// The variants mirror the failure kinds of the control plane: validation
/// and call-order errors are returned to the offending client, IPC and
/// runtime errors are fatal to the session that raised them.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, shared memory, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client misuse, recoverable; returned to the caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation called in the wrong order (e.g. `begin_frame` without
    /// `wait_frame`).
    #[error("call order error: {0}")]
    CallOrder(String),

    /// A per-client or per-swapchain cap was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transport failure, fatal to the session.
    #[error("IPC failure: {0}")]
    IpcFailure(String),

    /// Internal invariant violation, fatal to the session.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Device went away; escalated to `LOSS_PENDING`.
    #[error("device lost: {0}")]
    DeviceLost(String),
}

impl Error {
    /// Create a validation error from any displayable type.
    pub fn validation(msg: impl std::fmt::Display) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Create a call-order error from any displayable type.
    pub fn call_order(msg: impl std::fmt::Display) -> Self {
        Self::CallOrder(msg.to_string())
    }

    /// Create a resource-exhausted error from any displayable type.
    pub fn resource_exhausted(msg: impl std::fmt::Display) -> Self {
        Self::ResourceExhausted(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an IPC failure from any displayable type.
    pub fn ipc(msg: impl std::fmt::Display) -> Self {
        Self::IpcFailure(msg.to_string())
    }

    /// Create a runtime error from any displayable type.
    pub fn runtime(msg: impl std::fmt::Display) -> Self {
        Self::Runtime(msg.to_string())
    }

    /// Create a device-lost error from any displayable type.
    pub fn device_lost(msg: impl std::fmt::Display) -> Self {
        Self::DeviceLost(msg.to_string())
    }

    /// Whether this error tears down the session it was raised on.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::IpcFailure(_) | Self::Runtime(_) | Self::DeviceLost(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(Error::ipc("gone").is_fatal_to_session());
        assert!(Error::runtime("bad state").is_fatal_to_session());
        assert!(Error::device_lost("hmd unplugged").is_fatal_to_session());
        assert!(!Error::validation("bad arg").is_fatal_to_session());
        assert!(!Error::call_order("begin before wait").is_fatal_to_session());
        assert!(!Error::timeout("fence").is_fatal_to_session());
    }
}
