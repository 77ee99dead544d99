//! Error types for the bastion relay

use thiserror::Error;

/// Main error type for the bastion relay
#[derive(Debug, Error)]
pub enum BastionError {
    /// Descriptor string could not be parsed
    #[error("malformed bastion descriptor: {0}")]
    MalformedUri(String),

    /// Named descriptor has no matching Host entry in the client config file
    #[error("bastion host '{0}' not found in client configuration")]
    ConfigHostNotFound(String),

    /// No usable credential could be resolved for the descriptor
    #[error("no usable credential for bastion: {0}")]
    AuthResolutionFailed(String),

    /// Authentication or transport establishment failed
    #[error("bastion connection failed: {0}")]
    ConnectFailed(String),

    /// A forwarded connection's channel dial exceeded its bound
    #[error("tunnel dial to {addr} timed out after {timeout_secs}s")]
    DialTimeout { addr: String, timeout_secs: u64 },

    /// Remote command completed with a failure indication
    #[error("remote command failed: {0}")]
    CommandFailed(String),

    /// Cancellation observed before completion; carries output captured so far
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// IO error (filesystem probes, local sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using BastionError
pub type Result<T> = std::result::Result<T, BastionError>;

impl BastionError {
    /// Create a malformed-descriptor error from a string
    pub fn malformed(msg: impl Into<String>) -> Self {
        BastionError::MalformedUri(msg.into())
    }

    /// Create an auth-resolution error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        BastionError::AuthResolutionFailed(msg.into())
    }

    /// Create a connect-failed error from a string
    pub fn connect(msg: impl Into<String>) -> Self {
        BastionError::ConnectFailed(msg.into())
    }
}
