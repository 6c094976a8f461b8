//! Error types for the attested inference client
//!
//! Two taxonomies, one per phase: `ConnectError` for everything that can go
//! wrong while establishing the attested channel, `OpError` for the
//! request/response operations that run over it. Callers pattern-match on the
//! variant instead of catching by type; nothing here is retried internally.

use thiserror::Error;

use crate::rpc::RpcError;

/// Failures while establishing the attested channel.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Transport, socket or RPC failure on either channel.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Server version outside the set this client supports. Fatal: no
    /// further calls are made once this fires.
    #[error("Incompatible client/server versions (server reports {server}). Please use the correct client for your server.")]
    Version { server: String },

    /// Verified claims did not match the trust policy. Security-relevant,
    /// never downgraded to a warning.
    #[error("Policy verification failed: {0}")]
    Policy(String),

    /// Attestation evidence failed verification. Security-relevant, never
    /// retried without operator intervention.
    #[error("Attestation verification failed: {0}")]
    Attestation(String),

    /// Policy or certificate path does not point at a readable file.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// TLS-level failure (handshake, certificate parsing, key extraction).
    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<RpcError> for ConnectError {
    fn from(err: RpcError) -> Self {
        ConnectError::Connection(err.diagnostic())
    }
}

/// Failures of the post-connection operations (upload, run, delete).
#[derive(Error, Debug)]
pub enum OpError {
    /// The operation was attempted without an established session. Raised
    /// before any network call is made.
    #[error("Not connected to the server")]
    NotConnected,

    /// Transport or RPC failure on the attested channel.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Response integrity failure: bad signature or a mismatched echoed
    /// field. The result is discarded, never partially trusted.
    #[error("{0}")]
    Signature(String),

    /// The signed payload bytes did not decode into the expected shape.
    #[error("Invalid response payload: {0}")]
    Payload(String),

    /// Local model file path does not point at a readable file.
    #[error("File not found: {0}")]
    FileNotFound(String),
}

impl From<RpcError> for OpError {
    fn from(err: RpcError) -> Self {
        OpError::Connection(err.diagnostic())
    }
}

/// Result alias for the connection phase.
pub type ConnectResult<T> = std::result::Result<T, ConnectError>;

/// Result alias for post-connection operations.
pub type OpResult<T> = std::result::Result<T, OpError>;
