//! Error types for registry access and mutations.

use thiserror::Error;

/// Errors raised by a registry client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Network or HTTP failure talking to the ledger node.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A write was mined but reverted.
    #[error("transaction reverted: {0}")]
    Reverted(String),

    /// Return data could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// No receipt arrived in time.
    #[error("timed out waiting for transaction receipt")]
    Timeout,
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        RegistryError::Transport(e.to_string())
    }
}

/// Errors returned by the mutation orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("registry is not available on this network")]
    RegistryUnavailable,

    #[error("another transaction is already in progress")]
    AlreadyPending,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Transport(String),

    #[error("failed to encrypt value: {0}")]
    Encryption(String),
}

impl From<RegistryError> for MutationError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Reverted(msg) => MutationError::Rejected(format!("transaction reverted: {msg}")),
            RegistryError::Rpc { message, .. } => MutationError::Rejected(message),
            other => MutationError::Transport(other.to_string()),
        }
    }
}
