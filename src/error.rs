//! Error types for pairlink.

use std::time::Duration;

/// Top-level error type for the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Pairing admission and lifecycle errors.
///
/// Only admission failures are caller-visible; everything after admission
/// is logged and resolved by evicting the attempt.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("Pairing attempt already registered: {attempt_id}")]
    DuplicateAttempt { attempt_id: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Pairing attempt not found: {attempt_id}")]
    NotFound { attempt_id: String },

    #[error("Pairing attempt {attempt_id} exceeded deadline of {deadline:?}")]
    DeadlineExceeded {
        attempt_id: String,
        deadline: Duration,
    },

    #[error("Transport failure during pairing: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to persist credentials: {0}")]
    Persistence(#[from] StoreError),

    #[error("Finalization failed: {0}")]
    Finalize(#[from] ControlPlaneError),
}

/// Transport boundary errors.
///
/// The transport itself is an external capability; these cover only the
/// narrow seam this crate consumes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to open transport session: {reason}")]
    Connect { reason: String },

    #[error("Linking code issuance failed: {reason}")]
    CodeIssuance { reason: String },

    #[error("Transport session closed: {reason}")]
    SessionClosed { reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Remote key-value store errors.
///
/// A network or protocol failure is distinct from a key being absent;
/// absence is `Ok(None)`, never an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Key-value operation {op} failed for key {key}: {reason}")]
    Kv {
        op: &'static str,
        key: String,
        reason: String,
    },

    #[error("Encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Control-plane client errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("Control plane rejected request: status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Inbound HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed { addr: String, reason: String },
}

/// Result type alias for the control plane.
pub type Result<T> = std::result::Result<T, Error>;
