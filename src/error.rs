//! Error types for the key lifecycle core
//!
//! This module defines the failure taxonomy for all key material operations:
//! storage corruption, publication failures, protocol-invariant violations,
//! and concurrency timeouts are distinct variants so callers can react to
//! each without string matching.

use thiserror::Error;

/// Errors that can occur during key lifecycle operations
#[derive(Debug, Error)]
pub enum KeyError {
    /// Underlying key-value storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored record failed to decrypt or deserialize
    ///
    /// For remote identities, pre-keys and sessions the offending record is
    /// purged and treated as absent. For the device's own identity keypair
    /// this error is fatal and surfaced as-is.
    #[error("Corrupt record in {collection}: {reason}")]
    Corrupt {
        /// Collection the record was read from
        collection: &'static str,
        /// Why the record could not be restored
        reason: String,
    },

    /// Failed to parse or decode a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Signature creation or verification failed
    #[error("Signature error: {0}")]
    Signature(String),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server rejected a request
    #[error("Server error ({status}): {body}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body, if any
        body: String,
    },

    /// A publication to the server failed after bounded retries
    ///
    /// Local state remains valid; a later retry can still complete the
    /// publication.
    #[error("Publication failed after {attempts} attempts: {last}")]
    Publication {
        /// How many attempts were made
        attempts: u32,
        /// The last error observed
        last: String,
    },

    /// Waited longer than the configured timeout for the regeneration lock
    #[error("Timed out waiting for identity regeneration lock")]
    LockTimeout,

    /// Internal error
    #[error("Internal key error: {0}")]
    Internal(String),
}

impl From<vodozemac::KeyError> for KeyError {
    fn from(e: vodozemac::KeyError) -> Self {
        KeyError::InvalidKey(e.to_string())
    }
}

/// Result type for key lifecycle operations
pub type KeyResult<T> = Result<T, KeyError>;
