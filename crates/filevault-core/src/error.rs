//! Error kinds shared across the vault.
//!
//! Application code propagates `anyhow::Error`; the kinds below travel
//! inside it and are recovered with [`VaultError::classify`] wherever a
//! caller needs to decide between retrying, surfacing, or alarming.
//!
//! "Not extractable" is deliberately absent: it is an expected indexing
//! outcome, not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Two writers raced to create the same content record. Recovered
    /// internally by retrying the put; never surfaced to callers.
    #[error("concurrent insert of content {fingerprint}")]
    DuplicateRace { fingerprint: String },

    /// Vector index or physical storage unreachable. Retried with backoff.
    #[error("transient store failure: {0}")]
    TransientStore(String),

    /// Malformed caller input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Vector cleanup for a deleted file could not be confirmed.
    #[error("consistency failure: {0}")]
    Consistency(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl VaultError {
    /// Find the first `VaultError` in an error's cause chain.
    pub fn classify(err: &anyhow::Error) -> Option<&VaultError> {
        err.chain().find_map(|cause| cause.downcast_ref::<VaultError>())
    }

    pub fn is_transient(err: &anyhow::Error) -> bool {
        matches!(Self::classify(err), Some(VaultError::TransientStore(_)))
    }

    pub fn is_validation(err: &anyhow::Error) -> bool {
        matches!(Self::classify(err), Some(VaultError::Validation(_)))
    }

    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(Self::classify(err), Some(VaultError::NotFound(_)))
    }

    /// Wrap an unclassified failure as transient, keeping an existing kind.
    pub fn into_transient(err: anyhow::Error) -> anyhow::Error {
        if Self::classify(&err).is_some() {
            err
        } else {
            anyhow::Error::new(VaultError::TransientStore(format!("{:#}", err)))
        }
    }
}
