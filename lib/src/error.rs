//! Typed errors for the image-mutation core.
//!
//! Operations generally propagate `anyhow::Error` with context attached at
//! each layer boundary; the variants here are the taxonomic kinds that
//! callers (in particular the CLI) need to tell apart, and they stay
//! downcastable through an `anyhow` chain.

use crate::digest::Digest;

/// Taxonomic error kinds surfaced by the blob store and typed engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A user-supplied value (reference name, digest, id-map spec, ...)
    /// failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A blob, reference or path does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A reference name resolved to more than one descriptor.
    #[error("reference {name:?} is ambiguous ({count} descriptors)")]
    Ambiguous {
        /// The reference name that was being resolved.
        name: String,
        /// How many descriptors matched.
        count: usize,
    },

    /// Stored bytes do not match the descriptor naming them, or a blob
    /// required to be parseable was not.
    #[error("corrupt blob {digest}: {reason}")]
    Corrupt {
        /// Digest the blob was fetched under.
        digest: Digest,
        /// What went wrong.
        reason: String,
    },

    /// A descriptor's media type is not usable in the requested role.
    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),

    /// Another process holds the writer lock on the image.
    #[error("image is locked by another writer")]
    LockHeld,
}

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidInput(what.into())
    }

    pub(crate) fn corrupt(digest: &Digest, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            digest: digest.clone(),
            reason: reason.into(),
        }
    }
}
