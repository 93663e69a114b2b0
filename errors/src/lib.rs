//! # Strata Errors
//!
//! Error taxonomy shared across the Strata configuration subsystem.
//!
//! One enum per concern, named fields throughout, `thiserror` for the
//! `Display`/`Error` implementations. Foreign error types (HTTP client,
//! cipher primitives, filesystem) are converted into these variants at the
//! boundary that observes them; only string reasons cross crate lines.

use serde::Serialize;
use thiserror::Error;

/// Failures of the hybrid crypto channel (RSA-OAEP seal, AES-CBC open).
#[derive(Debug, Error, Serialize)]
pub enum CryptoError {
    #[error("Invalid recipient public key: {reason}")]
    InvalidPublicKey { reason: String },

    #[error("Encrypted payload too short: {len} bytes, need at least one cipher block")]
    ShortPayload { len: usize },

    #[error("Sealing secret failed: {reason}")]
    Encrypt { reason: String },

    #[error("Opening payload failed: {reason}")]
    Decrypt { reason: String },
}

/// Failures talking to a remote configuration backend.
#[derive(Debug, Error, Serialize)]
pub enum RemoteError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Request to {provider} failed with status {status}")]
    RequestFailed { provider: String, status: u16 },

    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Provider {provider} does not support watch")]
    WatchUnsupported { provider: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures of the local cache tier.
#[derive(Debug, Error, Serialize)]
pub enum CacheError {
    #[error("No cache entry at {path}")]
    NotFound { path: String },

    #[error("Cache I/O on {path} failed: {reason}")]
    Io { path: String, reason: String },
}

/// Failures constructing or driving the tiered resolver.
#[derive(Debug, Error, Serialize)]
pub enum ResolveError {
    #[error("Unsupported remote provider: {kind}")]
    UnsupportedProvider { kind: String },

    #[error("Invalid resolver settings: {reason}")]
    InvalidSettings { reason: String },

    #[error("Compiled-in defaults are invalid: {reason}")]
    InvalidDefaults { reason: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
