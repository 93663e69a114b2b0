//! # Strata Core
//!
//! Shared types for the Strata layered configuration subsystem.
//!
//! This crate provides:
//! - Identity types for service instances (`ServiceIdentity`, `InstanceTag`)
//! - Deterministic remote key-path derivation (`RemoteKeyPath`)
//! - Provider and serialization-format tags (`ProviderKind`, `ConfigFormat`)
//! - Resolved configuration snapshots with provenance (`ConfigSnapshot`)
//!
//! Everything here is plain data: no I/O, no async, no side effects. The
//! `remote` and `resolver` crates build on these types.

pub mod snapshot;
pub mod types;

// Re-export commonly used types for convenience
pub use snapshot::{ConfigSnapshot, SnapshotError};
pub use types::{ConfigFormat, InstanceTag, ProviderKind, RemoteKeyPath, ServiceIdentity, SourceTier};
