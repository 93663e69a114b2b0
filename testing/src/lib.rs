//! Shared test fixtures for the Strata workspace.
//!
//! Provides the cooperating-peer side of the secure configuration channel:
//! a fixed RSA test keypair, the OAEP unseal a configuration server would
//! perform, and the `IV || AES-256-CBC` payload wrapping it would answer
//! with. Tests across the workspace use these to stand in for a real
//! encrypted remote store.

pub mod fixtures;

pub use fixtures::*;
