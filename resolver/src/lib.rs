//! # Strata Resolver
//!
//! Tiered configuration resolution for a long-lived service instance.
//!
//! A [`ConfigResolver`] walks four sources in strict order and returns the
//! first one that yields a usable document:
//!
//! 1. **Runtime** — an explicit configuration file supplied by the operator
//! 2. **Remote** — an encrypted or plain remote store (see the `remote` crate)
//! 3. **Local** — the last-known-good document cached on disk
//! 4. **Default** — compiled-in defaults, which always succeed
//!
//! A successful remote fetch is written through to the local cache in a
//! detached task, so the next start survives a remote outage. When the
//! backend supports it, resolution can also hand back a [`WatchSubscription`]
//! that republishes fresh snapshots until it is shut down.
//!
//! Settings come from the process environment ([`ResolverSettings::from_env`])
//! or are built directly; either way they are validated once, and provider
//! misconfiguration fails at construction, never mid-fetch.

pub mod cache;
pub mod precedence;
pub mod settings;
pub mod watch;

// Re-export commonly used types for convenience
pub use cache::LocalCache;
pub use precedence::{ConfigResolver, Resolution};
pub use settings::{ProviderConfig, ResolverSettings, DEFAULT_CACHE_DIR, DEFAULT_TIMEOUT_SECONDS};
pub use watch::{WatchNotice, WatchSubscription};
