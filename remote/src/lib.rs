//! # Strata Remote
//!
//! Remote configuration backends and the hybrid crypto channel.
//!
//! This crate provides:
//! - The [`RemoteSource`] trait every backend implements
//! - etcd v3 and Consul key-value backends (`EtcdV3Source`, `ConsulSource`)
//! - The encrypted HTTP backend (`SecureHttpSource`) and its crypto channel
//! - Background watch pumps with cooperative shutdown and fixed-interval
//!   reconnect
//!
//! All backends speak HTTP through `reqwest`. Fetches are bounded by a
//! per-request timeout; watch connections are long-lived and exempt.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use errors::RemoteError;
use strata_core::{ProviderKind, RemoteKeyPath};

pub mod consul;
pub mod crypto;
pub mod etcd;
pub mod secure;

pub use consul::ConsulSource;
pub use crypto::SecretKeyring;
pub use etcd::EtcdV3Source;
pub use secure::SecureHttpSource;

/// Default bound for a single fetch request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between watch reconnect attempts. Fixed interval, no jitter or
/// exponential growth: watch recovery favors predictability over politeness.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub(crate) const EVENT_BUFFER: usize = 100;

/// Connection options shared by all backends.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl RemoteOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: None,
            password: None,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A live watch on one remote key.
///
/// `events` carries raw change payloads in arrival order; `task` is the
/// backend pump, joined after the shutdown signal flips so cancellation is
/// observable.
pub struct RemoteWatch {
    pub events: mpsc::Receiver<Vec<u8>>,
    pub task: tokio::task::JoinHandle<()>,
}

/// A remote configuration backend.
///
/// `fetch` returns the plaintext payload for a key (the secure backend
/// decrypts before returning). `watch` spawns a pump that forwards raw
/// change payloads until the shutdown signal flips to `true`; backends that
/// cannot watch say so via `supports_watch` and return
/// [`RemoteError::WatchUnsupported`].
#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn supports_watch(&self) -> bool;

    async fn fetch(&self, key: &RemoteKeyPath) -> Result<Vec<u8>, RemoteError>;

    async fn watch(
        &self,
        key: &RemoteKeyPath,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RemoteWatch, RemoteError>;
}

/// Normalizes an endpoint to a scheme-qualified base URL without a trailing
/// slash. Bare `host:port` endpoints default to `https`.
pub(crate) fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Maps a reqwest failure to the taxonomy, distinguishing deadline expiry
/// from other transport faults.
pub(crate) fn map_transport_error(err: &reqwest::Error, timeout: Duration) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout {
            seconds: timeout.as_secs(),
        }
    } else {
        RemoteError::Transport {
            reason: err.to_string(),
        }
    }
}

/// Waits out one reconnect interval unless shutdown arrives first.
/// Returns `true` when the pump should stop. A dropped shutdown sender
/// counts as shutdown.
pub(crate) async fn pause_or_stop(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_DELAY) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
