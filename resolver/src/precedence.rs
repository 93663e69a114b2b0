//! Tiered configuration resolution with strict precedence.
//!
//! # Precedence Order
//! 1. Runtime file (highest priority — an explicit operator override)
//! 2. Remote store
//! 3. Local cache
//! 4. Compiled-in defaults (lowest priority, always succeeds)
//!
//! Tiers are attempted strictly in order and never concurrently: a later
//! tier exists to recover from the failure of an earlier one, not to race
//! it. Every tier-local failure is logged and converted into fallback; the
//! only errors a caller ever sees are construction-time misconfiguration.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use errors::{CacheError, RemoteError, ResolveError};
use remote::{ConsulSource, EtcdV3Source, RemoteOptions, RemoteSource, SecureHttpSource};
use strata_core::{
    ConfigFormat, ConfigSnapshot, InstanceTag, ProviderKind, RemoteKeyPath, ServiceIdentity,
    SourceTier,
};

use crate::cache::LocalCache;
use crate::settings::ResolverSettings;
use crate::watch::WatchSubscription;

/// Outcome of one resolution run: the active snapshot and, when live
/// updates were requested and the backend can serve them, a subscription.
pub struct Resolution {
    pub snapshot: ConfigSnapshot,
    pub subscription: Option<WatchSubscription>,
}

/// Resolves configuration for service instances from layered sources.
///
/// Constructed once per process from validated [`ResolverSettings`]; holds
/// no mutable state, so a single value serves concurrent `resolve` calls
/// for different instance tags. Backend dispatch, settings validation, and
/// the one-time sealing of the secure session secret all happen in the
/// constructor — misconfiguration surfaces here, never during a fetch.
pub struct ConfigResolver {
    settings: ResolverSettings,
    source: Option<Arc<dyn RemoteSource>>,
    cache: LocalCache,
    defaults: ConfigSnapshot,
}

impl ConfigResolver {
    /// Builds a resolver, constructing the remote backend named by the
    /// provider kind when an endpoint is configured.
    pub fn new(settings: ResolverSettings) -> Result<Self, ResolveError> {
        let defaults = prepare(&settings)?;
        let source = if settings.provider.remote_enabled() {
            Some(build_source(&settings)?)
        } else {
            None
        };
        Ok(Self {
            cache: LocalCache::new(&settings.cache_dir),
            settings,
            source,
            defaults,
        })
    }

    /// Builds a resolver around a caller-supplied backend, bypassing
    /// provider-kind dispatch. The remote tier is enabled regardless of the
    /// configured endpoint.
    pub fn with_source(
        settings: ResolverSettings,
        source: Arc<dyn RemoteSource>,
    ) -> Result<Self, ResolveError> {
        let defaults = prepare(&settings)?;
        Ok(Self {
            cache: LocalCache::new(&settings.cache_dir),
            settings,
            source: Some(source),
            defaults,
        })
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Resolves the configuration for one service instance.
    ///
    /// Walks the tiers in strict order and short-circuits on the first
    /// success. A remote win additionally persists the raw payload to the
    /// local cache in a detached best-effort task. A runtime-file win never
    /// starts a watch (it is an explicit operator override); any other
    /// outcome starts one when the watch flag is set and the backend
    /// supports it — a subscription opened after a remote miss delivers the
    /// first fresh snapshot once the store recovers.
    #[instrument(skip_all, fields(instance = %instance))]
    pub async fn resolve(
        &self,
        identity: &ServiceIdentity,
        instance: &InstanceTag,
    ) -> Result<Resolution, ResolveError> {
        if let Some(path) = &self.settings.runtime_config_path {
            if let Some(snapshot) = self.try_runtime(path) {
                return Ok(Resolution {
                    snapshot,
                    subscription: None,
                });
            }
        }

        let remote = self.remote_target(identity, instance);

        if let Some((source, key)) = &remote {
            if let Some(snapshot) = self.try_remote(source.as_ref(), key, instance).await {
                let subscription = self.start_watch(source, key, &snapshot).await;
                return Ok(Resolution {
                    snapshot,
                    subscription,
                });
            }
        }

        if let Some(snapshot) = self.try_local(instance) {
            let subscription = match &remote {
                Some((source, key)) => self.start_watch(source, key, &snapshot).await,
                None => None,
            };
            return Ok(Resolution {
                snapshot,
                subscription,
            });
        }

        info!("Resolved compiled-in default configuration");
        let snapshot = self.defaults.clone();
        let subscription = match &remote {
            Some((source, key)) => self.start_watch(source, key, &snapshot).await,
            None => None,
        };
        Ok(Resolution {
            snapshot,
            subscription,
        })
    }

    /// Runtime tier: the explicit configuration file, when one was supplied.
    /// Format is detected from the extension, falling back to the provider
    /// format tag.
    fn try_runtime(&self, path: &Path) -> Option<ConfigSnapshot> {
        let format = ConfigFormat::from_path(path).unwrap_or(self.settings.provider.format);
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Runtime configuration file unreadable, falling back"
                );
                record_fallback("runtime");
                return None;
            }
        };
        match ConfigSnapshot::parse(SourceTier::Runtime, format, &bytes) {
            Ok(snapshot) => {
                info!(path = %path.display(), "Resolved configuration from runtime file");
                Some(snapshot)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Runtime configuration file unparsable, falling back"
                );
                record_fallback("runtime");
                None
            }
        }
    }

    /// Remote tier: bounded fetch, parse, detached write-through. Remote
    /// unavailability is expected and recoverable, hence warnings rather
    /// than errors, and a malformed payload is never retried within the
    /// same resolution run.
    async fn try_remote(
        &self,
        source: &dyn RemoteSource,
        key: &RemoteKeyPath,
        instance: &InstanceTag,
    ) -> Option<ConfigSnapshot> {
        let timeout = self.settings.provider.fetch_timeout();
        let fetched = match tokio::time::timeout(timeout, source.fetch(key)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                seconds: timeout.as_secs(),
            }),
        };
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    key = %key,
                    provider = %source.kind(),
                    error = %e,
                    "Remote fetch failed, falling back"
                );
                record_fallback("remote");
                return None;
            }
        };
        match ConfigSnapshot::parse(SourceTier::Remote, self.settings.provider.format, &bytes) {
            Ok(snapshot) => {
                info!(
                    key = %key,
                    provider = %source.kind(),
                    "Resolved configuration from remote store"
                );
                self.write_through(instance, bytes);
                Some(snapshot)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Remote payload unparsable, falling back");
                record_fallback("remote");
                None
            }
        }
    }

    /// Local tier: the last-known-good document cached by a previous run.
    fn try_local(&self, instance: &InstanceTag) -> Option<ConfigSnapshot> {
        let format = self.settings.provider.format;
        let bytes = match self.cache.load(instance, format) {
            Ok(bytes) => bytes,
            Err(CacheError::NotFound { path }) => {
                debug!(path = %path, "No cached configuration");
                record_fallback("local");
                return None;
            }
            Err(e) => {
                warn!(
                    instance = %instance,
                    error = %e,
                    "Cached configuration unreadable, falling back"
                );
                record_fallback("local");
                return None;
            }
        };
        match ConfigSnapshot::parse(SourceTier::Local, format, &bytes) {
            Ok(snapshot) => {
                info!(instance = %instance, "Resolved configuration from local cache");
                Some(snapshot)
            }
            Err(e) => {
                warn!(
                    instance = %instance,
                    error = %e,
                    "Cached configuration unparsable, falling back"
                );
                record_fallback("local");
                None
            }
        }
    }

    /// The remote tier's target, when the tier participates: a configured
    /// backend plus a project-bearing identity.
    fn remote_target(
        &self,
        identity: &ServiceIdentity,
        instance: &InstanceTag,
    ) -> Option<(Arc<dyn RemoteSource>, RemoteKeyPath)> {
        let source = self.source.as_ref()?;
        if !identity.has_project() {
            debug!("Remote tier skipped: service identity has no project");
            return None;
        }
        let key = RemoteKeyPath::for_provider(source.kind(), identity, instance);
        Some((Arc::clone(source), key))
    }

    /// Detached best-effort persistence of a freshly fetched document. A
    /// failure here is logged and forgotten — it must never block or fail
    /// the resolution that triggered it.
    fn write_through(&self, instance: &InstanceTag, bytes: Vec<u8>) {
        let cache = self.cache.clone();
        let instance = instance.clone();
        let format = self.settings.provider.format;
        tokio::task::spawn_blocking(move || match cache.save(&instance, format, &bytes) {
            Ok(path) => debug!(path = %path.display(), "Cached remote configuration"),
            Err(e) => warn!(instance = %instance, error = %e, "Cache write-through failed"),
        });
    }

    /// Starts a watch subscription seeded with the resolved snapshot, when
    /// live updates are enabled and the backend can serve them.
    async fn start_watch(
        &self,
        source: &Arc<dyn RemoteSource>,
        key: &RemoteKeyPath,
        seed: &ConfigSnapshot,
    ) -> Option<WatchSubscription> {
        if !self.settings.provider.watch || !source.supports_watch() {
            return None;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        match source.watch(key, shutdown_rx).await {
            Ok(remote_watch) => {
                info!(key = %key, provider = %source.kind(), "Started configuration watch");
                Some(WatchSubscription::start(
                    remote_watch,
                    self.settings.provider.format,
                    seed.clone(),
                    shutdown_tx,
                    source.kind(),
                    key.clone(),
                ))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Could not start configuration watch");
                None
            }
        }
    }
}

/// Shared construction steps: validate the settings and materialize the
/// `Default`-tier snapshot. A non-object defaults value is a programming
/// error and is rejected here.
fn prepare(settings: &ResolverSettings) -> Result<ConfigSnapshot, ResolveError> {
    settings
        .validate()
        .map_err(|e| ResolveError::InvalidSettings {
            reason: e.to_string(),
        })?;
    ConfigSnapshot::from_defaults(&settings.defaults).map_err(|e| ResolveError::InvalidDefaults {
        reason: e.to_string(),
    })
}

/// Exhaustive backend dispatch over the closed provider set. The secure
/// provider seals its session secret here, exactly once per process.
fn build_source(settings: &ResolverSettings) -> Result<Arc<dyn RemoteSource>, ResolveError> {
    let provider = &settings.provider;
    let options = RemoteOptions {
        endpoint: provider.endpoint.clone(),
        username: provider.username.clone(),
        password: provider.password.clone(),
        timeout: provider.fetch_timeout(),
    };
    let source: Arc<dyn RemoteSource> = match provider.kind {
        ProviderKind::EtcdV3 => Arc::new(EtcdV3Source::new(options)),
        ProviderKind::Consul => Arc::new(ConsulSource::new(options)),
        ProviderKind::SecureHttp => {
            let pem = settings.recipient_public_key_pem.as_deref().ok_or_else(|| {
                ResolveError::InvalidSettings {
                    reason: format!(
                        "provider {} requires a recipient public key",
                        ProviderKind::SecureHttp
                    ),
                }
            })?;
            Arc::new(SecureHttpSource::new(options, pem)?)
        }
    };
    Ok(source)
}

fn record_fallback(tier: &'static str) {
    metrics::counter!("config.resolve.fallbacks", "tier" => tier).increment(1);
}
