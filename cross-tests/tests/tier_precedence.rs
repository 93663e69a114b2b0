//! Tier-ordering properties of the resolver, checked against a scripted
//! backend with call counters: a higher tier's success must leave every
//! lower tier untouched.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use errors::RemoteError;
use remote::{RemoteSource, RemoteWatch};
use resolver::{ConfigResolver, LocalCache, ProviderConfig, ResolverSettings};
use strata_core::{
    ConfigFormat, InstanceTag, ProviderKind, RemoteKeyPath, ServiceIdentity, SourceTier,
};

/// Remote backend whose fetch either answers a fixed payload or fails, and
/// which counts how often it was consulted.
struct CountingSource {
    payload: Option<Vec<u8>>,
    fetch_calls: AtomicUsize,
}

impl CountingSource {
    fn answering(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            payload: Some(payload.to_vec()),
            fetch_calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            payload: None,
            fetch_calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for CountingSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Consul
    }

    fn supports_watch(&self) -> bool {
        false
    }

    async fn fetch(&self, _key: &RemoteKeyPath) -> Result<Vec<u8>, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match &self.payload {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(RemoteError::Transport {
                reason: "scripted outage".to_string(),
            }),
        }
    }

    async fn watch(
        &self,
        _key: &RemoteKeyPath,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<RemoteWatch, RemoteError> {
        Err(RemoteError::WatchUnsupported {
            provider: self.kind().to_string(),
        })
    }
}

fn identity() -> ServiceIdentity {
    ServiceIdentity::new("virzz", "com.virzz.myservice", "1.2.0")
}

fn settings_in(dir: &Path) -> ResolverSettings {
    let mut settings = ResolverSettings::new(ProviderConfig::default());
    settings.cache_dir = dir.to_path_buf();
    settings
}

async fn wait_for_entry(path: &Path, expected: &[u8]) {
    for _ in 0..100 {
        if std::fs::read(path).map(|bytes| bytes == expected).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "cache entry {} never reached the expected content",
        path.display()
    );
}

#[tokio::test]
async fn runtime_tier_win_leaves_remote_and_cache_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let instance = InstanceTag::default();

    let runtime_path = dir.path().join("override.json");
    std::fs::write(&runtime_path, br#"{"a":"runtime"}"#).unwrap();

    let cache = LocalCache::new(dir.path());
    cache
        .save(&instance, ConfigFormat::Json, br#"{"a":"cached"}"#)
        .unwrap();

    let source = CountingSource::answering(br#"{"a":"remote"}"#);
    let mut settings = settings_in(dir.path());
    settings.runtime_config_path = Some(runtime_path);
    settings.provider.watch = true;

    let resolver = ConfigResolver::with_source(settings, source.clone()).unwrap();
    let resolution = resolver.resolve(&identity(), &instance).await.unwrap();

    assert_eq!(resolution.snapshot.tier, SourceTier::Runtime);
    assert_eq!(
        resolution.snapshot.get("a").and_then(|v| v.as_str()),
        Some("runtime")
    );
    assert!(resolution.subscription.is_none(), "runtime wins never watch");
    assert_eq!(source.calls(), 0, "remote must not be consulted");

    // The cache entry stays what it was; runtime wins never write through.
    let cached = cache.load(&instance, ConfigFormat::Json).unwrap();
    assert_eq!(cached, br#"{"a":"cached"}"#);
}

#[tokio::test]
async fn remote_tier_win_short_circuits_local_and_writes_through() {
    let dir = tempfile::tempdir().unwrap();
    let instance = InstanceTag::default();

    let cache = LocalCache::new(dir.path());
    cache
        .save(&instance, ConfigFormat::Json, br#"{"a":"stale"}"#)
        .unwrap();

    let source = CountingSource::answering(br#"{"a":"fresh"}"#);
    let resolver =
        ConfigResolver::with_source(settings_in(dir.path()), source.clone()).unwrap();
    let resolution = resolver.resolve(&identity(), &instance).await.unwrap();

    assert_eq!(resolution.snapshot.tier, SourceTier::Remote);
    assert_eq!(
        resolution.snapshot.get("a").and_then(|v| v.as_str()),
        Some("fresh")
    );
    assert_eq!(source.calls(), 1);

    // The detached write-through replaces the stale entry.
    wait_for_entry(&dir.path().join("default.json"), br#"{"a":"fresh"}"#).await;
}

#[tokio::test]
async fn remote_failure_falls_back_to_the_cached_document() {
    let dir = tempfile::tempdir().unwrap();
    let instance = InstanceTag::default();

    LocalCache::new(dir.path())
        .save(&instance, ConfigFormat::Json, br#"{"a":"2"}"#)
        .unwrap();

    let source = CountingSource::failing();
    let resolver =
        ConfigResolver::with_source(settings_in(dir.path()), source.clone()).unwrap();
    let resolution = resolver.resolve(&identity(), &instance).await.unwrap();

    assert_eq!(resolution.snapshot.tier, SourceTier::Local);
    assert_eq!(
        resolution.snapshot.get("a").and_then(|v| v.as_str()),
        Some("2")
    );
    assert_eq!(source.calls(), 1, "the remote tier was attempted first");
}

#[tokio::test]
async fn exhausted_tiers_land_on_the_compiled_defaults() {
    let dir = tempfile::tempdir().unwrap();

    let source = CountingSource::failing();
    let settings = settings_in(dir.path())
        .with_defaults(&serde_json::json!({"a": "compiled"}))
        .unwrap();
    let resolver = ConfigResolver::with_source(settings, source.clone()).unwrap();
    let resolution = resolver
        .resolve(&identity(), &InstanceTag::default())
        .await
        .unwrap();

    assert_eq!(resolution.snapshot.tier, SourceTier::Default);
    assert_eq!(
        resolution.snapshot.get("a").and_then(|v| v.as_str()),
        Some("compiled")
    );
}

#[tokio::test]
async fn remote_tier_is_skipped_without_a_project() {
    let dir = tempfile::tempdir().unwrap();

    let source = CountingSource::answering(br#"{"a":"remote"}"#);
    let resolver =
        ConfigResolver::with_source(settings_in(dir.path()), source.clone()).unwrap();
    let identity = ServiceIdentity::new("", "com.virzz.myservice", "1.2.0");
    let resolution = resolver
        .resolve(&identity, &InstanceTag::default())
        .await
        .unwrap();

    assert_eq!(resolution.snapshot.tier, SourceTier::Default);
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn instance_tags_resolve_independently() {
    let dir = tempfile::tempdir().unwrap();

    let source = CountingSource::answering(br#"{"a":"shared"}"#);
    let resolver =
        ConfigResolver::with_source(settings_in(dir.path()), source.clone()).unwrap();

    for tag in ["edge-1", "edge-2"] {
        let resolution = resolver
            .resolve(&identity(), &InstanceTag::new(tag))
            .await
            .unwrap();
        assert_eq!(resolution.snapshot.tier, SourceTier::Remote);
    }
    assert_eq!(source.calls(), 2);

    // Each tag owns its own cache entry.
    wait_for_entry(&dir.path().join("edge-1.json"), br#"{"a":"shared"}"#).await;
    wait_for_entry(&dir.path().join("edge-2.json"), br#"{"a":"shared"}"#).await;
}
