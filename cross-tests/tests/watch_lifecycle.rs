//! Watch subscription lifecycle: snapshots carry strictly increasing
//! sequence numbers, unparsable payloads leave the previous snapshot
//! active, and shutdown closes the channel exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use errors::RemoteError;
use remote::{RemoteSource, RemoteWatch};
use resolver::{ConfigResolver, ProviderConfig, Resolution, ResolverSettings};
use strata_core::{InstanceTag, ProviderKind, RemoteKeyPath, ServiceIdentity, SourceTier};

const WAIT: Duration = Duration::from_secs(5);

/// Watchable backend fed by the test: change payloads pushed into `feed`
/// come out of the subscription's event stream.
struct FeedSource {
    payload: Option<Vec<u8>>,
    feed: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl FeedSource {
    fn new(payload: Option<&[u8]>) -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
        let (feed_tx, feed_rx) = mpsc::channel(8);
        let source = Arc::new(Self {
            payload: payload.map(<[u8]>::to_vec),
            feed: Mutex::new(Some(feed_rx)),
        });
        (source, feed_tx)
    }
}

#[async_trait]
impl RemoteSource for FeedSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::EtcdV3
    }

    fn supports_watch(&self) -> bool {
        true
    }

    async fn fetch(&self, _key: &RemoteKeyPath) -> Result<Vec<u8>, RemoteError> {
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
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RemoteWatch, RemoteError> {
        let mut feed = self
            .feed
            .lock()
            .unwrap()
            .take()
            .expect("watch may only be started once per source");
        let (events_tx, events_rx) = mpsc::channel(8);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = feed.recv() => {
                        let Some(payload) = payload else { break };
                        if events_tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(RemoteWatch {
            events: events_rx,
            task,
        })
    }
}

fn identity() -> ServiceIdentity {
    ServiceIdentity::new("virzz", "com.virzz.myservice", "1.2.0")
}

async fn resolve_with(source: Arc<FeedSource>, cache_dir: &std::path::Path) -> Resolution {
    let mut settings = ResolverSettings::new(ProviderConfig {
        watch: true,
        ..ProviderConfig::default()
    });
    settings.cache_dir = cache_dir.to_path_buf();
    let resolver = ConfigResolver::with_source(settings, source).unwrap();
    resolver
        .resolve(&identity(), &InstanceTag::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn updates_arrive_with_strictly_increasing_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let (source, feed) = FeedSource::new(Some(br#"{"a":"1"}"#));

    let resolution = resolve_with(source, dir.path()).await;
    assert_eq!(resolution.snapshot.tier, SourceTier::Remote);
    assert_eq!(resolution.snapshot.sequence, 0);

    let subscription = resolution.subscription.expect("watch was requested");
    let mut snapshots = subscription.snapshots();

    feed.send(br#"{"a":"3"}"#.to_vec()).await.unwrap();
    timeout(WAIT, snapshots.changed()).await.unwrap().unwrap();
    let first = snapshots.borrow_and_update().clone();
    assert_eq!(first.sequence, 1);
    assert_eq!(first.get("a").and_then(|v| v.as_str()), Some("3"));

    feed.send(br#"{"a":"4"}"#.to_vec()).await.unwrap();
    timeout(WAIT, snapshots.changed()).await.unwrap().unwrap();
    let second = snapshots.borrow_and_update().clone();
    assert!(second.sequence > first.sequence);
    assert_eq!(second.get("a").and_then(|v| v.as_str()), Some("4"));

    // After shutdown the channel closes exactly once and nothing more
    // arrives.
    timeout(WAIT, subscription.shutdown())
        .await
        .expect("shutdown must join both tasks");
    assert!(snapshots.changed().await.is_err());
}

#[tokio::test]
async fn unparsable_payloads_keep_the_previous_snapshot_active() {
    let dir = tempfile::tempdir().unwrap();
    let (source, feed) = FeedSource::new(Some(br#"{"a":"1"}"#));

    let resolution = resolve_with(source, dir.path()).await;
    let mut subscription = resolution.subscription.expect("watch was requested");
    let mut snapshots = subscription.snapshots();

    feed.send(b"certainly not a document".to_vec()).await.unwrap();

    // The parse failure is reported once on the side channel while the
    // seed snapshot stays current.
    let notice = timeout(WAIT, subscription.notice())
        .await
        .unwrap()
        .expect("a parse notice was due");
    assert_eq!(notice.provider, ProviderKind::EtcdV3);
    assert!(!snapshots.has_changed().unwrap());

    // A later good payload resumes publishing with the next sequence.
    feed.send(br#"{"a":"5"}"#.to_vec()).await.unwrap();
    timeout(WAIT, snapshots.changed()).await.unwrap().unwrap();
    let fresh = snapshots.borrow_and_update().clone();
    assert_eq!(fresh.sequence, 1);
    assert_eq!(fresh.get("a").and_then(|v| v.as_str()), Some("5"));

    timeout(WAIT, subscription.shutdown())
        .await
        .expect("shutdown must join both tasks");
}

#[tokio::test]
async fn watch_starts_even_when_resolution_fell_through() {
    let dir = tempfile::tempdir().unwrap();
    let (source, feed) = FeedSource::new(None);

    // Remote down, cache empty: resolution lands on the defaults, but the
    // subscription still opens so a recovering store pushes the first
    // fresh snapshot.
    let resolution = resolve_with(source, dir.path()).await;
    assert_eq!(resolution.snapshot.tier, SourceTier::Default);

    let subscription = resolution.subscription.expect("watch was requested");
    let mut snapshots = subscription.snapshots();
    assert_eq!(snapshots.borrow_and_update().tier, SourceTier::Default);

    feed.send(br#"{"a":"recovered"}"#.to_vec()).await.unwrap();
    timeout(WAIT, snapshots.changed()).await.unwrap().unwrap();
    let fresh = snapshots.borrow_and_update().clone();
    assert_eq!(fresh.tier, SourceTier::Remote);
    assert_eq!(fresh.sequence, 1);
    assert_eq!(fresh.get("a").and_then(|v| v.as_str()), Some("recovered"));

    timeout(WAIT, subscription.shutdown())
        .await
        .expect("shutdown must join both tasks");
}
