//! Live configuration watch.
//!
//! The backend pump (owned by the `remote` crate) forwards raw change
//! payloads; the republisher here parses each one into a fresh
//! [`ConfigSnapshot`] and publishes it on a latest-value channel. A slow
//! subscriber therefore observes only the newest snapshot, never a backlog.
//!
//! Unparsable payloads never kill the watch: the previous good snapshot
//! stays active, and the start of a parse-error streak is reported once on
//! a bounded side channel. Shutdown is cooperative and explicit — both
//! background tasks observe one signal and are joined before
//! [`WatchSubscription::shutdown`] returns.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use remote::RemoteWatch;
use strata_core::{ConfigFormat, ConfigSnapshot, ProviderKind, RemoteKeyPath, SourceTier};

/// The notice channel holds at most one entry; a streak is news once.
const NOTICE_BUFFER: usize = 1;

/// One-time report that a watch started receiving unparsable payloads.
///
/// The subscription keeps running on the previous good snapshot; this is a
/// diagnostic, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchNotice {
    pub provider: ProviderKind,
    pub key: RemoteKeyPath,
    pub reason: String,
}

/// A live, cancellable stream of configuration snapshots for one key.
///
/// Holds the shutdown signal and the handles of both background tasks.
/// Dropping the subscription also stops the tasks (the dropped signal reads
/// as cancellation), but [`shutdown`](Self::shutdown) is the contract: it
/// waits until nothing is left running.
pub struct WatchSubscription {
    snapshots: watch::Receiver<ConfigSnapshot>,
    notices: mpsc::Receiver<WatchNotice>,
    shutdown: watch::Sender<bool>,
    pump: JoinHandle<()>,
    republisher: JoinHandle<()>,
}

impl WatchSubscription {
    /// Wires a backend watch to a republisher task. The channel starts out
    /// holding `seed` (the snapshot resolution returned); every accepted
    /// update replaces it with the next sequence number.
    pub(crate) fn start(
        remote_watch: RemoteWatch,
        format: ConfigFormat,
        seed: ConfigSnapshot,
        shutdown: watch::Sender<bool>,
        provider: ProviderKind,
        key: RemoteKeyPath,
    ) -> Self {
        let (snapshots_tx, snapshots_rx) = watch::channel(seed.clone());
        let (notices_tx, notices_rx) = mpsc::channel(NOTICE_BUFFER);

        let republisher = tokio::spawn(republish(
            remote_watch.events,
            format,
            seed.sequence,
            snapshots_tx,
            notices_tx,
            shutdown.subscribe(),
            provider,
            key,
        ));

        Self {
            snapshots: snapshots_rx,
            notices: notices_rx,
            shutdown,
            pump: remote_watch.task,
            republisher,
        }
    }

    /// Latest-value channel of accepted snapshots.
    ///
    /// The receiver initially holds the seed snapshot; `changed()` resolves
    /// on every accepted update and errors once the subscription has shut
    /// down, which is how subscribers observe the close.
    pub fn snapshots(&self) -> watch::Receiver<ConfigSnapshot> {
        self.snapshots.clone()
    }

    /// Waits for the next parse notice. Returns `None` once the
    /// subscription has shut down without (further) notices.
    pub async fn notice(&mut self) -> Option<WatchNotice> {
        self.notices.recv().await
    }

    /// Non-blocking variant of [`notice`](Self::notice).
    pub fn try_notice(&mut self) -> Option<WatchNotice> {
        self.notices.try_recv().ok()
    }

    /// Signals cancellation and waits for both background tasks to finish.
    /// The backend closes its connection within one reconnect interval; the
    /// snapshot channel closes exactly once.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.pump.await;
        let _ = self.republisher.await;
    }
}

/// Parses raw change payloads into snapshots and republishes them until the
/// event stream ends or shutdown flips.
async fn republish(
    mut events: mpsc::Receiver<Vec<u8>>,
    format: ConfigFormat,
    start_sequence: u64,
    snapshots: watch::Sender<ConfigSnapshot>,
    notices: mpsc::Sender<WatchNotice>,
    mut shutdown: watch::Receiver<bool>,
    provider: ProviderKind,
    key: RemoteKeyPath,
) {
    let mut sequence = start_sequence;
    let mut parse_streak = false;

    loop {
        tokio::select! {
            payload = events.recv() => {
                let Some(payload) = payload else {
                    debug!(key = %key, "Watch event stream ended");
                    break;
                };
                match ConfigSnapshot::parse(SourceTier::Remote, format, &payload) {
                    Ok(mut snapshot) => {
                        sequence += 1;
                        snapshot.sequence = sequence;
                        parse_streak = false;
                        debug!(key = %key, sequence, "Publishing configuration snapshot");
                        if snapshots.send(snapshot).is_err() {
                            // Every receiver is gone; nobody is left to serve.
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            key = %key,
                            error = %e,
                            "Ignoring unparsable watch payload; previous snapshot stays active"
                        );
                        metrics::counter!(
                            "config.watch.parse_errors", "provider" => provider.to_string()
                        )
                        .increment(1);
                        if !parse_streak {
                            parse_streak = true;
                            let _ = notices.try_send(WatchNotice {
                                provider,
                                key: key.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(key = %key, "Watch republisher stopping");
                    break;
                }
            }
        }
    }
}
