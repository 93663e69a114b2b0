//! Consul KV backend.
//!
//! Fetches read `GET /v1/kv{key}?raw=true`; the watch runs Consul blocking
//! queries, advancing on the `X-Consul-Index` header. The ACL token rides
//! in the password slot and is sent as `X-Consul-Token`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use errors::RemoteError;
use strata_core::{ProviderKind, RemoteKeyPath};

use crate::{
    EVENT_BUFFER, RemoteOptions, RemoteSource, RemoteWatch, map_transport_error,
    normalize_endpoint, pause_or_stop,
};

/// Server-side hold of a blocking query.
const BLOCK_WAIT: &str = "5s";

/// Client-side deadline for one blocking query: the wait window plus grace
/// for Consul's added jitter.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(8);

pub struct ConsulSource {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl ConsulSource {
    pub fn new(options: RemoteOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: normalize_endpoint(&options.endpoint),
            token: options.password,
            timeout: options.timeout,
        }
    }

    fn kv_url(&self, key: &RemoteKeyPath) -> String {
        format!("{}/v1/kv{}", self.endpoint, key.as_str())
    }
}

#[async_trait]
impl RemoteSource for ConsulSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Consul
    }

    fn supports_watch(&self) -> bool {
        true
    }

    async fn fetch(&self, key: &RemoteKeyPath) -> Result<Vec<u8>, RemoteError> {
        let mut request = self
            .client
            .get(self.kv_url(key))
            .query(&[("raw", "true")])
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.timeout))?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(RemoteError::NotFound {
                key: key.to_string(),
            }),
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| map_transport_error(&e, self.timeout))?;
                Ok(body.to_vec())
            }
            status => Err(RemoteError::RequestFailed {
                provider: self.kind().to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn watch(
        &self,
        key: &RemoteKeyPath,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RemoteWatch, RemoteError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.client.clone();
        let url = self.kv_url(key);
        let token = self.token.clone();
        let key = key.clone();
        let provider = self.kind().to_string();

        let task = tokio::spawn(async move {
            info!(key = %key, "Starting consul watch");
            let mut last_index: Option<u64> = None;
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let mut request = client
                    .get(&url)
                    .query(&[("raw", "true")])
                    .timeout(BLOCK_TIMEOUT);
                if let Some(index) = last_index {
                    request = request
                        .query(&[("index", index.to_string())])
                        .query(&[("wait", BLOCK_WAIT)]);
                }
                if let Some(token) = &token {
                    request = request.header("X-Consul-Token", token);
                }

                let outcome = tokio::select! {
                    result = request.send() => result,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                match outcome {
                    Ok(response) if response.status().is_success() => {
                        let index = consul_index(response.headers());
                        let body = match response.bytes().await {
                            Ok(body) => body,
                            Err(e) => {
                                warn!(key = %key, error = %e, "consul watch body read failed");
                                metrics::counter!(
                                    "config.watch.reconnects", "provider" => provider.clone()
                                )
                                .increment(1);
                                if pause_or_stop(&mut shutdown).await {
                                    break;
                                }
                                continue;
                            }
                        };

                        // The first observation only seeds the index; the
                        // resolver already holds the current document.
                        let advanced = match (last_index, index) {
                            (Some(prev), Some(next)) => next > prev,
                            (Some(_), None) => true,
                            (None, _) => false,
                        };
                        match index {
                            Some(next) => last_index = Some(next),
                            None => last_index = last_index.or(Some(0)),
                        }

                        if advanced {
                            if events_tx.send(body.to_vec()).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        // Index unchanged: the wait window elapsed, or the
                        // server answered immediately. The pause keeps a
                        // misbehaving server from turning this into a busy
                        // loop.
                        if pause_or_stop(&mut shutdown).await {
                            break;
                        }
                    }
                    Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                        if let Some(next) = consul_index(response.headers()) {
                            last_index = Some(next);
                        }
                        debug!(key = %key, "consul key absent, still watching");
                        if pause_or_stop(&mut shutdown).await {
                            break;
                        }
                    }
                    Ok(response) => {
                        warn!(
                            key = %key,
                            status = response.status().as_u16(),
                            "consul watch query failed"
                        );
                        metrics::counter!("config.watch.reconnects", "provider" => provider.clone())
                            .increment(1);
                        if pause_or_stop(&mut shutdown).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "consul watch request failed");
                        metrics::counter!("config.watch.reconnects", "provider" => provider.clone())
                            .increment(1);
                        if pause_or_stop(&mut shutdown).await {
                            break;
                        }
                    }
                }
            }
            debug!(key = %key, "consul watch pump stopped");
        });

        Ok(RemoteWatch {
            events: events_rx,
            task,
        })
    }
}

fn consul_index(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers.get("X-Consul-Index")?.to_str().ok()?.parse().ok()
}
