//! etcd v3 backend.
//!
//! Speaks the v3 JSON gateway: `POST /v3/kv/range` for fetches,
//! `POST /v3/watch` for the streaming watch, `POST /v3/auth/authenticate`
//! when credentials are configured. Keys and values cross the gateway
//! base64-encoded.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use errors::RemoteError;
use strata_core::{ProviderKind, RemoteKeyPath};

use crate::{
    EVENT_BUFFER, RemoteOptions, RemoteSource, RemoteWatch, map_transport_error,
    normalize_endpoint, pause_or_stop,
};

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Serialize)]
struct AuthenticateRequest {
    name: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct WatchRequest {
    create_request: WatchCreateRequest,
}

#[derive(Debug, Serialize)]
struct WatchCreateRequest {
    key: String,
}

#[derive(Debug, Deserialize)]
struct WatchFrame {
    #[serde(default)]
    result: Option<WatchResult>,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<WatchEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(default)]
    kv: Option<KeyValue>,
}

pub struct EtcdV3Source {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<(String, String)>,
    timeout: Duration,
}

impl EtcdV3Source {
    pub fn new(options: RemoteOptions) -> Self {
        let credentials = match (options.username, options.password) {
            (Some(name), Some(password)) => Some((name, password)),
            _ => None,
        };
        Self {
            client: reqwest::Client::new(),
            endpoint: normalize_endpoint(&options.endpoint),
            credentials,
            timeout: options.timeout,
        }
    }
}

#[async_trait]
impl RemoteSource for EtcdV3Source {
    fn kind(&self) -> ProviderKind {
        ProviderKind::EtcdV3
    }

    fn supports_watch(&self) -> bool {
        true
    }

    async fn fetch(&self, key: &RemoteKeyPath) -> Result<Vec<u8>, RemoteError> {
        let token = authenticate(
            &self.client,
            &self.endpoint,
            self.credentials.as_ref(),
            self.timeout,
        )
        .await?;

        let url = format!("{}/v3/kv/range", self.endpoint);
        let mut request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&RangeRequest {
                key: general_purpose::STANDARD.encode(key.as_str()),
            });
        if let Some(token) = &token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.timeout))?;
        if !response.status().is_success() {
            return Err(RemoteError::RequestFailed {
                provider: self.kind().to_string(),
                status: response.status().as_u16(),
            });
        }

        let body: RangeResponse = response.json().await.map_err(|e| RemoteError::Protocol {
            reason: format!("range response: {e}"),
        })?;
        let kv = body
            .kvs
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound {
                key: key.to_string(),
            })?;
        general_purpose::STANDARD
            .decode(&kv.value)
            .map_err(|e| RemoteError::Protocol {
                reason: format!("value is not base64: {e}"),
            })
    }

    async fn watch(
        &self,
        key: &RemoteKeyPath,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RemoteWatch, RemoteError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let credentials = self.credentials.clone();
        let timeout = self.timeout;
        let key = key.clone();
        let provider = self.kind().to_string();

        let task = tokio::spawn(async move {
            info!(key = %key, "Starting etcd watch");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let outcome = tokio::select! {
                    result = open_watch_stream(
                        &client, &endpoint, credentials.as_ref(), timeout, &key
                    ) => Some(result),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        None
                    }
                };
                let Some(outcome) = outcome else { continue };
                match outcome {
                    Ok(mut response) => {
                        if pump_stream(&mut response, &events_tx, &mut shutdown).await {
                            break;
                        }
                        debug!(key = %key, "etcd watch stream ended");
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "etcd watch connection failed");
                    }
                }
                metrics::counter!("config.watch.reconnects", "provider" => provider.clone())
                    .increment(1);
                if pause_or_stop(&mut shutdown).await {
                    break;
                }
            }
            debug!(key = %key, "etcd watch pump stopped");
        });

        Ok(RemoteWatch {
            events: events_rx,
            task,
        })
    }
}

/// Exchanges configured credentials for a gateway token. `None` when the
/// backend runs without auth.
async fn authenticate(
    client: &reqwest::Client,
    endpoint: &str,
    credentials: Option<&(String, String)>,
    timeout: Duration,
) -> Result<Option<String>, RemoteError> {
    let Some((name, password)) = credentials else {
        return Ok(None);
    };
    let url = format!("{endpoint}/v3/auth/authenticate");
    let response = client
        .post(&url)
        .timeout(timeout)
        .json(&AuthenticateRequest {
            name: name.clone(),
            password: password.clone(),
        })
        .send()
        .await
        .map_err(|e| map_transport_error(&e, timeout))?;
    if !response.status().is_success() {
        return Err(RemoteError::RequestFailed {
            provider: ProviderKind::EtcdV3.to_string(),
            status: response.status().as_u16(),
        });
    }
    let body: AuthenticateResponse =
        response.json().await.map_err(|e| RemoteError::Protocol {
            reason: format!("authenticate response: {e}"),
        })?;
    Ok(Some(body.token))
}

async fn open_watch_stream(
    client: &reqwest::Client,
    endpoint: &str,
    credentials: Option<&(String, String)>,
    timeout: Duration,
    key: &RemoteKeyPath,
) -> Result<reqwest::Response, RemoteError> {
    let token = authenticate(client, endpoint, credentials, timeout).await?;
    let url = format!("{endpoint}/v3/watch");
    let mut request = client.post(&url).json(&WatchRequest {
        create_request: WatchCreateRequest {
            key: general_purpose::STANDARD.encode(key.as_str()),
        },
    });
    if let Some(token) = &token {
        request = request.header(reqwest::header::AUTHORIZATION, token);
    }
    // Long-lived stream, so no overall deadline on this request.
    let response = request
        .send()
        .await
        .map_err(|e| map_transport_error(&e, timeout))?;
    if !response.status().is_success() {
        return Err(RemoteError::RequestFailed {
            provider: ProviderKind::EtcdV3.to_string(),
            status: response.status().as_u16(),
        });
    }
    Ok(response)
}

/// Consumes one watch stream. Returns `true` when the pump should stop for
/// good (cancellation or subscriber gone), `false` to reconnect.
async fn pump_stream(
    response: &mut reqwest::Response,
    events: &mpsc::Sender<Vec<u8>>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            chunk = response.chunk() => {
                match chunk {
                    Ok(Some(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                        // The gateway emits newline-delimited JSON frames; a
                        // chunk may carry several, or a fraction of one.
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            if !forward_frame(&line, events).await {
                                return true;
                            }
                        }
                    }
                    Ok(None) => {
                        if !buffer.is_empty() && !forward_frame(&buffer, events).await {
                            return true;
                        }
                        return false;
                    }
                    Err(e) => {
                        warn!(error = %e, "etcd watch stream error");
                        return false;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

/// Forwards the PUT events of one frame. Returns `false` when the
/// subscriber side is gone.
async fn forward_frame(line: &[u8], events: &mpsc::Sender<Vec<u8>>) -> bool {
    let line = line.trim_ascii();
    if line.is_empty() {
        return true;
    }
    let frame: WatchFrame = match serde_json::from_slice(line) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Skipping unparsable etcd watch frame");
            return true;
        }
    };
    let Some(result) = frame.result else {
        return true;
    };
    for event in result.events {
        let Some(kv) = event.kv else { continue };
        if kv.value.is_empty() {
            // DELETE events carry no value; nothing to forward.
            continue;
        }
        match general_purpose::STANDARD.decode(&kv.value) {
            Ok(payload) => {
                if events.send(payload).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                debug!(error = %e, "Skipping etcd event with non-base64 value");
            }
        }
    }
    true
}
