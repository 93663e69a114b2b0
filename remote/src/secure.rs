//! Encrypted HTTP backend.
//!
//! Each fetch POSTs the sealed session secret to `{endpoint}{key}` and
//! expects a 200 whose body is `base64(IV || AES-256-CBC(plaintext))`,
//! wrapped for the secret sent in the request. Watch is not part of this
//! provider's contract.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use tokio::sync::watch;
use tracing::debug;

use errors::{CryptoError, RemoteError};
use strata_core::{ProviderKind, RemoteKeyPath};

use crate::crypto::{self, SecretKeyring};
use crate::{RemoteOptions, RemoteSource, RemoteWatch, map_transport_error, normalize_endpoint};

const CONTENT_TYPE: &str = "application/object-stream";

pub struct SecureHttpSource {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    keyring: SecretKeyring,
    sealed_secret: Vec<u8>,
}

impl SecureHttpSource {
    /// Builds the backend and seals a fresh session secret under the
    /// recipient key. Sealing happens exactly once; every request reuses
    /// the same sealed blob.
    pub fn new(
        options: RemoteOptions,
        recipient_public_key_pem: &str,
    ) -> Result<Self, CryptoError> {
        let keyring = SecretKeyring::generate();
        let sealed_secret = crypto::seal(keyring.expose(), recipient_public_key_pem)?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: normalize_endpoint(&options.endpoint),
            timeout: options.timeout,
            keyring,
            sealed_secret,
        })
    }
}

#[async_trait]
impl RemoteSource for SecureHttpSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SecureHttp
    }

    fn supports_watch(&self) -> bool {
        false
    }

    async fn fetch(&self, key: &RemoteKeyPath) -> Result<Vec<u8>, RemoteError> {
        let url = format!("{}{}", self.endpoint, key.as_str());
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(self.sealed_secret.clone())
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.timeout))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(RemoteError::RequestFailed {
                provider: self.kind().to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(&e, self.timeout))?;
        let payload =
            general_purpose::STANDARD
                .decode(&body)
                .map_err(|e| RemoteError::Protocol {
                    reason: format!("response body is not base64: {e}"),
                })?;

        debug!(key = %key, payload_len = payload.len(), "Opening secure payload");
        match crypto::open(&payload, self.keyring.expose()) {
            Ok(plaintext) => Ok(plaintext),
            // A body shorter than one cipher block is a malformed response,
            // not a cipher failure.
            Err(CryptoError::ShortPayload { len }) => Err(RemoteError::Protocol {
                reason: format!("payload of {len} bytes is shorter than one cipher block"),
            }),
            Err(e) => Err(RemoteError::Crypto(e)),
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
