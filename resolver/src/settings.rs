//! Resolver settings and the environment loader.
//!
//! Follows 12-factor conventions: every knob can come from an environment
//! variable under a caller-chosen prefix, with sensible defaults. Unknown
//! provider or format tags are rejected here, at parse time, so a
//! misconfigured process stops before its first fetch.
//!
//! # Naming Convention
//! With prefix `MYAPP`:
//! - `MYAPP_REMOTE_PROVIDER`: backend kind (`etcd3`/`consul`/`secure`, default: `secure`)
//! - `MYAPP_REMOTE_ENDPOINT`: endpoint URI (empty: remote tier disabled)
//! - `MYAPP_REMOTE_USERNAME`: backend username (optional)
//! - `MYAPP_REMOTE_PASSWORD`: backend password, or the ACL token for Consul (optional)
//! - `MYAPP_REMOTE_PROJECT`: project identifier fed into the service identity
//! - `MYAPP_REMOTE_FORMAT`: payload format (`json`/`yaml`, default: `json`)
//! - `MYAPP_REMOTE_WATCH`: enable live updates (`true`/`false`, default: `false`)
//! - `MYAPP_REMOTE_TIMEOUT_SECONDS`: fetch timeout (default: 5)
//! - `MYAPP_CACHE_DIR`: local cache directory (default: `config`)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use errors::ResolveError;
use strata_core::{ConfigFormat, ProviderKind};

/// Directory used for the local cache tier when none is configured.
pub const DEFAULT_CACHE_DIR: &str = "config";

/// Fetch timeout applied when none is configured.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 5;

/// Connection settings for the remote configuration store.
///
/// Constructed once, from the environment or directly, and read-only
/// afterwards. The remote tier is enabled by a non-empty `endpoint`;
/// everything else refines how that endpoint is spoken to.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ProviderConfig {
    /// Backend kind; selects the wire protocol and the key-path layout.
    #[serde(default)]
    pub kind: ProviderKind,

    /// Endpoint URI. Empty disables the remote tier entirely.
    #[serde(default)]
    pub endpoint: String,

    /// Backend username, where the backend authenticates.
    #[serde(default)]
    pub username: Option<String>,

    /// Backend password. Consul reads its ACL token from this slot.
    #[serde(default)]
    pub password: Option<String>,

    /// Project identifier for the service identity. Kept here because it
    /// arrives through the same environment convention; callers feed it
    /// into their `ServiceIdentity`.
    #[serde(default)]
    pub project: Option<String>,

    /// Serialization format of configuration payloads and cache entries.
    #[serde(default)]
    pub format: ConfigFormat,

    /// Request live updates after resolution when the backend supports them.
    #[serde(default)]
    pub watch: bool,

    /// Upper bound on a single fetch, in seconds.
    #[serde(default = "default_timeout_seconds")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: String::new(),
            username: None,
            password: None,
            project: None,
            format: ConfigFormat::default(),
            watch: false,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl ProviderConfig {
    /// Loads provider settings from `{PREFIX}_REMOTE_*` environment
    /// variables. Unset or blank variables keep their defaults; an unknown
    /// provider or format tag is an error.
    pub fn from_env(prefix: &str) -> Result<Self, ResolveError> {
        let prefix = prefix.trim().to_ascii_uppercase();

        let kind = match env_var(&prefix, "REMOTE_PROVIDER") {
            Some(raw) => raw
                .parse::<ProviderKind>()
                .map_err(|_| ResolveError::UnsupportedProvider { kind: raw })?,
            None => ProviderKind::default(),
        };
        let format = match env_var(&prefix, "REMOTE_FORMAT") {
            Some(raw) => raw
                .parse::<ConfigFormat>()
                .map_err(|_| ResolveError::InvalidSettings {
                    reason: format!("unknown configuration format {raw:?}"),
                })?,
            None => ConfigFormat::default(),
        };

        Ok(Self {
            kind,
            endpoint: env_var(&prefix, "REMOTE_ENDPOINT").unwrap_or_default(),
            username: env_var(&prefix, "REMOTE_USERNAME"),
            password: env_var(&prefix, "REMOTE_PASSWORD"),
            project: env_var(&prefix, "REMOTE_PROJECT"),
            format,
            watch: parse_env(&prefix, "REMOTE_WATCH").unwrap_or(false),
            timeout_seconds: parse_env(&prefix, "REMOTE_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        })
    }

    /// Whether the remote tier participates in resolution.
    pub fn remote_enabled(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Everything a [`crate::ConfigResolver`] needs, gathered in one place.
///
/// `defaults` must serialize to a JSON object; the resolver checks this at
/// construction and refuses anything else, since a broken `Default` tier
/// would leave resolution with no floor to land on.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ResolverSettings {
    /// Remote store connection settings.
    #[validate(nested)]
    pub provider: ProviderConfig,

    /// Explicit configuration file supplied at startup (flag/argument).
    /// When set and readable, it wins over every other tier.
    #[serde(default)]
    pub runtime_config_path: Option<PathBuf>,

    /// Directory of the local cache tier.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Recipient public key (SPKI PEM) for the secure provider. Required
    /// when `provider.kind` is `secure` and the remote tier is enabled.
    #[serde(default)]
    pub recipient_public_key_pem: Option<String>,

    /// Compiled-in defaults, the tier of last resort.
    #[serde(default = "default_defaults")]
    pub defaults: serde_json::Value,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_defaults() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::new(ProviderConfig::default())
    }
}

impl ResolverSettings {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            runtime_config_path: None,
            cache_dir: default_cache_dir(),
            recipient_public_key_pem: None,
            defaults: default_defaults(),
        }
    }

    /// Loads settings from the environment under `prefix`. The runtime
    /// config path, recipient key, and defaults are not environment
    /// concerns; set them on the returned value.
    pub fn from_env(prefix: &str) -> Result<Self, ResolveError> {
        let provider = ProviderConfig::from_env(prefix)?;
        let cache_dir = env_var(&prefix.trim().to_ascii_uppercase(), "CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);
        Ok(Self {
            cache_dir,
            ..Self::new(provider)
        })
    }

    /// Replaces the compiled-in defaults with any serializable value whose
    /// JSON form is an object.
    pub fn with_defaults<T: Serialize>(mut self, defaults: &T) -> Result<Self, ResolveError> {
        self.defaults =
            serde_json::to_value(defaults).map_err(|e| ResolveError::InvalidDefaults {
                reason: e.to_string(),
            })?;
        Ok(self)
    }
}

fn env_var(prefix: &str, name: &str) -> Option<String> {
    std::env::var(format!("{prefix}_{name}"))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(prefix: &str, name: &str) -> Option<T> {
    env_var(prefix, name)?.parse().ok()
}
