use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Deployment-instance discriminator for a service.
///
/// The tag selects which remote key and which cache file a resolution run
/// targets. The empty (or all-whitespace) tag normalizes to `"default"` so
/// that path derivation is total and deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct InstanceTag(String);

impl InstanceTag {
    pub fn new(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            Self::default()
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for InstanceTag {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl std::fmt::Display for InstanceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceTag {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl AsRef<str> for InstanceTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of the service asking for configuration.
///
/// Supplied once at startup and read-only afterwards. `project` groups
/// services in the remote store; remote resolution is skipped entirely when
/// it is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub project: String,
    pub app_id: String,
    pub version: String,
}

impl ServiceIdentity {
    pub fn new(
        project: impl Into<String>,
        app_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            app_id: app_id.into(),
            version: version.into(),
        }
    }

    pub fn has_project(&self) -> bool {
        !self.project.trim().is_empty()
    }
}

/// Remote configuration backend tag.
///
/// The set is closed: backend dispatch is an exhaustive match performed once
/// at resolver construction, and unknown tags are rejected when settings are
/// parsed rather than when the first request goes out.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ProviderKind {
    #[serde(rename = "etcd3", alias = "etcdv3")]
    #[strum(to_string = "etcd3", serialize = "etcdv3")]
    EtcdV3,
    #[strum(to_string = "consul")]
    Consul,
    #[default]
    #[serde(rename = "secure", alias = "https")]
    #[strum(to_string = "secure", serialize = "https")]
    SecureHttp,
}

/// Serialization format of configuration payloads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ConfigFormat {
    #[default]
    #[strum(to_string = "json")]
    Json,
    #[serde(alias = "yml")]
    #[strum(to_string = "yaml", serialize = "yml")]
    Yaml,
}

impl ConfigFormat {
    /// File extension used for cache entries in this format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    /// Detects the format from a file extension (`json`, `yaml`, `yml`).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    /// Parses a raw payload into a JSON object map.
    ///
    /// Both formats funnel into `serde_json::Value`; a well-formed document
    /// whose root is not an object is rejected, since configuration keys are
    /// always looked up by name.
    pub fn parse_object(
        self,
        bytes: &[u8],
    ) -> Result<serde_json::Map<String, serde_json::Value>, crate::snapshot::SnapshotError> {
        let parsed: serde_json::Value = match self {
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| crate::snapshot::SnapshotError::Parse {
                    format: self,
                    reason: e.to_string(),
                })?
            }
            Self::Yaml => {
                serde_yaml::from_slice(bytes).map_err(|e| crate::snapshot::SnapshotError::Parse {
                    format: self,
                    reason: e.to_string(),
                })?
            }
        };
        match parsed {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(crate::snapshot::SnapshotError::NotAnObject),
        }
    }
}

/// Deterministic key path for a service instance in the remote store.
///
/// Derivation is a pure function of identity, instance and provider kind:
/// two calls with equal inputs always yield equal paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteKeyPath(String);

impl RemoteKeyPath {
    /// Path layout of the secure HTTP provider:
    /// `/{project}/{app_id}/{version}/{instance}`.
    pub fn secure(identity: &ServiceIdentity, instance: &InstanceTag) -> Self {
        Self(format!(
            "/{}/{}/{}/{}",
            identity.project, identity.app_id, identity.version, instance
        ))
    }

    /// Path layout of the key-value providers (etcd, Consul):
    /// `/config/{app_id}/{project}/{instance}`.
    pub fn kv(identity: &ServiceIdentity, instance: &InstanceTag) -> Self {
        Self(format!(
            "/config/{}/{}/{}",
            identity.app_id, identity.project, instance
        ))
    }

    pub fn for_provider(
        kind: ProviderKind,
        identity: &ServiceIdentity,
        instance: &InstanceTag,
    ) -> Self {
        match kind {
            ProviderKind::SecureHttp => Self::secure(identity, instance),
            ProviderKind::EtcdV3 | ProviderKind::Consul => Self::kv(identity, instance),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for RemoteKeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provenance of a resolved configuration snapshot, ordered by precedence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceTier {
    Runtime,
    Remote,
    Local,
    Default,
}
