//! Local last-known-good cache.
//!
//! One flat file per instance tag, `<dir>/<instance>.<format-ext>`, holding
//! the plaintext configuration blob. Entries are written through a temp
//! file in the same directory and renamed into place, so a reader never
//! observes a torn document; each tag owns a distinct file, so the rename
//! is all the locking there is.

use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::debug;

use errors::CacheError;
use strata_core::{ConfigFormat, InstanceTag};

#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the cache entry for an instance tag in a given format.
    pub fn entry_path(&self, instance: &InstanceTag, format: ConfigFormat) -> PathBuf {
        self.dir
            .join(format!("{}.{}", instance.as_str(), format.extension()))
    }

    /// Persists a configuration blob, creating the cache directory if
    /// absent. Overwrites atomically; saving identical bytes twice leaves
    /// the entry unchanged. Returns the entry path.
    pub fn save(
        &self,
        instance: &InstanceTag,
        format: ConfigFormat,
        bytes: &[u8],
    ) -> Result<PathBuf, CacheError> {
        let path = self.entry_path(instance, format);

        std::fs::create_dir_all(&self.dir).map_err(|e| CacheError::Io {
            path: self.dir.display().to_string(),
            reason: e.to_string(),
        })?;

        // Temp file in the target directory, so the rename never crosses a
        // filesystem boundary.
        let mut staged = NamedTempFile::new_in(&self.dir).map_err(|e| CacheError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        staged.write_all(bytes).map_err(|e| CacheError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        staged.persist(&path).map_err(|e| CacheError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        debug!(path = %path.display(), bytes = bytes.len(), "Saved cache entry");
        Ok(path)
    }

    /// Reads the cached blob for an instance tag. An absent entry is
    /// `CacheError::NotFound`; any other read failure is `CacheError::Io`.
    pub fn load(&self, instance: &InstanceTag, format: ConfigFormat) -> Result<Vec<u8>, CacheError> {
        let path = self.entry_path(instance, format);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CacheError::NotFound {
                path: path.display().to_string(),
            },
            _ => CacheError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_in_tempdir() -> (tempfile::TempDir, LocalCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        (dir, cache)
    }

    #[test]
    fn entry_layout_is_flat_tag_dot_extension() {
        let cache = LocalCache::new("/var/cache/strata");
        let path = cache.entry_path(&InstanceTag::new("worker-1"), ConfigFormat::Json);
        assert_eq!(path, PathBuf::from("/var/cache/strata/worker-1.json"));

        let path = cache.entry_path(&InstanceTag::default(), ConfigFormat::Yaml);
        assert_eq!(path, PathBuf::from("/var/cache/strata/default.yaml"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, cache) = cache_in_tempdir();
        let instance = InstanceTag::new("edge-1");

        let path = cache
            .save(&instance, ConfigFormat::Json, br#"{"a":"1"}"#)
            .unwrap();
        assert!(path.ends_with("edge-1.json"));

        let loaded = cache.load(&instance, ConfigFormat::Json).unwrap();
        assert_eq!(loaded, br#"{"a":"1"}"#);
    }

    #[test]
    fn save_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path().join("nested").join("cache"));
        cache
            .save(&InstanceTag::default(), ConfigFormat::Json, b"{}")
            .unwrap();
        assert!(dir.path().join("nested/cache/default.json").exists());
    }

    #[test]
    fn save_is_idempotent_for_identical_bytes() {
        let (_dir, cache) = cache_in_tempdir();
        let instance = InstanceTag::default();

        cache
            .save(&instance, ConfigFormat::Json, br#"{"a":"1"}"#)
            .unwrap();
        cache
            .save(&instance, ConfigFormat::Json, br#"{"a":"1"}"#)
            .unwrap();

        let loaded = cache.load(&instance, ConfigFormat::Json).unwrap();
        assert_eq!(loaded, br#"{"a":"1"}"#);
    }

    #[test]
    fn save_replaces_previous_content_wholesale() {
        let (_dir, cache) = cache_in_tempdir();
        let instance = InstanceTag::default();

        cache
            .save(&instance, ConfigFormat::Json, br#"{"a":"1","extra":"long"}"#)
            .unwrap();
        cache
            .save(&instance, ConfigFormat::Json, br#"{"a":"2"}"#)
            .unwrap();

        let loaded = cache.load(&instance, ConfigFormat::Json).unwrap();
        assert_eq!(loaded, br#"{"a":"2"}"#);
    }

    #[test]
    fn load_reports_absent_entries_as_not_found() {
        let (_dir, cache) = cache_in_tempdir();
        let err = cache
            .load(&InstanceTag::new("missing"), ConfigFormat::Json)
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }));
    }

    #[test]
    fn tags_and_formats_own_distinct_entries() {
        let (_dir, cache) = cache_in_tempdir();

        cache
            .save(&InstanceTag::new("a"), ConfigFormat::Json, b"{\"v\":1}")
            .unwrap();
        cache
            .save(&InstanceTag::new("b"), ConfigFormat::Json, b"{\"v\":2}")
            .unwrap();
        cache
            .save(&InstanceTag::new("a"), ConfigFormat::Yaml, b"v: 3\n")
            .unwrap();

        assert_eq!(
            cache.load(&InstanceTag::new("a"), ConfigFormat::Json).unwrap(),
            b"{\"v\":1}"
        );
        assert_eq!(
            cache.load(&InstanceTag::new("b"), ConfigFormat::Json).unwrap(),
            b"{\"v\":2}"
        );
        assert_eq!(
            cache.load(&InstanceTag::new("a"), ConfigFormat::Yaml).unwrap(),
            b"v: 3\n"
        );
    }
}
