//! Plugin source loader and cache
//!
//! Resolves a manifest to the source text to evaluate. Sources are cached per
//! `(id, version)`: a hit for the same version never touches the network, a
//! version change triggers a fetch, and a failed fetch falls back to the most
//! recent cached copy of any version.
//!
//! An optional on-disk layer keeps the fallback available across restarts.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::fetcher::SourceFetcher;
use super::manifest::{ExtractorRef, Manifest};
use crate::core::error::{HostError, Result};

/// A cached plugin source
#[derive(Debug, Clone)]
pub struct CachedSource {
    pub version: String,
    pub text: String,
    /// Hex SHA-256 of `text`
    pub digest: String,
    pub fetched_at: DateTime<Utc>,
}

impl CachedSource {
    fn new(version: &str, text: String) -> Self {
        Self {
            version: version.to_string(),
            digest: digest(&text),
            text,
            fetched_at: Utc::now(),
        }
    }
}

fn digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Loader resolving manifests to source text
pub struct SourceLoader {
    fetcher: Arc<dyn SourceFetcher>,
    memory: RwLock<HashMap<String, CachedSource>>,
    disk: Option<DiskCache>,
}

impl SourceLoader {
    /// Create a loader with an in-memory cache only
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            fetcher,
            memory: RwLock::new(HashMap::new()),
            disk: None,
        }
    }

    /// Create a loader that also persists sources under `cache_dir`
    pub fn with_disk_cache(fetcher: Arc<dyn SourceFetcher>, cache_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            disk: Some(DiskCache::new(cache_dir)?),
            ..Self::new(fetcher)
        })
    }

    /// Get the source text for a plugin manifest
    pub async fn get_source(&self, manifest: &Manifest) -> Result<String> {
        self.load(&manifest.id, &manifest.version, &manifest.entry_source)
            .await
    }

    /// Get the source text for an extractor referenced by a provider
    pub async fn get_extractor_source(&self, extractor: &ExtractorRef) -> Result<String> {
        self.load(&extractor.cache_key(), &extractor.version, &extractor.entry_source)
            .await
    }

    async fn load(&self, key: &str, version: &str, locator: &str) -> Result<String> {
        if let Some(hit) = self.memory.read().await.get(key) {
            if hit.version == version {
                debug!(key, version, "Source cache hit");
                return Ok(hit.text.clone());
            }
        }

        if let Some(disk) = &self.disk {
            if let Some(text) = disk.read(key, version).await {
                debug!(key, version, "Source restored from disk cache");
                return Ok(self.remember(key, version, text).await);
            }
        }

        match self.fetcher.fetch_text(locator).await {
            Ok(text) => {
                info!(key, version, locator, bytes = text.len(), "Fetched plugin source");
                if let Some(disk) = &self.disk {
                    if let Err(e) = disk.write(key, version, &text).await {
                        warn!(key, error = %e, "Failed to persist plugin source");
                    }
                }
                Ok(self.remember(key, version, text).await)
            }
            Err(e) => self.fallback(key, version, e.to_string()).await,
        }
    }

    async fn remember(&self, key: &str, version: &str, text: String) -> String {
        let entry = CachedSource::new(version, text);
        let text = entry.text.clone();
        self.memory.write().await.insert(key.to_string(), entry);
        text
    }

    /// Serve the newest cached copy after a failed fetch
    async fn fallback(&self, key: &str, version: &str, error: String) -> Result<String> {
        if let Some(stale) = self.memory.read().await.get(key) {
            warn!(
                key,
                wanted = version,
                serving = %stale.version,
                error = %error,
                "Fetch failed, serving cached source"
            );
            return Ok(stale.text.clone());
        }

        if let Some(disk) = &self.disk {
            if let Some((stale_version, text)) = disk.latest(key).await {
                warn!(
                    key,
                    wanted = version,
                    serving = %stale_version,
                    error = %error,
                    "Fetch failed, serving source from disk cache"
                );
                return Ok(text);
            }
        }

        Err(HostError::SourceFetchError {
            id: key.to_string(),
            message: error,
        })
    }

    /// Drop the cached source for one key from memory and disk
    pub async fn invalidate(&self, key: &str) {
        self.memory.write().await.remove(key);
        if let Some(disk) = &self.disk {
            disk.remove_key(key).await;
        }
    }

    /// Drop every cached source; returns the number of memory entries removed
    pub async fn clear(&self) -> usize {
        let removed = {
            let mut memory = self.memory.write().await;
            let n = memory.len();
            memory.clear();
            n
        };
        if let Some(disk) = &self.disk {
            disk.clear().await;
        }
        removed
    }

    /// Currently cached version per key
    pub async fn cached_versions(&self) -> HashMap<String, String> {
        self.memory
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.version.clone()))
            .collect()
    }
}

/// Directory of `<key>@<version>.js` files with `.sha256` sidecars
struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    fn new(dir: PathBuf) -> Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    fn source_path(&self, key: &str, version: &str) -> PathBuf {
        self.dir
            .join(format!("{}@{}.js", sanitize(key), sanitize(version)))
    }

    fn digest_path(source: &Path) -> PathBuf {
        let mut name = source.as_os_str().to_owned();
        name.push(".sha256");
        PathBuf::from(name)
    }

    async fn read(&self, key: &str, version: &str) -> Option<String> {
        Self::read_verified(&self.source_path(key, version)).await
    }

    async fn read_verified(path: &Path) -> Option<String> {
        let text = tokio::fs::read_to_string(path).await.ok()?;
        let expected = tokio::fs::read_to_string(Self::digest_path(path)).await.ok()?;

        if expected.trim() != digest(&text) {
            warn!(path = %path.display(), "Cached source failed digest check, ignoring");
            return None;
        }
        Some(text)
    }

    async fn write(&self, key: &str, version: &str, text: &str) -> std::io::Result<()> {
        let path = self.source_path(key, version);
        tokio::fs::write(&path, text).await?;
        tokio::fs::write(Self::digest_path(&path), digest(text)).await
    }

    /// Most recently written copy of `key`, any version
    async fn latest(&self, key: &str) -> Option<(String, String)> {
        let prefix = format!("{}@", sanitize(key));
        let mut newest: Option<(SystemTime, PathBuf)> = None;

        let mut entries = tokio::fs::read_dir(&self.dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(".js") {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }

        let (_, path) = newest?;
        let version = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&prefix))
            .unwrap_or_default()
            .to_string();
        let text = Self::read_verified(&path).await?;
        Some((version, text))
    }

    async fn remove_key(&self, key: &str) {
        let prefix = format!("{}@", sanitize(key));
        self.remove_matching(|name| name.starts_with(&prefix)).await;
    }

    async fn clear(&self) {
        self.remove_matching(|_| true).await;
    }

    async fn remove_matching(&self, keep_out: impl Fn(&str) -> bool) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| keep_out(n) && (n.ends_with(".js") || n.ends_with(".js.sha256")))
                .unwrap_or(false);
            if matches {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to delete cache file {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
