//! Manifest registry client
//!
//! Fetches the plugin catalogue, validates it into [`Manifest`]s and keeps the
//! current snapshot. A refresh replaces the snapshot as a whole; readers holding
//! the previous one keep a consistent view until they drop it.

use chrono::{DateTime, Utc};
use semver::Version;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::fetcher::SourceFetcher;
use super::manifest::{parse_registry_document, LocatorResolver, Manifest};
use crate::core::error::{HostError, Result};

/// One fetched and validated copy of the catalogue
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Locator the snapshot was fetched from, after template expansion
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub manifests: Vec<Manifest>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&Manifest> {
        self.manifests.iter().find(|m| m.id == id)
    }
}

/// Stateless client that turns a registry locator into manifests
pub struct RegistryClient {
    fetcher: Arc<dyn SourceFetcher>,
    branch: Option<String>,
}

impl RegistryClient {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, branch: Option<String>) -> Self {
        Self { fetcher, branch }
    }

    /// Fetch and validate the registry at `registry_locator`
    ///
    /// # Errors
    /// Returns `ManifestError` when the registry is unreachable or the document
    /// itself is malformed. Individual bad entries are dropped, not fatal.
    pub async fn fetch(&self, registry_locator: &str) -> Result<RegistrySnapshot> {
        let source = LocatorResolver::expand(registry_locator, self.branch.as_deref());

        let text = self.fetcher.fetch_text(&source).await.map_err(|e| {
            HostError::ManifestError(format!("registry unreachable at {}: {}", source, e))
        })?;

        let resolver = LocatorResolver::new(&source, self.branch.as_deref());
        let manifests = parse_registry_document(&text, &resolver)?;

        info!(source = %source, count = manifests.len(), "Registry fetched");

        Ok(RegistrySnapshot {
            source,
            fetched_at: Utc::now(),
            manifests,
        })
    }
}

/// Registry holding the current catalogue snapshot
pub struct ManifestRegistry {
    client: RegistryClient,
    locator: String,
    current: RwLock<Option<Arc<RegistrySnapshot>>>,
}

impl ManifestRegistry {
    pub fn new(client: RegistryClient, locator: impl Into<String>) -> Self {
        Self {
            client,
            locator: locator.into(),
            current: RwLock::new(None),
        }
    }

    /// Fetch the catalogue and replace the current snapshot
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<RegistrySnapshot>> {
        let next = Arc::new(self.client.fetch(&self.locator).await?);

        let mut current = self.current.write().await;
        if let Some(previous) = current.as_ref() {
            log_version_changes(previous, &next);
        }
        *current = Some(next.clone());

        Ok(next)
    }

    /// Current snapshot, if one was fetched
    pub async fn snapshot(&self) -> Option<Arc<RegistrySnapshot>> {
        self.current.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Manifest> {
        self.current
            .read()
            .await
            .as_ref()
            .and_then(|s| s.get(id).cloned())
    }

    pub async fn list(&self) -> Vec<Manifest> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| s.manifests.clone())
            .unwrap_or_default()
    }
}

/// Versions only move forward per id; a step back is accepted but reported
fn log_version_changes(previous: &RegistrySnapshot, next: &RegistrySnapshot) {
    let old: HashMap<&str, &str> = previous
        .manifests
        .iter()
        .map(|m| (m.id.as_str(), m.version.as_str()))
        .collect();

    for manifest in &next.manifests {
        let Some(old_version) = old.get(manifest.id.as_str()) else {
            info!(id = %manifest.id, version = %manifest.version, "New plugin in registry");
            continue;
        };

        if *old_version == manifest.version {
            continue;
        }

        match (Version::parse(old_version), Version::parse(&manifest.version)) {
            (Ok(old), Ok(new)) if new < old => warn!(
                id = %manifest.id,
                from = %old,
                to = %new,
                "Registry downgraded plugin version"
            ),
            _ => info!(
                id = %manifest.id,
                from = %old_version,
                to = %manifest.version,
                "Plugin version changed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::MemoryFetcher;
    use serde_json::json;

    const REGISTRY: &str = "https://registry.example/{branch}/index.json";

    fn document(version: &str) -> String {
        json!({
            "extensions": [
                {"id": "demo", "version": version, "main": "demo.js", "factoryName": "createDemo"},
                {"id": "broken", "main": "broken.js"}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_fetch_expands_branch_and_resolves_relative_main() {
        let fetcher = Arc::new(
            MemoryFetcher::new().with("https://registry.example/stable/index.json", &document("1.0.0")),
        );
        let client = RegistryClient::new(fetcher, Some("stable".to_string()));

        let snapshot = client.fetch(REGISTRY).await.unwrap();
        assert_eq!(snapshot.source, "https://registry.example/stable/index.json");
        assert_eq!(snapshot.manifests.len(), 1);
        assert_eq!(
            snapshot.get("demo").unwrap().entry_source,
            "https://registry.example/stable/demo.js"
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_manifest_error() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let client = RegistryClient::new(fetcher, None);

        let err = client.fetch("https://registry.example/index.json").await.unwrap_err();
        assert!(matches!(err, HostError::ManifestError(_)));
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let fetcher = Arc::new(
            MemoryFetcher::new().with("https://registry.example/main/index.json", &document("1.0.0")),
        );
        let registry = ManifestRegistry::new(
            RegistryClient::new(fetcher.clone(), Some("main".to_string())),
            REGISTRY,
        );

        assert!(registry.get("demo").await.is_none());

        registry.refresh().await.unwrap();
        let first = registry.snapshot().await.unwrap();
        assert_eq!(registry.get("demo").await.unwrap().version, "1.0.0");

        fetcher.put("https://registry.example/main/index.json", &document("1.1.0"));
        registry.refresh().await.unwrap();
        assert_eq!(registry.get("demo").await.unwrap().version, "1.1.0");

        // Holders of the old snapshot keep their view
        assert_eq!(first.get("demo").unwrap().version, "1.0.0");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let fetcher = Arc::new(
            MemoryFetcher::new().with("https://registry.example/main/index.json", &document("1.0.0")),
        );
        let registry = ManifestRegistry::new(
            RegistryClient::new(fetcher.clone(), Some("main".to_string())),
            REGISTRY,
        );
        registry.refresh().await.unwrap();

        fetcher.set_offline(true);
        assert!(registry.refresh().await.is_err());
        assert_eq!(registry.list().await.len(), 1);
    }
}
