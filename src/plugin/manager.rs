//! Plugin manager
//!
//! Facade over the registry, the source loader and the bridge. A call looks up
//! the manifest, loads the plugin source plus the sources of the extractors it
//! references, builds the capability context and dispatches the method to the
//! execution runtime.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::bridge::{BridgeClient, CallOptions};
use super::capability::{CapabilityContext, HostServices, NestedPlugin, NetworkPolicy, SessionStore};
use super::fetcher::{HttpFetcher, SourceFetcher};
use super::loader::SourceLoader;
use super::manifest::Manifest;
use super::protocol::ExecutePayload;
use super::registry::{ManifestRegistry, RegistryClient};
use crate::core::config::Config;
use crate::core::error::{HostError, Result};

/// Settings applied to every call
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub user_agent: String,
    /// Deadline used when the caller does not pass one
    pub call_timeout: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("extension-host/{}", env!("CARGO_PKG_VERSION")),
            call_timeout: Some(Duration::from_secs(120)),
        }
    }
}

pub struct PluginManager {
    registry: ManifestRegistry,
    loader: SourceLoader,
    bridge: BridgeClient,
    sessions: SessionStore,
    plugin_configs: RwLock<HashMap<String, Value>>,
    options: ManagerOptions,
}

impl PluginManager {
    /// Wire a manager and start its execution runtime
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: ManifestRegistry,
        loader: SourceLoader,
        services: HostServices,
        options: ManagerOptions,
    ) -> Result<Self> {
        let sessions = services.sessions.clone();
        let bridge = BridgeClient::spawn(services)?;

        Ok(Self {
            registry,
            loader,
            bridge,
            sessions,
            plugin_configs: RwLock::new(HashMap::new()),
            options,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher: Arc<dyn SourceFetcher> = Arc::new(HttpFetcher::new(
            &config.sandbox.user_agent,
            config.loader.fetch_timeout(),
        )?);

        let registry = ManifestRegistry::new(
            RegistryClient::new(fetcher.clone(), config.registry.branch.clone()),
            config.registry.url.clone(),
        );

        let loader = match &config.loader.cache_dir {
            Some(dir) => SourceLoader::with_disk_cache(fetcher, dir.clone())?,
            None => SourceLoader::new(fetcher),
        };

        let services = HostServices::new(
            &config.sandbox.user_agent,
            config.sandbox.http_timeout(),
            NetworkPolicy::new(config.sandbox.allowed_domains.clone()),
            SessionStore::default(),
        )?;

        let options = ManagerOptions {
            user_agent: config.sandbox.user_agent.clone(),
            call_timeout: config.sandbox.call_timeout(),
        };

        info!(registry = %config.registry.url, "Plugin manager configured");
        Self::new(registry, loader, services, options)
    }

    /// Re-fetch the catalogue; returns the number of manifests
    pub async fn refresh_registry(&self) -> Result<usize> {
        Ok(self.registry.refresh().await?.manifests.len())
    }

    /// Every manifest in the catalogue, fetching it on first use
    pub async fn list_plugins(&self) -> Result<Vec<Manifest>> {
        self.ensure_registry().await?;
        Ok(self.registry.list().await)
    }

    /// Config object handed to the plugin as `ctx.config`
    pub async fn set_plugin_config(&self, id: &str, config: Value) {
        self.plugin_configs.write().await.insert(id.to_string(), config);
    }

    pub fn clear_session(&self, id: &str) {
        self.sessions.clear(id);
        debug!(plugin = %id, "Session cleared");
    }

    pub async fn wait_ready(&self) -> Result<()> {
        self.bridge.wait_ready().await
    }

    /// Round-trip latency to the execution runtime
    pub async fn ping(&self) -> Result<Duration> {
        self.bridge.ping(self.default_options()).await
    }

    pub async fn call(&self, id: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with(id, method, args, self.default_options()).await
    }

    pub async fn call_with(
        &self,
        id: &str,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        let manifest = self.manifest(id).await?;
        let source_text = self.loader.get_source(&manifest).await?;

        let config = self
            .plugin_configs
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(|| json!({}));

        let mut context = CapabilityContext::new(&manifest.id, &self.options.user_agent)
            .with_base_url(manifest.base_url.clone())
            .with_config(config);
        for extractor in self.resolve_extractors(&manifest).await {
            context = context.with_extractor(extractor);
        }

        let payload = ExecutePayload {
            source_text,
            factory_name: manifest.factory_name.clone(),
            method_name: method.to_string(),
            args,
            context,
            required_methods: manifest.required_methods(),
        };

        let started = Instant::now();
        let result = self.bridge.execute(payload, options).await;
        match &result {
            Ok(_) => debug!(
                plugin = %id,
                method,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Plugin call completed"
            ),
            Err(e) => warn!(plugin = %id, method, kind = e.error_type(), error = %e, "Plugin call failed"),
        }
        result
    }

    pub async fn search(&self, id: &str, query: &str, page: Option<u32>) -> Result<Value> {
        let mut args = vec![json!(query)];
        if let Some(page) = page {
            args.push(json!(page));
        }
        self.call(id, "search", args).await
    }

    pub async fn fetch_info(&self, id: &str, item: &str) -> Result<Value> {
        self.call(id, "fetchInfo", vec![json!(item)]).await
    }

    pub async fn fetch_sources(&self, id: &str, item: &str) -> Result<Value> {
        self.call(id, "fetchSources", vec![json!(item)]).await
    }

    pub async fn extract(&self, id: &str, url: &str) -> Result<Value> {
        self.call(id, "extract", vec![json!(url)]).await
    }

    fn default_options(&self) -> CallOptions {
        CallOptions {
            timeout: self.options.call_timeout,
            cancel: None,
        }
    }

    async fn ensure_registry(&self) -> Result<()> {
        if self.registry.snapshot().await.is_none() {
            self.registry.refresh().await?;
        }
        Ok(())
    }

    async fn manifest(&self, id: &str) -> Result<Manifest> {
        self.ensure_registry().await?;

        let manifest = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| HostError::PluginNotFound(id.to_string()))?;

        if manifest.is_disabled() {
            return Err(HostError::PluginNotFound(format!("{} (disabled)", id)));
        }

        Ok(manifest)
    }

    /// Sources of the extractors a manifest references; unresolvable ones are skipped
    async fn resolve_extractors(&self, manifest: &Manifest) -> Vec<NestedPlugin> {
        let mut nested = Vec::with_capacity(manifest.extractors.len());

        for extractor in &manifest.extractors {
            match self.loader.get_extractor_source(extractor).await {
                Ok(source_text) => nested.push(NestedPlugin {
                    name: extractor.name.clone(),
                    version: extractor.version.clone(),
                    factory_name: extractor.factory_name.clone(),
                    source_text,
                }),
                Err(e) => warn!(
                    plugin = %manifest.id,
                    extractor = %extractor.name,
                    error = %e,
                    "Skipping unresolvable extractor"
                ),
            }
        }

        nested
    }
}
