//! Capability context
//!
//! The capability context is the complete surface a plugin can reach. The host
//! describes it per call with [`CapabilityContext`]; the sandbox turns that
//! description into a frozen `ctx` object whose functions are closures over
//! host ops. Nothing outside that object is reachable from plugin code.
//!
//! [`HostServices`] holds the host-owned resources those ops use: the HTTP
//! client every plugin request goes through, the network policy, and the
//! session store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

use super::fetcher::MAX_BODY_BYTES;
use crate::core::error::{HostError, Result};

/// Which optional capabilities a call receives
///
/// The logger, user agent, config and URL helper are always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// `ctx.http` and `ctx.fetch`
    pub network: bool,
    /// `ctx.parseHtml`
    pub html: bool,
    /// `ctx.session`, state shared across calls of the same plugin
    pub session: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            network: true,
            html: true,
            session: true,
        }
    }

    pub fn none() -> Self {
        Self {
            network: false,
            html: false,
            session: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Already-resolved plugin a provider may reach through `ctx.extractors`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedPlugin {
    pub name: String,
    pub version: String,
    pub factory_name: String,
    pub source_text: String,
}

/// Per-call description of the capabilities handed to a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityContext {
    /// Id used for log attribution and session scoping
    pub plugin_id: String,
    pub user_agent: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub grants: Capabilities,
    /// Lookup table exposed as `ctx.extractors`
    #[serde(default)]
    pub extractors: Vec<NestedPlugin>,
}

impl CapabilityContext {
    pub fn new(plugin_id: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            user_agent: user_agent.into(),
            base_url: None,
            config: Value::Object(serde_json::Map::new()),
            grants: Capabilities::default(),
            extractors: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_grants(mut self, grants: Capabilities) -> Self {
        self.grants = grants;
        self
    }

    pub fn with_extractor(mut self, extractor: NestedPlugin) -> Self {
        self.extractors.push(extractor);
        self
    }
}

/// Domain allowlist for plugin network traffic
///
/// An empty list allows every host. Patterns are exact hosts or `*.domain`
/// wildcards, which also match the bare domain.
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    allowed_domains: Vec<String>,
}

impl NetworkPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self {
            allowed_domains: allowed_domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    /// Check if network access to `url` is allowed
    pub fn check(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url)
            .map_err(|e| HostError::PermissionDenied(format!("Invalid URL {}: {}", url, e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HostError::PermissionDenied(format!(
                "Network access denied: unsupported scheme in {}",
                url
            )));
        }

        if self.allowed_domains.is_empty() {
            return Ok(());
        }

        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
        if self
            .allowed_domains
            .iter()
            .any(|pattern| Self::domain_matches(&host, pattern))
        {
            Ok(())
        } else {
            Err(HostError::PermissionDenied(format!("Network access denied: {}", url)))
        }
    }

    fn domain_matches(domain: &str, pattern: &str) -> bool {
        match pattern.strip_prefix("*.") {
            Some(base) => domain == base || domain.ends_with(&format!(".{}", base)),
            None => domain == pattern,
        }
    }
}

/// Host-owned key/value state per plugin id, kept for the process lifetime
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, HashMap<String, Value>>>>,
}

impl SessionStore {
    pub fn get(&self, plugin_id: &str, key: &str) -> Option<Value> {
        let sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(plugin_id).and_then(|s| s.get(key)).cloned()
    }

    pub fn set(&self, plugin_id: &str, key: &str, value: Value) {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(plugin_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn delete(&self, plugin_id: &str, key: &str) -> bool {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get_mut(plugin_id)
            .map(|s| s.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Forget everything stored for one plugin
    pub fn clear(&self, plugin_id: &str) {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(plugin_id);
    }
}

/// Counters over plugin network traffic
#[derive(Debug, Default)]
pub struct TrafficStats {
    requests: AtomicU64,
    denied: AtomicU64,
}

impl TrafficStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}

/// Host resources behind the capability ops
#[derive(Clone)]
pub struct HostServices {
    pub client: reqwest::Client,
    pub policy: NetworkPolicy,
    pub sessions: SessionStore,
    pub traffic: Arc<TrafficStats>,
    /// Cap on each response body handed to a plugin
    pub max_body_bytes: usize,
}

impl HostServices {
    pub fn new(
        user_agent: &str,
        http_timeout: Duration,
        policy: NetworkPolicy,
        sessions: SessionStore,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(http_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HostError::InitializationError(format!("Failed to build plugin HTTP client: {}", e)))?;

        Ok(Self {
            client,
            policy,
            sessions,
            traffic: Arc::new(TrafficStats::default()),
            max_body_bytes: MAX_BODY_BYTES,
        })
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}
