//! Plugin manifest definitions
//!
//! A manifest is one catalogue entry describing a loadable plugin. Manifests are
//! parsed from the registry document, validated entry by entry, and have their
//! source locators resolved against the registry's own location.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

use super::protocol::MethodContract;
use crate::core::error::{HostError, Result};

/// Factory name assumed for extractor refs that don't declare one
pub const DEFAULT_EXTRACTOR_FACTORY: &str = "createExtractor";

/// Plugin category
///
/// Known categories carry a method contract that is checked when the plugin
/// instance is created, before any method runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginCategory {
    /// Site scraper exposing `search(query, page)`, `fetchInfo(id)` and `fetchSources(id)`
    Provider,
    /// Video-link resolver exposing `extract(url)`
    Extractor,
    /// Anything else; no contract is enforced
    Other(String),
}

impl PluginCategory {
    /// Methods an instance of this category must expose, with their maximum arity
    pub fn required_methods(&self) -> &'static [(&'static str, u32)] {
        match self {
            PluginCategory::Provider => &[("search", 2), ("fetchInfo", 1), ("fetchSources", 1)],
            PluginCategory::Extractor => &[("extract", 1)],
            PluginCategory::Other(_) => &[],
        }
    }
}

impl From<String> for PluginCategory {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "provider" => PluginCategory::Provider,
            "extractor" => PluginCategory::Extractor,
            _ => PluginCategory::Other(value),
        }
    }
}

impl From<PluginCategory> for String {
    fn from(value: PluginCategory) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginCategory::Provider => write!(f, "provider"),
            PluginCategory::Extractor => write!(f, "extractor"),
            PluginCategory::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Nested manifest for an extractor a provider may use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorRef {
    pub name: String,
    pub version: String,
    #[serde(rename = "main")]
    pub entry_source: String,
    pub factory_name: String,
}

impl ExtractorRef {
    /// Key under which this extractor's source is cached
    ///
    /// Providers may reference different extractors under the same name, so the
    /// key also carries a digest of the resolved locator.
    pub fn cache_key(&self) -> String {
        let locator = Sha256::digest(self.entry_source.as_bytes());
        let short: String = locator.iter().take(6).map(|b| format!("{:02x}", b)).collect();
        format!("extractor:{}:{}", self.name, short)
    }
}

/// Validated catalogue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<PluginCategory>,
    /// Resolved locator of the plugin source (URL or path)
    #[serde(rename = "main")]
    pub entry_source: String,
    pub factory_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub extractors: Vec<ExtractorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl Manifest {
    /// Methods the plugin instance must expose, per its category
    pub fn required_methods(&self) -> Vec<MethodContract> {
        self.category
            .as_ref()
            .map(|c| {
                c.required_methods()
                    .iter()
                    .map(|(name, arity)| MethodContract::new(*name, *arity))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A disabled entry stays in the catalogue but cannot be called
    pub fn is_disabled(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("disabled"))
            .unwrap_or(false)
    }
}

/// Entry as it appears in the registry document, before validation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    id: Option<String>,
    name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    version: Option<String>,
    category: Option<String>,
    main: Option<String>,
    factory_name: Option<String>,
    base_url: Option<String>,
    #[serde(default)]
    extractors: Vec<RawExtractorRef>,
    status: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExtractorRef {
    name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    version: Option<String>,
    main: Option<String>,
    factory_name: Option<String>,
}

/// Accept `"1.2.0"` as well as `3` or `1700000000` for version-like fields
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn required(field: Option<String>, name: &str) -> std::result::Result<String, String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(format!("missing required field '{}'", name)),
    }
}

/// Resolves templated and relative locators against the registry location
#[derive(Debug, Clone)]
pub struct LocatorResolver {
    base: LocatorBase,
    branch: Option<String>,
}

#[derive(Debug, Clone)]
enum LocatorBase {
    Url(Url),
    Dir(PathBuf),
}

impl LocatorResolver {
    /// Build a resolver for locators found in the registry at `registry_locator`
    ///
    /// The registry locator itself is expected to be expanded already.
    pub fn new(registry_locator: &str, branch: Option<&str>) -> Self {
        let base = match parse_url(registry_locator) {
            Some(url) => LocatorBase::Url(url),
            None => LocatorBase::Dir(
                Path::new(registry_locator)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
            ),
        };

        Self {
            base,
            branch: branch.map(|b| b.to_string()),
        }
    }

    /// Substitute `{branch}` / `${branch}` placeholders
    pub fn expand(raw: &str, branch: Option<&str>) -> String {
        match branch {
            Some(branch) => raw.replace("${branch}", branch).replace("{branch}", branch),
            None => raw.to_string(),
        }
    }

    /// Resolve a locator to an absolute URL or path
    pub fn resolve(&self, raw: &str) -> std::result::Result<String, String> {
        let expanded = Self::expand(raw, self.branch.as_deref());

        if parse_url(&expanded).is_some() || Path::new(&expanded).is_absolute() {
            return Ok(expanded);
        }

        match &self.base {
            LocatorBase::Url(base) => base
                .join(&expanded)
                .map(|u| u.to_string())
                .map_err(|e| format!("cannot resolve '{}' against {}: {}", expanded, base, e)),
            LocatorBase::Dir(dir) => Ok(dir.join(&expanded).to_string_lossy().to_string()),
        }
    }
}

/// Only schemes we can fetch count as URLs; `C:\...` must stay a path
fn parse_url(s: &str) -> Option<Url> {
    Url::parse(s)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https" | "file"))
}

impl RawManifest {
    fn validate(self, resolver: &LocatorResolver) -> std::result::Result<Manifest, String> {
        let id = required(self.id, "id")?;
        let main = required(self.main, "main")?;
        let factory_name = required(self.factory_name, "factoryName")?;
        let entry_source = resolver.resolve(&main)?;

        let extractors = self
            .extractors
            .into_iter()
            .enumerate()
            .map(|(index, raw)| -> std::result::Result<ExtractorRef, String> {
                let name = required(raw.name, "extractors[].name")
                    .map_err(|e| format!("extractor #{}: {}", index, e))?;
                let main = required(raw.main, "extractors[].main")
                    .map_err(|e| format!("extractor '{}': {}", name, e))?;
                Ok(ExtractorRef {
                    entry_source: resolver.resolve(&main)?,
                    version: raw.version.unwrap_or_default(),
                    factory_name: raw
                        .factory_name
                        .filter(|f| !f.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_EXTRACTOR_FACTORY.to_string()),
                    name,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Manifest {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            version: self.version.unwrap_or_default(),
            category: self.category.map(PluginCategory::from),
            entry_source,
            factory_name,
            base_url: self.base_url,
            extractors,
            status: self.status,
            last_updated: self.last_updated,
        })
    }
}

/// Parse a registry document into validated manifests
///
/// The document must be JSON with an `extensions` array. Entries that fail
/// validation are dropped with a warning; duplicates of an already-seen `id`
/// are dropped as well, keeping the first occurrence.
pub fn parse_registry_document(text: &str, resolver: &LocatorResolver) -> Result<Vec<Manifest>> {
    let document: Value = serde_json::from_str(text)
        .map_err(|e| HostError::ManifestError(format!("registry is not valid JSON: {}", e)))?;

    let entries = document
        .get("extensions")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            HostError::ManifestError("registry document has no 'extensions' array".to_string())
        })?;

    let mut seen = HashSet::new();
    let mut manifests = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let validated = serde_json::from_value::<RawManifest>(entry.clone())
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.validate(resolver));

        match validated {
            Ok(manifest) => {
                if !seen.insert(manifest.id.clone()) {
                    warn!(id = %manifest.id, index, "Dropping duplicate registry entry");
                    continue;
                }
                manifests.push(manifest);
            }
            Err(reason) => {
                let id = entry.get("id").and_then(Value::as_str).unwrap_or("<unknown>");
                warn!(id, index, reason = %reason, "Dropping malformed registry entry");
            }
        }
    }

    Ok(manifests)
}
