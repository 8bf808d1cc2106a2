//! Configuration management

use clap::Args;
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, ConfigError as BuilderError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::error::HostError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid registry configuration: {0}")]
    InvalidRegistry(String),

    #[error("Invalid loader configuration: {0}")]
    InvalidLoader(String),

    #[error("Invalid sandbox configuration: {0}")]
    InvalidSandbox(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<ConfigError> for HostError {
    fn from(err: ConfigError) -> Self {
        HostError::ConfigError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub registry: RegistryConfig,
    pub loader: LoaderConfig,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

/// Command-line overrides shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Registry locator (URL or path); `{branch}` is substituted
    #[arg(short, long, global = true, value_name = "LOCATOR")]
    pub registry: Option<String>,

    /// Registry branch
    #[arg(short, long, global = true, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(args: &ConfigArgs) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        if let Some(config_path) = &args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Environment variables are prefixed with EXTHOST_ and use __ for nesting
        // Example: EXTHOST_SANDBOX__CALL_TIMEOUT=60
        builder = builder.add_source(
            Environment::with_prefix("EXTHOST")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sandbox.allowed_domains")
                .try_parsing(true),
        );

        if let Some(registry) = &args.registry {
            builder = builder.set_override("registry.url", registry.clone())?;
        }
        if let Some(branch) = &args.branch {
            builder = builder.set_override("registry.branch", branch.clone())?;
        }
        if let Some(log_level) = &args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path, on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = Self::defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Result<Builder<DefaultState>, ConfigError> {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("extension-host");

        Ok(ConfigBuilder::builder()
            .set_default("registry.url", "./registry.json")?
            .set_default("registry.branch", "main")?
            .set_default("loader.cache_dir", cache_dir.display().to_string())?
            .set_default("loader.fetch_timeout", 30)?
            .set_default("sandbox.user_agent", default_user_agent())?
            .set_default("sandbox.http_timeout", 30)?
            .set_default("sandbox.call_timeout", 120)?
            .set_default("sandbox.allowed_domains", Vec::<String>::new())?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stdout")?
            .set_default("logging.max_file_size", 10485760)? // 10 MB
            .set_default("logging.max_backups", 5)?)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()?;
        self.loader.validate()?;
        self.sandbox.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

fn default_user_agent() -> String {
    format!("extension-host/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub url: String,
    pub branch: Option<String>,
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::InvalidRegistry("url cannot be empty".to_string()));
        }

        if matches!(&self.branch, Some(branch) if branch.trim().is_empty()) {
            return Err(ConfigError::InvalidRegistry("branch cannot be blank".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    /// Directory for the on-disk source cache; unset keeps sources in memory only
    pub cache_dir: Option<PathBuf>,
    pub fetch_timeout: u64, // seconds
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(&self.cache_dir, Some(dir) if dir.as_os_str().is_empty()) {
            return Err(ConfigError::InvalidLoader("cache_dir cannot be empty".to_string()));
        }

        if self.fetch_timeout == 0 {
            return Err(ConfigError::InvalidLoader("fetch_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    pub user_agent: String,
    pub http_timeout: u64, // seconds
    /// Default deadline per plugin call; 0 disables it
    pub call_timeout: u64, // seconds
    /// Hosts plugins may reach; empty allows all
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::InvalidSandbox("user_agent cannot be empty".to_string()));
        }

        if self.http_timeout == 0 {
            return Err(ConfigError::InvalidSandbox("http_timeout must be greater than 0".to_string()));
        }

        if let Some(bad) = self
            .allowed_domains
            .iter()
            .find(|d| d.is_empty() || d.contains('/') || d.contains(':'))
        {
            return Err(ConfigError::InvalidSandbox(format!(
                "allowed_domains entry '{}' must be a bare host or *.domain pattern",
                bad
            )));
        }

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout > 0).then(|| Duration::from_secs(self.call_timeout))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub max_file_size: usize, // bytes
    pub max_backups: usize,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        if self.max_file_size == 0 {
            return Err(ConfigError::InvalidLogging("max_file_size must be greater than 0".to_string()));
        }

        if self.max_backups == 0 {
            return Err(ConfigError::InvalidLogging("max_backups must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::load(&ConfigArgs::default()).unwrap();
        assert_eq!(config.registry.branch.as_deref(), Some("main"));
        assert_eq!(config.sandbox.call_timeout(), Some(Duration::from_secs(120)));
        assert!(config.sandbox.user_agent.starts_with("extension-host/"));
        assert!(config.loader.cache_dir.is_some());
    }

    #[test]
    fn test_cli_overrides_win() {
        let args = ConfigArgs {
            registry: Some("https://registry.example/{branch}/index.json".to_string()),
            branch: Some("beta".to_string()),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = Config::load(&args).unwrap();
        assert_eq!(config.registry.url, "https://registry.example/{branch}/index.json");
        assert_eq!(config.registry.branch.as_deref(), Some("beta"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_file_layers_on_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[sandbox]
call_timeout = 0
allowed_domains = ["*.example.com"]

[logging]
format = "json"
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sandbox.call_timeout(), None);
        assert_eq!(config.sandbox.allowed_domains, vec!["*.example.com".to_string()]);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.loader.fetch_timeout, 30);
    }

    #[test]
    fn test_missing_file() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/definitely/not/here.toml")),
            ..Default::default()
        };
        assert!(matches!(Config::load(&args), Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let sandbox = SandboxConfig {
            user_agent: "ua".to_string(),
            http_timeout: 30,
            call_timeout: 0,
            allowed_domains: vec!["https://example.com".to_string()],
        };
        assert!(sandbox.validate().is_err());

        let logging = LoggingConfig {
            level: "loud".to_string(),
            format: "text".to_string(),
            output: "stdout".to_string(),
            log_file: None,
            max_file_size: 1,
            max_backups: 1,
        };
        assert!(logging.validate().is_err());

        let registry = RegistryConfig {
            url: " ".to_string(),
            branch: None,
        };
        assert!(registry.validate().is_err());
    }
}
