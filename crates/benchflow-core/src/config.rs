/*!
 * Configuration management for BenchFlow.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * environment variables (`BENCHFLOW__SECTION__KEY`).
 */
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable prefix used by [`ConfigBuilder::from_env`]
pub const ENV_PREFIX: &str = "BENCHFLOW";

/// Core configuration for BenchFlow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Identity probe configuration
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Driver registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Driver scanner configuration
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Resolver configuration
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to colour terminal output
    #[serde(default = "default_true")]
    pub ansi: bool,
}

/// Identity probe configuration
///
/// The top-level fields are the defaults. Entries in `profiles` are keyed by
/// connector name (`gpib`, `serial`, `sim` ...) and override any field they set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Identification commands, tried in order
    #[serde(default = "default_identity_commands")]
    pub identity_commands: Vec<String>,

    /// Generic status query sent when every identification command failed
    #[serde(default = "default_status_query")]
    pub status_query: String,

    /// Phrases that make a status reply acceptable as an identity
    #[serde(default = "default_status_phrases")]
    pub status_phrases: Vec<String>,

    /// Replies treated as "no answer". An empty entry matches an empty
    /// reply; a numeric entry matches any reply that parses to that number.
    #[serde(default = "default_degenerate_responses")]
    pub degenerate_responses: Vec<String>,

    /// Timeout for a single probe step in milliseconds
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Per-transport overrides
    #[serde(default)]
    pub profiles: BTreeMap<String, ProbeProfileConfig>,
}

/// Partial probe settings for one transport kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeProfileConfig {
    /// Identification commands override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_commands: Option<Vec<String>>,

    /// Status query override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_query: Option<String>,

    /// Status phrases override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_phrases: Option<Vec<String>>,

    /// Degenerate responses override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degenerate_responses: Option<Vec<String>>,

    /// Step timeout override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
}

/// Driver registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Path of the persisted registry; defaults to `<data_dir>/registry_cache.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<String>,
}

/// Driver scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Path components that exclude a driver source from scanning
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<String>,

    /// Directories searched for TOML driver manifests
    #[serde(default)]
    pub manifest_dirs: Vec<String>,
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Allow falling back to the generic driver when nothing specific matches
    #[serde(default = "default_true")]
    pub generic_fallback: bool,

    /// Complete partial addresses against enumerated resources
    #[serde(default = "default_true")]
    pub expand_partial_addresses: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: true,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            identity_commands: default_identity_commands(),
            status_query: default_status_query(),
            status_phrases: default_status_phrases(),
            degenerate_responses: default_degenerate_responses(),
            step_timeout_ms: default_step_timeout_ms(),
            profiles: BTreeMap::new(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            exclusions: default_exclusions(),
            manifest_dirs: Vec::new(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            generic_fallback: true,
            expand_partial_addresses: true,
        }
    }
}

impl ProbeConfig {
    /// Effective settings for a transport profile.
    ///
    /// The returned config has no profiles of its own. Unknown profile
    /// names yield the defaults.
    pub fn for_profile(&self, name: &str) -> ProbeConfig {
        let mut effective = ProbeConfig {
            profiles: BTreeMap::new(),
            ..self.clone()
        };
        let Some(profile) = self.profiles.get(&name.to_lowercase()) else {
            return effective;
        };
        if let Some(commands) = &profile.identity_commands {
            effective.identity_commands = commands.clone();
        }
        if let Some(query) = &profile.status_query {
            effective.status_query = query.clone();
        }
        if let Some(phrases) = &profile.status_phrases {
            effective.status_phrases = phrases.clone();
        }
        if let Some(degenerate) = &profile.degenerate_responses {
            effective.degenerate_responses = degenerate.clone();
        }
        if let Some(timeout) = profile.step_timeout_ms {
            effective.step_timeout_ms = timeout;
        }
        effective
    }
}

impl Config {
    /// Path of the persisted driver registry
    pub fn registry_cache_path(&self) -> PathBuf {
        match &self.registry.cache_file {
            Some(path) => PathBuf::from(path),
            None => Path::new(&self.general.data_dir).join("registry_cache.json"),
        }
    }
}

fn default_app_name() -> String {
    "benchflow".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_identity_commands() -> Vec<String> {
    vec!["*IDN?".to_string(), "ID?".to_string()]
}

fn default_status_query() -> String {
    "U0X".to_string()
}

fn default_status_phrases() -> Vec<String> {
    vec!["NDCV".to_string()]
}

fn default_degenerate_responses() -> Vec<String> {
    vec![String::new(), "0".to_string()]
}

fn default_step_timeout_ms() -> u64 {
    2000
}

fn default_exclusions() -> Vec<String> {
    ["z_old", "old", "outline", "example"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder reading the standard `BENCHFLOW__*` environment variables
    pub fn from_env() -> Self {
        Self::new().with_environment_prefix(ENV_PREFIX)
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!(path = %config_file, "Loading configuration file");
                config_builder = config_builder.add_source(File::from(path));
            } else {
                debug!(path = %config_file, "Configuration file does not exist, using defaults");
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!(prefix = %prefix, "Loading configuration from environment");
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "benchflow");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.probe.identity_commands, vec!["*IDN?", "ID?"]);
        assert_eq!(config.probe.status_query, "U0X");
        assert_eq!(config.probe.step_timeout_ms, 2000);
        assert!(config.resolver.generic_fallback);
        assert!(config.scanner.exclusions.contains(&"z_old".to_string()));
        assert_eq!(
            config.registry_cache_path(),
            Path::new("./data").join("registry_cache.json")
        );
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "benchflow");
        assert_eq!(config.probe.degenerate_responses, vec!["", "0"]);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("bench.toml");
        fs::write(
            &file_path,
            r#"
                [general]
                data_dir = "/var/lib/bench"

                [logging]
                level = "debug"

                [probe]
                step_timeout_ms = 500

                [probe.profiles.serial]
                identity_commands = ["ID?"]
                degenerate_responses = ["", "0", "ERR"]

                [resolver]
                generic_fallback = false
            "#,
        )?;

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.probe.step_timeout_ms, 500);
        assert!(!config.resolver.generic_fallback);
        assert_eq!(
            config.registry_cache_path(),
            Path::new("/var/lib/bench").join("registry_cache.json")
        );

        let serial = config.probe.for_profile("serial");
        assert_eq!(serial.identity_commands, vec!["ID?"]);
        assert_eq!(serial.degenerate_responses.len(), 3);
        assert_eq!(serial.step_timeout_ms, 500);
        assert_eq!(serial.status_query, "U0X");

        let gpib = config.probe.for_profile("gpib");
        assert_eq!(gpib.identity_commands, vec!["*IDN?", "ID?"]);
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("BFTEST__GENERAL__APP_NAME", "env-bench");
        env::set_var("BFTEST__PROBE__STEP_TIMEOUT_MS", "250");

        let config = ConfigBuilder::new()
            .with_environment_prefix("BFTEST")
            .build()?;

        assert_eq!(config.general.app_name, "env-bench");
        assert_eq!(config.probe.step_timeout_ms, 250);

        env::remove_var("BFTEST__GENERAL__APP_NAME");
        env::remove_var("BFTEST__PROBE__STEP_TIMEOUT_MS");
        Ok(())
    }

    #[test_log::test]
    fn test_missing_file_uses_defaults() -> Result<()> {
        let config = ConfigBuilder::new()
            .with_config_file("/definitely/not/here.toml")
            .build()?;
        assert_eq!(config.logging.level, "info");
        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "benchflow");
        assert_eq!(shared.as_ref().probe.status_phrases, vec!["NDCV"]);
    }
}
