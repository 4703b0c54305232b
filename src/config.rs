//! Configuration management for manual_rag
//!
//! Supports loading configuration from TOML files with CLI and environment
//! overrides.

use crate::cache::CacheConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to
    #[serde(default = "default_address")]
    pub address: String,

    /// Origins allowed by CORS
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Maximum accepted request body in bytes (uploads)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Which page encoder backs the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Built-in token hashing, no model needed
    #[default]
    Hash,
    /// External retrieval model service
    Http,
}

/// Page index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Directory holding persisted indexes (also the cache key)
    #[serde(default = "default_index_root")]
    pub root: String,

    /// Name of the index inside `root`
    #[serde(default = "default_index_name")]
    pub name: String,

    /// Device hint passed to the encoder (e.g. "cpu", "cuda", "mps")
    #[serde(default = "default_device")]
    pub device: String,

    /// Where uploads are staged before indexing
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Pages retrieved per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub encoder: EncoderKind,

    /// Base URL of the encoder service (required for `encoder = "http"`)
    #[serde(default)]
    pub encoder_url: Option<String>,

    /// Bearer token for the encoder service
    #[serde(default)]
    pub encoder_api_key: Option<String>,

    /// Embedding size produced by the encoder service
    #[serde(default = "default_encoder_dim")]
    pub encoder_dim: usize,

    /// Encoder request timeout in seconds
    #[serde(default = "default_encoder_timeout_secs")]
    pub encoder_timeout_secs: u64,
}

/// Model cache timing, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Idle time after which a cached index is released
    #[serde(default = "default_cache_timeout_secs")]
    pub timeout_secs: u64,

    /// Time between eviction sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Chat-completion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// API key; OPENAI_API_KEY overrides
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    /// Image detail level sent with page images ("low", "high", "auto")
    #[serde(default = "default_image_detail")]
    pub image_detail: String,

    /// System instruction; the built-in G550 prompt when unset
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Telemetry / OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable OpenTelemetry trace export (default: false)
    /// Can be overridden by env var MANUAL_RAG_TRACING_ENABLED or OTEL_SDK_DISABLED
    #[serde(default)]
    pub enabled: bool,

    /// OTLP exporter endpoint (default: http://localhost:4317)
    /// Can be overridden by env var OTEL_EXPORTER_OTLP_ENDPOINT
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Service name reported to the collector (default: manual_rag)
    /// Can be overridden by env var OTEL_SERVICE_NAME
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_index_root() -> String {
    "./indexes".to_string()
}

fn default_index_name() -> String {
    "manual_index".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_upload_dir() -> String {
    "./temp_files".to_string()
}

fn default_top_k() -> usize {
    3
}

fn default_encoder_dim() -> usize {
    128
}

fn default_encoder_timeout_secs() -> u64 {
    300
}

fn default_cache_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_image_detail() -> String {
    "high".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "manual_rag".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            allowed_origins: default_allowed_origins(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: default_index_root(),
            name: default_index_name(),
            device: default_device(),
            upload_dir: default_upload_dir(),
            top_k: default_top_k(),
            encoder: EncoderKind::default(),
            encoder_url: None,
            encoder_api_key: None,
            encoder_dim: default_encoder_dim(),
            encoder_timeout_secs: default_encoder_timeout_secs(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_cache_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            // A zero interval would make tokio::time::interval panic
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
            image_detail: default_image_detail(),
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    /// OPENAI_API_KEY takes precedence over the file value
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("OPENAI_API_KEY") {
            if !val.is_empty() {
                self.api_key = Some(val);
            }
        }
        self
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
        }
    }
}

impl TelemetryConfig {
    /// Apply environment variable overrides.
    /// Env vars take precedence over TOML config values.
    pub fn with_env_overrides(mut self) -> Self {
        // OTEL_SDK_DISABLED=true → disabled (official OTel convention)
        if let Ok(val) = std::env::var("OTEL_SDK_DISABLED") {
            if val.eq_ignore_ascii_case("true") {
                self.enabled = false;
            }
        }
        if let Ok(val) = std::env::var("MANUAL_RAG_TRACING_ENABLED") {
            self.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Ok(val) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !val.is_empty() {
                self.otlp_endpoint = val;
            }
        }
        if let Ok(val) = std::env::var("OTEL_SERVICE_NAME") {
            if !val.is_empty() {
                self.service_name = val;
            }
        }
        self
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from default locations
    ///
    /// Search order:
    /// 1. MANUAL_RAG_CONFIG environment variable
    /// 2. ./manual_rag.toml (current directory)
    /// 3. ~/.config/manual_rag/config.toml (user config)
    pub fn from_default_locations() -> Result<Option<(Self, PathBuf)>> {
        if let Ok(env_path) = std::env::var("MANUAL_RAG_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }

        let local_path = PathBuf::from("manual_rag.toml");
        if local_path.exists() {
            let config = Self::from_file(&local_path)?;
            return Ok(Some((config, local_path)));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("manual_rag").join("config.toml");
            if user_path.exists() {
                let config = Self::from_file(&user_path)?;
                return Ok(Some((config, user_path)));
            }
        }

        Ok(None)
    }

    /// Check settings that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.index.top_k == 0 {
            anyhow::bail!("index.top_k must be at least 1");
        }
        let name = self.index.name.as_str();
        if matches!(name, "" | "." | "..") || name.contains(|c: char| c == '/' || c == '\\') {
            anyhow::bail!("index.name must be a plain directory name: {:?}", self.index.name);
        }
        if self.index.encoder == EncoderKind::Http && self.index.encoder_url.is_none() {
            anyhow::bail!("index.encoder_url is required when index.encoder = \"http\"");
        }
        if !matches!(self.llm.image_detail.as_str(), "low" | "high" | "auto") {
            anyhow::bail!(
                "llm.image_detail must be \"low\", \"high\" or \"auto\", got {:?}",
                self.llm.image_detail
            );
        }
        Ok(())
    }

    /// Generate a template configuration file
    pub fn generate_template() -> String {
        r#"# manual_rag configuration
# Generated template - customize as needed

[server]
# Address to bind the HTTP server to
address = "0.0.0.0:8000"

# Origins allowed to call the API from a browser
allowed_origins = ["http://localhost:3000"]

# Maximum upload size in bytes (default: 100 MiB)
max_upload_bytes = 104857600

[index]
# Directory holding persisted indexes
root = "./indexes"

# Index name inside the root directory
name = "manual_index"

# Device hint passed to the encoder ("cpu", "cuda", "mps")
device = "cpu"

# Staging directory for uploads
upload_dir = "./temp_files"

# Pages retrieved per question
top_k = 3

# Page encoder: "hash" (built-in) or "http" (external retrieval model service)
encoder = "hash"
# encoder_url = "http://localhost:9000"
# encoder_dim = 128

[cache]
# Release a loaded index after this many idle seconds
timeout_secs = 3600

# Seconds between eviction sweeps
sweep_interval_secs = 300

[llm]
base_url = "https://api.openai.com"
model = "gpt-4o"
# api_key is read from OPENAI_API_KEY when not set here
# Image detail for page images: "low", "high" or "auto"
image_detail = "high"

[telemetry]
# Export traces via OTLP (default: false)
enabled = false
otlp_endpoint = "http://localhost:4317"
service_name = "manual_rag"
"#
        .to_string()
    }

    /// Write template config to the specified path
    pub fn write_template(path: &Path) -> Result<()> {
        let template = Self::generate_template();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        std::fs::write(path, template)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Merge CLI overrides into the configuration
    pub fn with_overrides(mut self, address: Option<String>) -> Self {
        if let Some(addr) = address {
            self.server.address = addr;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.address, "0.0.0.0:8000");
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.index.top_k, 3);
        assert_eq!(config.index.encoder, EncoderKind::Hash);
        assert_eq!(config.llm.model, "gpt-4o");
        assert!(config.validate().is_ok());

        let cache = config.cache.to_cache_config();
        assert_eq!(cache.timeout, Duration::from_secs(3600));
        assert_eq!(cache.sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[index]
root = "/var/lib/manual_rag"
encoder = "http"
encoder_url = "http://encoder:9000"

[cache]
timeout_secs = 60
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.index.root, "/var/lib/manual_rag");
        assert_eq!(config.index.encoder, EncoderKind::Http);
        assert_eq!(config.cache.timeout_secs, 60);
        assert_eq!(config.cache.sweep_interval_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(&Config::generate_template()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.index.name, "manual_index");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.index.encoder = EncoderKind::Http;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.index.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.index.name = "../escape".to_string();
        assert!(config.validate().is_err());

        for name in [".", ".."] {
            let mut config = Config::default();
            config.index.name = name.to_string();
            assert!(config.validate().is_err(), "accepted index name {:?}", name);
        }

        let mut config = Config::default();
        config.llm.image_detail = "ultra".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sweep_interval_clamped() {
        let settings = CacheSettings {
            timeout_secs: 10,
            sweep_interval_secs: 0,
        };
        assert_eq!(settings.to_cache_config().sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_address_override() {
        let config = Config::default().with_overrides(Some("127.0.0.1:9999".to_string()));
        assert_eq!(config.server.address, "127.0.0.1:9999");
    }
}
