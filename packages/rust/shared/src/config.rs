//! Application configuration for DocHarvest.
//!
//! User config lives at `~/.docharvest/docharvest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docharvest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docharvest";

// ---------------------------------------------------------------------------
// Config structs (matching docharvest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global crawl defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Code example extraction.
    #[serde(default)]
    pub code_extraction: CodeExtractionConfig,

    /// Embedding service settings.
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Crawl policies.
    #[serde(default)]
    pub crawl_policies: CrawlPoliciesConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default maximum crawl depth (1 = start page only).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Default chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Concurrent fetches inside the batch and recursive strategies.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Attempts per page in the single page strategy.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base backoff between page attempts, doubled per retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Seconds without a progress event before a heartbeat is emitted.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Chunks buffered before a storage flush.
    #[serde(default = "default_storage_batch_size")]
    pub storage_batch_size: usize,

    /// Knowledge type tag used when a request does not set one.
    #[serde(default = "default_knowledge_type")]
    pub knowledge_type: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            storage_batch_size: default_storage_batch_size(),
            knowledge_type: default_knowledge_type(),
        }
    }
}

fn default_max_depth() -> u32 {
    crate::types::DEFAULT_MAX_DEPTH
}
fn default_chunk_size() -> usize {
    crate::types::DEFAULT_CHUNK_SIZE
}
fn default_max_concurrent() -> usize {
    5
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_storage_batch_size() -> usize {
    25
}
fn default_knowledge_type() -> String {
    "technical".into()
}

/// `[code_extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeExtractionConfig {
    /// Whether requests extract code examples unless they opt out.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum code block length in characters.
    #[serde(default = "default_min_block_length")]
    pub min_block_length: usize,

    /// Characters of surrounding prose captured before and after a block.
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,
}

impl Default for CodeExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_block_length: default_min_block_length(),
            context_chars: default_context_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_min_block_length() -> usize {
    250
}
fn default_context_chars() -> usize {
    500
}

/// `[embeddings]` section (any OpenAI-compatible `/embeddings` endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    /// API base URL, without the `/embeddings` suffix.
    #[serde(default = "default_embeddings_base_url")]
    pub base_url: String,

    /// Embedding model name.
    #[serde(default = "default_embeddings_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Texts per embeddings request.
    #[serde(default = "default_embeddings_batch_size")]
    pub batch_size: usize,

    /// Requested vector dimensions, if the model supports shortening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,

    /// Per-request timeout.
    #[serde(default = "default_embeddings_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries on 429 and 5xx responses.
    #[serde(default = "default_embeddings_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: default_embeddings_base_url(),
            model: default_embeddings_model(),
            api_key_env: default_api_key_env(),
            batch_size: default_embeddings_batch_size(),
            dimensions: None,
            timeout_secs: default_embeddings_timeout_secs(),
            max_retries: default_embeddings_max_retries(),
        }
    }
}

fn default_embeddings_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_embeddings_model() -> String {
    "text-embedding-3-small".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_embeddings_batch_size() -> usize {
    64
}
fn default_embeddings_timeout_secs() -> u64 {
    60
}
fn default_embeddings_max_retries() -> u32 {
    3
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file. `~` expands to the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.docharvest/docharvest.db".into()
}

impl StorageConfig {
    /// The database path with a leading `~` expanded.
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        expand_home(&self.database_path)
    }
}

/// `[crawl_policies]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPoliciesConfig {
    /// Allow fetching loopback, private and link-local hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,

    /// Per-request fetch timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CrawlPoliciesConfig {
    fn default() -> Self {
        Self {
            allow_private_hosts: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Crawl settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl settings shared by every job a service runs.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Concurrent fetches in the batch and recursive strategies.
    pub max_concurrent: usize,
    /// Attempts per page in the single page strategy.
    pub retry_count: u32,
    /// Base backoff between attempts.
    pub retry_backoff: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Chunks buffered before a storage flush.
    pub storage_batch_size: usize,
    /// Minimum code block length for code example extraction.
    pub min_code_block_length: usize,
    /// Context characters captured around code blocks.
    pub code_context_chars: usize,
    /// Whether code extraction is enabled at all.
    pub code_extraction_enabled: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CrawlSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent: config.defaults.max_concurrent.max(1),
            retry_count: config.defaults.retry_count.max(1),
            retry_backoff: Duration::from_millis(config.defaults.retry_backoff_ms),
            heartbeat_interval: Duration::from_secs(config.defaults.heartbeat_interval_secs),
            storage_batch_size: config.defaults.storage_batch_size.max(1),
            min_code_block_length: config.code_extraction.min_block_length,
            code_context_chars: config.code_extraction.context_chars,
            code_extraction_enabled: config.code_extraction.enabled,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docharvest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docharvest/docharvest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the embeddings API key from the env var named in config.
pub fn embeddings_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.embeddings.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(HarvestError::config(format!(
            "embeddings API key not found. Set the {var_name} environment variable."
        ))),
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| HarvestError::config("could not determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("chunk_size"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
        assert!(toml_str.contains("[code_extraction]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.max_depth, 1);
        assert_eq!(parsed.defaults.chunk_size, 5000);
        assert_eq!(parsed.embeddings.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
max_concurrent = 2
heartbeat_interval_secs = 10

[storage]
database_path = "/tmp/harvest.db"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.max_concurrent, 2);
        assert_eq!(config.defaults.retry_count, 3);
        assert_eq!(config.code_extraction.min_block_length, 250);
        assert_eq!(
            config.storage.resolved_database_path().expect("path"),
            PathBuf::from("/tmp/harvest.db")
        );
    }

    #[test]
    fn crawl_settings_from_app_config() {
        let mut app = AppConfig::default();
        app.defaults.max_concurrent = 0;
        let settings = CrawlSettings::from(&app);
        assert_eq!(settings.max_concurrent, 1);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.retry_backoff, Duration::from_millis(500));
        assert_eq!(settings.storage_batch_size, 25);
    }

    #[test]
    fn api_key_lookup_fails_when_unset() {
        let mut config = AppConfig::default();
        config.embeddings.api_key_env = "DH_TEST_NONEXISTENT_KEY_12345".into();
        let result = embeddings_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
