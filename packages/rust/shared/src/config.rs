//! Application configuration for darkscout.
//!
//! User config lives at `~/.darkscout/darkscout.toml`.
//! CLI flags override environment variables, which override the config file,
//! which overrides defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DarkscoutError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "darkscout.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".darkscout";

/// Environment variable overriding `[proxy].address`.
pub const PROXY_ENV_VAR: &str = "TOR_PROXY";

// ---------------------------------------------------------------------------
// Config structs (matching darkscout.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// SOCKS proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Crawl limits and scope.
    #[serde(default)]
    pub crawl: CrawlPolicyConfig,

    /// Language model endpoint.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Knowledge store settings.
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

/// `[proxy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// SOCKS endpoint as `host:port`.
    #[serde(default = "default_proxy_address")]
    pub address: String,

    /// IP-identification endpoint used by the connectivity check.
    #[serde(default = "default_check_url")]
    pub check_url: String,

    /// Per-request timeout for crawl fetches.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for the connectivity check.
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address: default_proxy_address(),
            check_url: default_check_url(),
            request_timeout_secs: default_request_timeout(),
            check_timeout_secs: default_check_timeout(),
        }
    }
}

fn default_proxy_address() -> String {
    "127.0.0.1:9050".into()
}
fn default_check_url() -> String {
    "https://check.torproject.org/api/ip".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_check_timeout() -> u64 {
    10
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPolicyConfig {
    /// Maximum recursion depth below each crawl target.
    #[serde(default = "default_crawl_depth")]
    pub depth: u32,

    /// Links expanded per page.
    #[serde(default = "default_link_limit")]
    pub link_limit_per_page: usize,

    /// Lower bound of the jittered delay before each child fetch.
    #[serde(default = "default_delay_min")]
    pub delay_min_secs: f64,

    /// Upper bound of the jittered delay before each child fetch.
    #[serde(default = "default_delay_max")]
    pub delay_max_secs: f64,

    /// Substring a link must contain to be in scope.
    #[serde(default = "default_onion_marker")]
    pub onion_marker: String,

    /// Target crawled for plan steps that name no address of their own.
    #[serde(default = "default_seed_url")]
    pub seed_url: String,
}

impl Default for CrawlPolicyConfig {
    fn default() -> Self {
        Self {
            depth: default_crawl_depth(),
            link_limit_per_page: default_link_limit(),
            delay_min_secs: default_delay_min(),
            delay_max_secs: default_delay_max(),
            onion_marker: default_onion_marker(),
            seed_url: default_seed_url(),
        }
    }
}

fn default_crawl_depth() -> u32 {
    10
}
fn default_link_limit() -> usize {
    5
}
fn default_delay_min() -> f64 {
    2.0
}
fn default_delay_max() -> f64 {
    5.0
}
fn default_onion_marker() -> String {
    ".onion".into()
}
fn default_seed_url() -> String {
    "http://example.onion".into()
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API base (OpenRouter by default).
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// HTTP timeout for a single completion request.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "google/gemini-2.5-pro".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_llm_timeout() -> u64 {
    120
}

/// `[knowledge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Path of the libSQL knowledge database. A leading `~/` expands to home.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Documents retrieved as context for the analyzer stage.
    #[serde(default = "default_retrieve_k")]
    pub retrieve_k: u32,

    /// Per-source character budget for crawled text inside the analysis prompt.
    #[serde(default = "default_max_source_chars")]
    pub max_source_chars: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retrieve_k: default_retrieve_k(),
            max_source_chars: default_max_source_chars(),
        }
    }
}

fn default_db_path() -> String {
    "~/.darkscout/knowledge.db".into()
}
fn default_retrieve_k() -> u32 {
    5
}
fn default_max_source_chars() -> usize {
    12_000
}

// ---------------------------------------------------------------------------
// Runtime settings (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime proxy settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// SOCKS endpoint as `host:port`.
    pub address: String,
    pub check_url: String,
    pub request_timeout: Duration,
    pub check_timeout: Duration,
}

impl From<&AppConfig> for ProxySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            address: config.proxy.address.clone(),
            check_url: config.proxy.check_url.clone(),
            request_timeout: Duration::from_secs(config.proxy.request_timeout_secs),
            check_timeout: Duration::from_secs(config.proxy.check_timeout_secs),
        }
    }
}

/// Runtime crawl settings for the crawl engine.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Recursion depth used by the pipeline's crawler stage.
    pub depth: u32,
    pub link_limit_per_page: usize,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub onion_marker: String,
    pub seed_url: String,
}

impl From<&AppConfig> for CrawlSettings {
    fn from(config: &AppConfig) -> Self {
        let secs = |v: f64| Duration::try_from_secs_f64(v).unwrap_or_default();
        Self {
            depth: config.crawl.depth,
            link_limit_per_page: config.crawl.link_limit_per_page,
            delay_min: secs(config.crawl.delay_min_secs),
            delay_max: secs(config.crawl.delay_max_secs),
            onion_marker: config.crawl.onion_marker.clone(),
            seed_url: config.crawl.seed_url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.darkscout/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DarkscoutError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.darkscout/darkscout.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
///
/// Environment overrides are applied and the result is validated.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DarkscoutError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        DarkscoutError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Apply `TOR_PROXY` on top of the file config.
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(address) = std::env::var(PROXY_ENV_VAR) {
        if !address.trim().is_empty() {
            tracing::debug!(%address, "proxy address overridden from environment");
            config.proxy.address = address.trim().to_string();
        }
    }
}

/// Reject settings the crawler cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.proxy.address.trim().is_empty() {
        return Err(DarkscoutError::config("[proxy].address must not be empty"));
    }

    let (min, max) = (config.crawl.delay_min_secs, config.crawl.delay_max_secs);
    if !min.is_finite() || !max.is_finite() || min < 0.0 || max < 0.0 {
        return Err(DarkscoutError::config(
            "[crawl] delay bounds must be finite and non-negative",
        ));
    }
    if min > max {
        return Err(DarkscoutError::config(format!(
            "[crawl].delay_min_secs ({min}) exceeds delay_max_secs ({max})"
        )));
    }

    if config.crawl.onion_marker.is_empty() {
        return Err(DarkscoutError::config("[crawl].onion_marker must not be empty"));
    }

    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DarkscoutError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DarkscoutError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DarkscoutError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the language model API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DarkscoutError::config(format!(
            "language model API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| DarkscoutError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("127.0.0.1:9050"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[crawl]
depth = 2
link_limit_per_page = 3

[proxy]
address = "10.0.0.5:9150"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.crawl.depth, 2);
        assert_eq!(config.crawl.link_limit_per_page, 3);
        assert_eq!(config.crawl.onion_marker, ".onion");
        assert_eq!(config.proxy.address, "10.0.0.5:9150");
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.knowledge.retrieve_k, 5);
    }

    #[test]
    fn crawl_settings_from_app_config() {
        let app = AppConfig::default();
        let crawl = CrawlSettings::from(&app);
        assert_eq!(crawl.depth, 10);
        assert_eq!(crawl.link_limit_per_page, 5);
        assert_eq!(crawl.delay_min, Duration::from_secs(2));
        assert_eq!(crawl.delay_max, Duration::from_secs(5));
        assert_eq!(crawl.seed_url, "http://example.onion");
    }

    #[test]
    fn proxy_settings_from_app_config() {
        let proxy = ProxySettings::from(&AppConfig::default());
        assert_eq!(proxy.address, "127.0.0.1:9050");
        assert_eq!(proxy.request_timeout, Duration::from_secs(30));
        assert_eq!(proxy.check_timeout, Duration::from_secs(10));
    }

    #[test]
    fn inverted_delay_bounds_rejected() {
        let mut config = AppConfig::default();
        config.crawl.delay_min_secs = 6.0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn negative_delay_rejected() {
        let mut config = AppConfig::default();
        config.crawl.delay_min_secs = -1.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.llm.api_key_env = "DARKSCOUT_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(
            expand_home("/var/lib/knowledge.db").unwrap(),
            PathBuf::from("/var/lib/knowledge.db")
        );
    }
}
