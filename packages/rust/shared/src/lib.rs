//! Shared types, error model, and configuration for darkscout.
//!
//! This crate is the foundation depended on by all other darkscout crates.
//! It provides:
//! - [`DarkscoutError`]: the unified error type
//! - Domain types ([`CrawlResult`], [`KnowledgeItem`], [`RetrievedDocument`], [`RunId`])
//! - Configuration ([`AppConfig`], [`CrawlSettings`], [`ProxySettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlPolicyConfig, CrawlSettings, KnowledgeConfig, LlmConfig, PROXY_ENV_VAR,
    ProxyConfig, ProxySettings, apply_env_overrides, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, validate_api_key, validate_config,
};
pub use error::{DarkscoutError, Result};
pub use types::{
    ChatMessage, CrawlResult, KnowledgeItem, ResearchRun, RetrievedDocument, RunId,
    subpage_delimiter,
};
