//! Proxied fetching, content extraction, and the recursive crawl engine.
//!
//! This crate provides:
//! - [`proxy`]: SOCKS-routed HTTP client with user-agent rotation
//! - [`extract`]: visible text and in-scope link extraction
//! - [`delay`]: politeness delay policies
//! - [`engine`]: depth-bounded, sequential, depth-first crawler

pub mod delay;
pub mod engine;
pub mod extract;
pub mod proxy;

pub use delay::{DelayPolicy, JitteredDelay, NoDelay};
pub use engine::{CrawlEngine, PageFetcher};
pub use extract::{ExtractedPage, parse_page};
pub use proxy::{ProxyHttpClient, USER_AGENTS};
