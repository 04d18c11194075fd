//! Core domain types shared by the crawler, store, and pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CrawlResult
// ---------------------------------------------------------------------------

/// Delimiter line inserted before each expanded child's content.
pub fn subpage_delimiter(child_url: &str) -> String {
    format!("\n\n--- Subpage: {child_url} ---\n")
}

/// Text and links harvested from one crawl call, including every expanded child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    /// The address this result was crawled from.
    pub url: String,
    /// Page text followed by each child's text under a subpage delimiter.
    pub content: String,
    /// In-scope links, own links first, then each child's links in order.
    pub links: Vec<String>,
    /// Formatted error messages from this page and its descendants.
    pub errors: Vec<String>,
}

impl CrawlResult {
    /// An empty result for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// A failed fetch: empty content and links, one error entry.
    pub fn failed(url: impl Into<String>, error: impl std::fmt::Display) -> Self {
        let url = url.into();
        let message = format!("Error crawling {url}: {error}");
        Self {
            url,
            errors: vec![message],
            ..Default::default()
        }
    }

    /// Fold an expanded child into this result.
    ///
    /// Content is appended under the delimiter tagged with the child's URL;
    /// links and errors are extended, never replaced.
    pub fn absorb(&mut self, child: CrawlResult) {
        self.content.push_str(&subpage_delimiter(&child.url));
        self.content.push_str(&child.content);
        self.links.extend(child.links);
        self.errors.extend(child.errors);
    }
}

// ---------------------------------------------------------------------------
// Knowledge store items
// ---------------------------------------------------------------------------

/// A text item handed to the knowledge store, with its source address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub content: String,
    pub url: String,
}

impl From<&CrawlResult> for KnowledgeItem {
    fn from(result: &CrawlResult) -> Self {
        Self {
            content: result.content.clone(),
            url: result.url.clone(),
        }
    }
}

/// A document returned by a knowledge store lookup, best match first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub url: String,
    pub content: String,
    /// Store-specific relevance score (lower is better for FTS5 bm25).
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

/// A single message in a conversation carried alongside a research request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Research runs
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for research run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A completed research run as recorded in the history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRun {
    pub id: RunId,
    pub query: String,
    pub plan: Vec<String>,
    pub report: String,
    /// Number of crawl results gathered by the crawler stage.
    pub source_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
