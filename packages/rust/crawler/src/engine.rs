//! Depth-bounded, sequential, depth-first crawl engine.
//!
//! A crawl fetches its start page, then expands the first `link_limit_per_page`
//! in-scope links one after another, each after a politeness delay, until the
//! remaining depth reaches zero. Child results are folded into their parent
//! in link order. The traversal keeps an explicit frame stack instead of
//! recursing, so wide or deep trees never grow the call stack.
//!
//! Visited URLs are not tracked: a page linked from several branches is
//! fetched once per branch, and the fetch count is bounded only by
//! `Σ_{i=0}^{depth} link_limit^i`.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use darkscout_shared::{CrawlResult, CrawlSettings, Result};

use crate::delay::{DelayPolicy, JitteredDelay};
use crate::extract::{self, ExtractedPage};
use crate::proxy::ProxyHttpClient;

// ---------------------------------------------------------------------------
// Fetcher seam
// ---------------------------------------------------------------------------

/// Transport used by the engine to retrieve raw page bodies.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Establish the session; idempotent.
    fn connect(&mut self) -> Result<()>;

    /// Advisory check that traffic is routed as intended.
    async fn check_connectivity(&self) -> bool;

    /// Fetch the body at `url`. Any failure is an error.
    async fn fetch(&self, url: &str) -> Result<String>;

    /// Release the session; safe to call repeatedly.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// CrawlEngine
// ---------------------------------------------------------------------------

/// One page on the traversal stack, waiting for its children to finish.
struct Frame {
    /// Remaining depth at this page.
    depth: u32,
    /// Children still to expand, in link order.
    pending: VecDeque<String>,
    /// This page's result; children are absorbed as they complete.
    result: CrawlResult,
}

/// Sequential crawler over a [`PageFetcher`].
pub struct CrawlEngine<F: PageFetcher = ProxyHttpClient> {
    fetcher: F,
    settings: CrawlSettings,
    delay: Box<dyn DelayPolicy>,
}

impl CrawlEngine<ProxyHttpClient> {
    /// Engine over a proxied HTTP client with jittered delays.
    pub fn with_proxy(client: ProxyHttpClient, settings: CrawlSettings) -> Self {
        Self::new(client, settings)
    }
}

impl<F: PageFetcher> CrawlEngine<F> {
    pub fn new(fetcher: F, settings: CrawlSettings) -> Self {
        Self {
            fetcher,
            settings,
            delay: Box::new(JitteredDelay::new()),
        }
    }

    /// Replace the delay policy (e.g. [`NoDelay`](crate::NoDelay) in tests).
    pub fn with_delay_policy(mut self, policy: impl DelayPolicy + 'static) -> Self {
        self.delay = Box::new(policy);
        self
    }

    pub fn settings(&self) -> &CrawlSettings {
        &self.settings
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Start the session on first use and log the advisory connectivity check.
    async fn ensure_session(&mut self) -> Result<()> {
        if self.fetcher.is_connected() {
            return Ok(());
        }

        info!("starting proxy session");
        self.fetcher.connect()?;

        if self.fetcher.check_connectivity().await {
            info!("proxy connection verified");
        } else {
            warn!("proxy connectivity check failed, crawling may not work as expected");
        }
        Ok(())
    }

    /// Crawl `url`, expanding links down to `depth` further hops.
    ///
    /// Never fails: fetch and parse errors become entries in
    /// [`CrawlResult::errors`] of the page they occurred on.
    #[instrument(skip_all, fields(url = %url, depth = depth))]
    pub async fn crawl(&mut self, url: &str, depth: u32) -> CrawlResult {
        if let Err(e) = self.ensure_session().await {
            warn!(error = %e, "could not start proxy session");
            return CrawlResult::failed(url, e);
        }

        let mut fetches: usize = 1;
        let mut stack = vec![self.visit(url, depth).await];
        let mut root = CrawlResult::new(url);

        while let Some(frame) = stack.last_mut() {
            match frame.pending.pop_front() {
                Some(child_url) => {
                    let child_depth = frame.depth - 1;
                    self.pause(&child_url).await;
                    stack.push(self.visit(&child_url, child_depth).await);
                    fetches += 1;
                }
                None => {
                    let Some(done) = stack.pop() else { break };
                    match stack.last_mut() {
                        Some(parent) => parent.result.absorb(done.result),
                        None => root = done.result,
                    }
                }
            }
        }

        info!(
            fetches,
            links = root.links.len(),
            errors = root.errors.len(),
            content_len = root.content.len(),
            "crawl completed"
        );

        root
    }

    /// Release the underlying session.
    pub fn close(&mut self) {
        info!("closing proxy session");
        self.fetcher.close();
    }

    /// Fetch and extract one page, turning any failure into an error entry.
    async fn visit(&self, url: &str, depth: u32) -> Frame {
        info!(%url, depth, "crawling");

        match self.fetch_page(url).await {
            Ok(page) => {
                let pending = if depth > 0 {
                    page.links
                        .iter()
                        .take(self.settings.link_limit_per_page)
                        .cloned()
                        .collect()
                } else {
                    VecDeque::new()
                };

                Frame {
                    depth,
                    pending,
                    result: CrawlResult {
                        url: url.to_string(),
                        content: page.text,
                        links: page.links,
                        errors: Vec::new(),
                    },
                }
            }
            Err(e) => {
                let result = CrawlResult::failed(url, &e);
                warn!(%url, error = %e, "crawl failed");
                Frame {
                    depth,
                    pending: VecDeque::new(),
                    result,
                }
            }
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<ExtractedPage> {
        let body = self.fetcher.fetch(url).await?;
        extract::parse_page(&body, &self.settings.onion_marker)
    }

    async fn pause(&self, next_url: &str) {
        let delay = self
            .delay
            .next_delay(self.settings.delay_min, self.settings.delay_max);
        if !delay.is_zero() {
            debug!(next = %next_url, delay_ms = delay.as_millis() as u64, "delaying before next fetch");
            tokio::time::sleep(delay).await;
        }
    }
}
