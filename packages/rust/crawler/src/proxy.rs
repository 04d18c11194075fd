//! HTTP client that routes every request through a SOCKS proxy.

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Proxy, Response};
use serde::Deserialize;
use tracing::{debug, info, warn};

use darkscout_shared::{DarkscoutError, ProxySettings, Result};

use crate::engine::PageFetcher;

/// User agents rotated across requests, one picked at random per call.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; rv:115.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0",
];

/// Body of the IP-identification endpoint.
#[derive(Debug, Deserialize)]
struct IpCheck {
    #[serde(rename = "IsTor", default)]
    is_tor: bool,
}

/// Outbound HTTP through a configured SOCKS endpoint.
///
/// The underlying [`Client`] is built lazily by [`connect`](Self::connect) and
/// dropped by [`close`](Self::close).
pub struct ProxyHttpClient {
    settings: ProxySettings,
    client: Option<Client>,
    /// Skip the proxy (for integration tests with mock servers).
    direct: bool,
}

impl ProxyHttpClient {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            client: None,
            direct: false,
        }
    }

    /// Connect directly instead of through the proxy (for integration tests).
    #[cfg(test)]
    pub(crate) fn direct(settings: ProxySettings) -> Self {
        Self {
            settings,
            client: None,
            direct: true,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Build the proxied client. Calling it again while connected is a no-op.
    pub fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.settings.request_timeout);

        if !self.direct {
            let proxy_url = proxy_url(&self.settings.address);
            let proxy = Proxy::all(&proxy_url).map_err(|e| {
                DarkscoutError::config(format!("invalid SOCKS proxy '{proxy_url}': {e}"))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| DarkscoutError::Network(format!("failed to build HTTP client: {e}")))?;

        info!(proxy = %self.settings.address, direct = self.direct, "proxy session started");
        self.client = Some(client);
        Ok(())
    }

    /// Ask the IP-identification endpoint whether traffic is proxy-routed.
    ///
    /// Returns `false` on any failure; never errors.
    pub async fn check_connectivity(&self) -> bool {
        let Some(client) = &self.client else {
            warn!("session not initialized, cannot check proxy connectivity");
            return false;
        };

        let check_url = self.settings.check_url.as_str();
        debug!(%check_url, "checking proxy connectivity");

        let response = match client
            .get(check_url)
            .headers(rotated_headers(HeaderMap::new()))
            .timeout(self.settings.check_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "proxy connectivity check failed");
                return false;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "unexpected response from proxy check");
            return false;
        }

        match response.json::<IpCheck>().await {
            Ok(body) if body.is_tor => true,
            Ok(_) => {
                warn!("proxy reachable but traffic is not routed through it");
                false
            }
            Err(e) => {
                warn!(error = %e, "malformed proxy check response");
                false
            }
        }
    }

    /// Issue a GET with a randomly rotated user agent.
    ///
    /// Timeouts, connection failures, and non-2xx statuses are errors.
    pub async fn get(&self, url: &str, headers: HeaderMap, timeout: Duration) -> Result<Response> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DarkscoutError::Network(format!("{url}: proxy session not connected")))?;

        let response = client
            .get(url)
            .headers(rotated_headers(headers))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| network_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DarkscoutError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response)
    }

    /// Drop the client. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            info!("proxy session closed");
        }
    }
}

#[async_trait]
impl PageFetcher for ProxyHttpClient {
    fn is_connected(&self) -> bool {
        ProxyHttpClient::is_connected(self)
    }

    fn connect(&mut self) -> Result<()> {
        ProxyHttpClient::connect(self)
    }

    async fn check_connectivity(&self) -> bool {
        ProxyHttpClient::check_connectivity(self).await
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .get(url, HeaderMap::new(), self.settings.request_timeout)
            .await?;
        response
            .text()
            .await
            .map_err(|e| DarkscoutError::Network(format!("{url}: body read failed: {e}")))
    }

    fn close(&mut self) {
        ProxyHttpClient::close(self)
    }
}

/// `host:port` becomes `socks5h://host:port` so hidden-service names resolve
/// on the proxy side. Addresses that already carry a scheme are kept.
fn proxy_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("socks5h://{address}")
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

fn rotated_headers(mut headers: HeaderMap) -> HeaderMap {
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    headers
}

fn network_error(url: &str, err: &reqwest::Error) -> DarkscoutError {
    if err.is_timeout() {
        DarkscoutError::Network(format!("{url}: request timed out"))
    } else if err.is_connect() {
        DarkscoutError::Network(format!("{url}: connection failed: {err}"))
    } else {
        DarkscoutError::Network(format!("{url}: {err}"))
    }
}
