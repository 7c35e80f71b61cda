//! Static asset capture.
//!
//! Passive capture persists responses observed while a page is open; active
//! capture fetches references discovered later (forced-asset links, CSS/JS
//! embedded URLs) out of band, with a plain-client fallback when the primary
//! cookie-context request fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};
use url::Url;

use crate::backend::{BrowserBackend, NetworkExchange, OutOfBandRequest};
use crate::registry::Registries;
use crate::utils::{BROWSER_USER_AGENT, asset_local_path};

static STATIC_ASSET_CONTENT_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)css|image|font|javascript|octet-stream|svg|webp|woff2?|ttf|eot|ico|audio|video")
        .expect("static asset content-type pattern")
});

/// Whether a content-type belongs to the static-asset class persisted by
/// passive capture.
#[must_use]
pub fn is_static_asset_content_type(content_type: &str) -> bool {
    STATIC_ASSET_CONTENT_TYPE.is_match(content_type)
}

async fn write_asset(out_dir: &Path, local: &str, bytes: &[u8]) -> Result<PathBuf> {
    let out_path = out_dir.join(local);
    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&out_path, bytes)
        .await
        .with_context(|| format!("failed to write {}", out_path.display()))?;
    Ok(out_path)
}

/// Persist a passively observed response when it is a new in-scope static
/// asset. Safe to call for every network exchange; everything else is
/// filtered out.
pub async fn save_passive(
    exchange: &NetworkExchange,
    out_dir: &Path,
    allowed_hosts: &[String],
    registries: &Registries,
) {
    let Some(content_type) = exchange.response.content_type() else {
        return;
    };
    if !is_static_asset_content_type(content_type) {
        return;
    }
    let url = &exchange.request.url;
    let Some(local) = asset_local_path(url, allowed_hosts) else {
        return;
    };
    if !registries.assets.claim(url) {
        return;
    }
    if exchange.body.is_empty() {
        return;
    }
    match write_asset(out_dir, &local, &exchange.body).await {
        Ok(_) => {
            registries.assets.register(url, &local);
            trace!("captured asset {url} -> {local}");
        }
        Err(e) => debug!("failed to persist asset {url}: {e:#}"),
    }
}

/// Active downloader for assets referenced from saved documents.
///
/// The primary path goes through the backend's out-of-band HTTP capability
/// with the configured cookie context; on any failure a bare client retries
/// once. Total failure leaves the reference unrewritten rather than aborting.
pub struct AssetFetcher {
    backend: Arc<dyn BrowserBackend>,
    fallback: reqwest::Client,
    out_dir: PathBuf,
    allowed_hosts: Vec<String>,
    cookie_header: Option<String>,
    registries: Arc<Registries>,
}

impl AssetFetcher {
    #[must_use]
    pub fn new(
        backend: Arc<dyn BrowserBackend>,
        out_dir: PathBuf,
        allowed_hosts: Vec<String>,
        cookie_header: Option<String>,
        registries: Arc<Registries>,
    ) -> Self {
        let fallback = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            backend,
            fallback,
            out_dir,
            allowed_hosts,
            cookie_header,
            registries,
        }
    }

    /// Download `url` into the asset tree and register it. Idempotent: an
    /// already-registered URL short-circuits. Failures are logged, never
    /// propagated.
    pub async fn download(&self, url: &str) {
        if self.registries.assets.contains(url) {
            return;
        }
        let Ok(parsed) = Url::parse(url) else {
            return;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return;
        }
        let Some(local) = asset_local_path(url, &self.allowed_hosts) else {
            return;
        };

        let bytes = match self.fetch_primary(url).await {
            Ok(bytes) => Some(bytes),
            Err(primary_err) => match self.fetch_fallback(url).await {
                Ok(bytes) => Some(bytes),
                Err(fallback_err) => {
                    debug!(
                        "asset download failed for {url}: {primary_err:#}; fallback: {fallback_err:#}"
                    );
                    None
                }
            },
        };
        let Some(bytes) = bytes else { return };

        match write_asset(&self.out_dir, &local, &bytes).await {
            Ok(_) => {
                self.registries.assets.register(url, &local);
                trace!("downloaded asset {url} -> {local}");
            }
            Err(e) => debug!("failed to persist asset {url}: {e:#}"),
        }
    }

    async fn fetch_primary(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = OutOfBandRequest::get(url);
        if let Some(cookie) = &self.cookie_header {
            request.headers.push(("Cookie".to_string(), cookie.clone()));
        }
        let response = self.backend.fetch(request).await?;
        if !response.is_success() {
            anyhow::bail!("primary fetch returned status {}", response.status);
        }
        Ok(response.body)
    }

    async fn fetch_fallback(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .fallback
            .get(url)
            .send()
            .await
            .context("fallback request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("fallback fetch returned status {}", response.status());
        }
        Ok(response.bytes().await.context("fallback body read failed")?.to_vec())
    }
}
