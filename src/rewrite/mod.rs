//! Post-crawl link rewriting.
//!
//! Runs strictly after the capture barrier, over already-saved documents, so
//! the registries are complete before any reference is finalized. Each
//! format gets its own extractor/rewriter driven by explicit rule tables;
//! the resolution pipeline (decode entities → resolve against the document
//! base → normalize → registry lookup → query-insensitive fallback) is
//! shared.

pub mod css;
pub mod html;
pub mod js;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::capture::AssetFetcher;
use crate::config::MirrorConfig;
use crate::registry::{Registries, SavedPage};
use crate::utils::relative_from;

/// Shared state for the rewriting phase. Registries are read-only here apart
/// from idempotent first-writes by late active downloads.
pub struct RewriteCtx {
    pub config: Arc<MirrorConfig>,
    pub registries: Arc<Registries>,
    pub fetcher: Arc<AssetFetcher>,
}

impl RewriteCtx {
    /// Resolve an absolute asset URL to a path relative to `document`, using
    /// exact registry lookup with the query-insensitive fallback.
    #[must_use]
    pub fn asset_relative_to(&self, absolute: &str, document: &Path) -> Option<String> {
        let local = self.registries.assets.lookup(absolute)?;
        Some(relative_from(document, &self.config.output_dir.join(local)))
    }

    #[must_use]
    pub fn host_allowed(&self, absolute: &str) -> bool {
        url::Url::parse(absolute)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .is_some_and(|host| self.config.allowed_hosts.iter().any(|h| h == &host))
    }
}

/// Rewrite saved CSS and JS assets in place, downloading any newly
/// discovered embedded references first.
pub async fn rewrite_assets(ctx: &RewriteCtx) -> Result<()> {
    let entries = ctx.registries.assets.entries();
    info!("rewriting {} captured assets", entries.len());
    for (url, local) in entries {
        let path = ctx.config.output_dir.join(&local);
        let result = if local.ends_with(".css") {
            css::process_file(&path, &url, ctx).await
        } else if local.ends_with(".js") {
            js::process_file(&path, &url, ctx).await
        } else {
            continue;
        };
        if let Err(e) = result {
            debug!("failed to rewrite {local}: {e:#}");
        }
    }
    Ok(())
}

/// Rewrite every saved page in place.
pub async fn rewrite_pages(ctx: &RewriteCtx, pages: &[SavedPage]) -> Result<()> {
    info!("rewriting {} saved pages", pages.len());
    for page in pages {
        if let Err(e) = html::process_file(&page.path, &page.url, ctx).await {
            debug!("failed to rewrite {}: {e:#}", page.path.display());
        }
    }
    Ok(())
}
