//! Whole-run orchestration.
//!
//! Phases run in a fixed order: crawl (with its capture join barrier),
//! manual API stores, asset rewriting, page rewriting, run artifacts, replay
//! injection, literal replacements. Each phase fully persists its writes
//! before the next starts; later phases assume earlier registries are final.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::BrowserBackend;
use crate::capture::AssetFetcher;
use crate::capture::api::{AliasTable, alias_manual_store, fetch_manual_stores};
use crate::config::MirrorConfig;
use crate::frontier::{Frontier, Scope};
use crate::output;
use crate::registry::Registries;
use crate::replace::{self, ReplaceStats};
use crate::replay;
use crate::rewrite::{self, RewriteCtx};
use crate::scheduler;
use crate::utils::normalize;

/// Final accounting for a mirror run.
#[derive(Debug, Clone)]
pub struct MirrorSummary {
    pub pages_visited: usize,
    pub pages_processed: usize,
    pub html_saved: usize,
    pub assets_saved: usize,
    pub api_calls: u64,
    pub api_stored: usize,
    pub manual_stored: usize,
    pub alias_keys: usize,
    pub page_errors: usize,
    pub replacements: ReplaceStats,
    pub truncated: bool,
    pub duration: Duration,
}

impl MirrorSummary {
    pub fn log(&self, config: &MirrorConfig) {
        info!("================ mirror summary ================");
        info!("duration: {:.1?}", self.duration);
        info!("pages visited: {}", self.pages_visited);
        info!("pages processed: {}", self.pages_processed);
        if self.truncated {
            warn!(
                "max-pages limit reached ({}); queued pages were not processed. \
                 Increase --max-pages or use --ignore-max.",
                config.max_pages
            );
        }
        info!("HTML files saved: {}", self.html_saved);
        info!("assets saved: {}", self.assets_saved);
        info!(
            "API calls captured: {} ({} unique stored, {} alias keys)",
            self.api_calls, self.api_stored, self.alias_keys
        );
        info!("API responses stored manually: {}", self.manual_stored);
        info!("page errors: {}", self.page_errors);
        info!(
            "replacements: {} rules, {} files scanned, {} changed, {} hits",
            config.replacements.len(),
            self.replacements.files_scanned,
            self.replacements.files_changed,
            self.replacements.total_hits
        );
        info!("================================================");
    }
}

/// Mirror one site. The output directory must already be prepared
/// ([`output::prepare_output_dir`]); the backend stays owned by the caller.
pub async fn run(
    config: MirrorConfig,
    backend: Arc<dyn BrowserBackend>,
) -> Result<MirrorSummary> {
    let started = Instant::now();
    let config = Arc::new(config);

    let registries = Registries::new(&config.output_dir);
    let scope = Scope::new(
        config.allowed_hosts.clone(),
        config.excluded_path_prefixes.clone(),
    );
    let frontier = Arc::new(Mutex::new(Frontier::new(scope)));
    frontier.lock().await.enqueue(&normalize(&config.start_url));

    let fetcher = Arc::new(AssetFetcher::new(
        Arc::clone(&backend),
        config.output_dir.clone(),
        config.allowed_hosts.clone(),
        config.cookie_header.clone(),
        Arc::clone(&registries),
    ));

    // Phase 1: crawl. Returns only after the capture join barrier, so the
    // registries are complete below this point.
    let outcome = scheduler::crawl_site(
        Arc::clone(&config),
        Arc::clone(&backend),
        Arc::clone(&frontier),
        Arc::clone(&registries),
        Arc::clone(&fetcher),
    )
    .await?;

    // Phase 2: manual API stores, fetched once outside the crawl loop.
    let manual_stores = fetch_manual_stores(
        &config.store_api_specs,
        backend.as_ref(),
        &config.output_dir,
        config.cookie_header.as_deref(),
    )
    .await;

    // Phases 3-4: rewrite assets, then pages, over the completed registries.
    let ctx = RewriteCtx {
        config: Arc::clone(&config),
        registries: Arc::clone(&registries),
        fetcher: Arc::clone(&fetcher),
    };
    rewrite::rewrite_assets(&ctx).await?;
    let pages = registries.pages.saved_pages().await;
    rewrite::rewrite_pages(&ctx, &pages).await?;

    // Phase 5: run artifacts.
    let seen_urls = frontier.lock().await.seen_urls().to_vec();
    output::write_urls_txt(&config.output_dir, &seen_urls).await?;
    output::write_sitemap(&config.output_dir, &seen_urls).await?;

    // Phase 6: replay injection over the merged alias table.
    let mut table = AliasTable::default();
    for record in registries.api.records() {
        table.insert_record(record);
    }
    for store in &manual_stores {
        alias_manual_store(&mut table, store);
    }
    replay::inject_into_pages(&ctx, &pages, &table, &manual_stores).await?;

    // index.html is copied after injection so the entry point carries the shim.
    output::write_index_html(&config.output_dir, &normalize(&config.start_url)).await?;

    // Phase 7: literal replacements, always last.
    let replacements =
        replace::apply_replacements(&config.output_dir, &config.replacements).await?;

    let summary = MirrorSummary {
        pages_visited: seen_urls.len(),
        pages_processed: outcome.processed,
        html_saved: pages.len(),
        assets_saved: registries.assets.len(),
        api_calls: registries.api.total_calls(),
        api_stored: registries.api.stored_count(),
        manual_stored: manual_stores.len(),
        alias_keys: table.len(),
        page_errors: registries.errors.count(),
        replacements,
        truncated: outcome.truncated,
        duration: started.elapsed(),
    };
    summary.log(&config);
    Ok(summary)
}
