//! Crawl scheduling.
//!
//! N workers share one frontier through a serialized dequeue; each worker
//! owns one browser page for its whole lifetime so in-flight request
//! bookkeeping stays per-worker. Capture work triggered by network events
//! runs as tracked side-tasks that are joined before post-processing starts,
//! so the rewriting phase never observes partially written assets.

pub mod quiescence;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::backend::{BrowserBackend, NetworkEvent, PageSession};
use crate::capture::AssetFetcher;
use crate::capture::assets::save_passive;
use crate::config::MirrorConfig;
use crate::frontier::Frontier;
use crate::registry::Registries;
use crate::utils::{has_non_page_extension, normalize, page_filename};
use quiescence::{InFlightTracker, is_trackable, wait_until_quiet};

/// Result of the crawl phase.
#[derive(Debug, Clone, Copy)]
pub struct CrawlOutcome {
    /// Pages processed successfully.
    pub processed: usize,
    /// Whether the page cap stopped the crawl with work still queued.
    pub truncated: bool,
}

/// Run the crawl phase: worker fan-out, then the capture join barrier.
///
/// Returns only after every spawned capture task has completed, so the
/// registries are final when this function returns.
pub async fn crawl_site(
    config: Arc<MirrorConfig>,
    backend: Arc<dyn BrowserBackend>,
    frontier: Arc<Mutex<Frontier>>,
    registries: Arc<Registries>,
    fetcher: Arc<AssetFetcher>,
) -> Result<CrawlOutcome> {
    let processed = Arc::new(AtomicUsize::new(0));
    let pending_captures: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));

    let mut workers = Vec::new();
    for id in 0..config.concurrency {
        let worker = Worker {
            id,
            config: Arc::clone(&config),
            backend: Arc::clone(&backend),
            frontier: Arc::clone(&frontier),
            registries: Arc::clone(&registries),
            fetcher: Arc::clone(&fetcher),
            processed: Arc::clone(&processed),
            pending_captures: Arc::clone(&pending_captures),
        };
        workers.push(tokio::spawn(worker.run()));
    }

    for (id, handle) in workers.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(())) => debug!("worker {id} finished"),
            Ok(Err(e)) => warn!("worker {id} stopped with error: {e:#}"),
            Err(e) => warn!("worker {id} panicked: {e}"),
        }
    }

    // Capture barrier: every spawned capture task must land before any
    // rewriting starts.
    let mut captures = pending_captures.lock().await;
    while let Some(joined) = captures.join_next().await {
        if let Err(e) = joined {
            warn!("capture task failed: {e}");
        }
    }
    drop(captures);

    let processed = processed.load(Ordering::Relaxed);
    let truncated = {
        let frontier = frontier.lock().await;
        config
            .effective_page_cap()
            .is_some_and(|cap| processed >= cap && frontier.pending_len() > 0)
    };

    info!("crawl phase complete: {processed} pages processed");
    Ok(CrawlOutcome {
        processed,
        truncated,
    })
}

struct Worker {
    id: usize,
    config: Arc<MirrorConfig>,
    backend: Arc<dyn BrowserBackend>,
    frontier: Arc<Mutex<Frontier>>,
    registries: Arc<Registries>,
    fetcher: Arc<AssetFetcher>,
    processed: Arc<AtomicUsize>,
    pending_captures: Arc<Mutex<JoinSet<()>>>,
}

impl Worker {
    async fn run(self) -> Result<()> {
        debug!("worker {} started", self.id);
        let page = self
            .backend
            .open_page()
            .await
            .with_context(|| format!("worker {} failed to open page", self.id))?;

        let tracker = Arc::new(InFlightTracker::default());
        let pump = self.spawn_event_pump(&page, Arc::clone(&tracker)).await?;

        loop {
            if let Some(cap) = self.config.effective_page_cap()
                && self.processed.load(Ordering::Relaxed) >= cap
            {
                debug!("worker {} stopping at page cap", self.id);
                break;
            }

            let Some(url) = self.frontier.lock().await.dequeue() else {
                break;
            };

            match self.process_page(&page, &tracker, &url).await {
                Ok(()) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("error processing {url}: {e:#}");
                    if let Err(log_err) =
                        self.registries.errors.record(&url, &format!("{e:#}")).await
                    {
                        warn!("failed to record error for {url}: {log_err:#}");
                    }
                }
            }

            tokio::time::sleep(self.config.request_delay).await;
        }

        if let Err(e) = page.close().await {
            debug!("worker {} page close failed: {e:#}", self.id);
        }
        drop(page);

        // The pump drains remaining events and exits once the page's event
        // channel closes.
        if tokio::time::timeout(Duration::from_secs(5), pump).await.is_err() {
            debug!("worker {} event pump did not drain in time", self.id);
        }
        Ok(())
    }

    /// Forward network events into quiescence bookkeeping and spawn tracked
    /// capture tasks for completed exchanges.
    async fn spawn_event_pump(
        &self,
        page: &Arc<dyn PageSession>,
        tracker: Arc<InFlightTracker>,
    ) -> Result<JoinHandle<()>> {
        let mut events = page
            .subscribe_network()
            .await
            .context("failed to subscribe to network events")?;
        let config = Arc::clone(&self.config);
        let registries = Arc::clone(&self.registries);
        let pending = Arc::clone(&self.pending_captures);

        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    NetworkEvent::RequestStarted(request) => {
                        if is_trackable(&request, &config) {
                            tracker.request_started();
                        }
                    }
                    NetworkEvent::RequestFinished(request)
                    | NetworkEvent::RequestFailed(request) => {
                        if is_trackable(&request, &config) {
                            tracker.request_done();
                        }
                    }
                    NetworkEvent::ResponseCaptured(exchange) => {
                        let config = Arc::clone(&config);
                        let registries = Arc::clone(&registries);
                        pending.lock().await.spawn(async move {
                            save_passive(
                                &exchange,
                                &config.output_dir,
                                &config.allowed_hosts,
                                &registries,
                            )
                            .await;
                            registries.api.capture(&exchange, &config.output_dir).await;
                        });
                    }
                }
            }
        }))
    }

    async fn process_page(
        &self,
        page: &Arc<dyn PageSession>,
        tracker: &Arc<InFlightTracker>,
        url: &str,
    ) -> Result<()> {
        info!("visiting {url}");

        // Important-API waiters race against navigation; they are armed
        // before goto so early responses are not missed.
        let waiters: Vec<JoinHandle<()>> = self
            .config
            .important_apis
            .iter()
            .map(|api| {
                let page = Arc::clone(page);
                let api = api.clone();
                let timeout = self.config.important_api_timeout;
                tokio::spawn(async move {
                    if let Err(e) = page.wait_for_response_match(api.clone(), timeout).await {
                        debug!("important API {api} wait ended: {e:#}");
                    }
                })
            })
            .collect();

        page.navigate(url, self.config.navigation_timeout).await?;
        page.wait_for_network_idle(self.config.network_idle_timeout)
            .await?;

        let quiet = wait_until_quiet(
            tracker,
            self.config.quiescence.quiet_window,
            self.config.quiescence_max_wait(),
            self.config.quiescence.poll_interval,
        )
        .await;
        if !quiet {
            debug!("quiescence budget exhausted for {url}");
        }

        for waiter in waiters {
            let _ = waiter.await;
        }

        let html = page.content().await?;
        let filename = page_filename(url);
        let saved_path = self.config.output_dir.join(&filename);
        if let Some(parent) = saved_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&saved_path, &html)
            .await
            .with_context(|| format!("failed to save {}", saved_path.display()))?;
        self.registries.pages.register(url, &saved_path).await;

        let hrefs = page.extract_anchor_hrefs().await?;
        let base = url::Url::parse(url).with_context(|| format!("invalid page URL {url}"))?;
        for href in hrefs {
            let Ok(resolved) = base.join(href.trim()) else {
                continue;
            };
            if !matches!(resolved.scheme(), "http" | "https") {
                continue;
            }
            let link = normalize(resolved.as_str());
            if self.is_forced_asset_link(&link) {
                self.fetcher.download(&link).await;
                continue;
            }
            self.frontier.lock().await.enqueue(&link);
        }

        Ok(())
    }

    /// Links routed to resource capture instead of the frontier: in-scope
    /// URLs under a forced-asset prefix, or carrying a non-page extension.
    fn is_forced_asset_link(&self, link: &str) -> bool {
        let Ok(parsed) = url::Url::parse(link) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        if !self.config.allowed_hosts.iter().any(|h| h == host) {
            return false;
        }
        let path = parsed.path();
        has_non_page_extension(path) || self.config.is_forced_asset_path(path)
    }
}
