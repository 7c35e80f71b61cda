//! Main configuration struct for mirror runs.
//!
//! Required fields go through [`MirrorConfig::new`]; everything else has a
//! default and a fluent `with_*` setter.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::capture::api::StoreApiSpec;
use crate::replace::ReplacementRule;

/// Empirically tuned network-quiescence timing.
///
/// The quiet window and max wait compensate for chained request→then→request
/// sequences that a single network-idle event misses; both are configuration
/// rather than constants because the right values depend on the site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuiescenceSettings {
    /// Minimum dwell with zero tracked in-flight requests before a page
    /// counts as quiet.
    pub quiet_window: Duration,
    /// Upper bound on the whole quiescence loop.
    pub max_wait: Duration,
    /// Polling interval inside the loop.
    pub poll_interval: Duration,
}

impl Default for QuiescenceSettings {
    fn default() -> Self {
        Self {
            quiet_window: Duration::from_millis(1200),
            max_wait: Duration::from_secs(15),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Configuration for one mirror run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// First URL enqueued; also the page copied to `index.html`.
    pub start_url: String,
    /// Output directory. **INVARIANT:** absolute once the run starts
    /// (normalized by output preparation).
    pub output_dir: PathBuf,
    /// Hosts considered part of the site. Defaults to the start URL's host.
    pub allowed_hosts: Vec<String>,
    /// Path prefixes never visited even on an allowed host, to avoid
    /// crawl-induced side effects such as ending a session.
    pub excluded_path_prefixes: Vec<String>,
    /// Path prefixes treated as API-like for request tracking and for the
    /// replay shim's key space.
    pub api_path_prefixes: Vec<String>,
    /// Stop after this many processed pages.
    pub max_pages: usize,
    /// Crawl until the frontier drains, ignoring `max_pages`.
    pub ignore_max: bool,
    /// Number of concurrent workers, each owning one browser page.
    pub concurrency: usize,
    /// Fixed delay between page visits per worker.
    pub request_delay: Duration,
    /// Overrides the quiescence max wait when set (extra settle time for
    /// sites with slow chained API calls).
    pub settle_wait: Option<Duration>,
    /// Endpoint substrings raced as best-effort response waits per page.
    pub important_apis: Vec<String>,
    /// In-scope path prefixes force-downloaded as assets instead of crawled.
    pub forced_asset_prefixes: Vec<String>,
    /// Delete a non-empty output directory without confirmation.
    pub force_delete: bool,
    /// Manual API stores fetched once, outside the crawl loop.
    pub store_api_specs: Vec<StoreApiSpec>,
    /// Ordered literal replacements applied to every output file.
    pub replacements: Vec<ReplacementRule>,
    /// Cookie header attached to the primary out-of-band fetch path.
    pub cookie_header: Option<String>,
    /// Timeout for the initial navigation of each page.
    pub navigation_timeout: Duration,
    /// Timeout for the backend's network-idle signal.
    pub network_idle_timeout: Duration,
    /// Timeout for each important-API response wait.
    pub important_api_timeout: Duration,
    /// Quiescence loop timing.
    pub quiescence: QuiescenceSettings,
}

impl MirrorConfig {
    /// Create a config for `start_url`, writing into `output_dir`.
    ///
    /// The allowed-host set defaults to the start URL's host.
    pub fn new(start_url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let start_url = start_url.into();
        let parsed = Url::parse(&start_url)
            .with_context(|| format!("invalid start URL: {start_url}"))?;
        let host = parsed
            .host_str()
            .context("start URL has no host")?
            .to_string();

        Ok(Self {
            start_url,
            output_dir: output_dir.into(),
            allowed_hosts: vec![host],
            excluded_path_prefixes: vec!["/logout".to_string(), "/signout".to_string()],
            api_path_prefixes: vec!["/api".to_string()],
            max_pages: 5000,
            ignore_max: false,
            concurrency: 3,
            request_delay: Duration::from_millis(200),
            settle_wait: None,
            important_apis: Vec::new(),
            forced_asset_prefixes: Vec::new(),
            force_delete: false,
            store_api_specs: Vec::new(),
            replacements: Vec::new(),
            cookie_header: None,
            navigation_timeout: Duration::from_secs(120),
            network_idle_timeout: Duration::from_secs(30),
            important_api_timeout: Duration::from_secs(30),
            quiescence: QuiescenceSettings::default(),
        })
    }

    #[must_use]
    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        if !hosts.is_empty() {
            self.allowed_hosts = hosts;
        }
        self
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    #[must_use]
    pub fn with_ignore_max(mut self, ignore_max: bool) -> Self {
        self.ignore_max = ignore_max;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    #[must_use]
    pub fn with_settle_wait(mut self, wait: Option<Duration>) -> Self {
        self.settle_wait = wait;
        self
    }

    #[must_use]
    pub fn with_important_apis(mut self, apis: Vec<String>) -> Self {
        self.important_apis = apis;
        self
    }

    /// Forced-asset prefixes are stored with a leading slash and no trailing
    /// slash so prefix matching stays uniform.
    #[must_use]
    pub fn with_forced_asset_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.forced_asset_prefixes = prefixes
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(|p| {
                let with_slash = if p.starts_with('/') { p } else { format!("/{p}") };
                with_slash.trim_end_matches('/').to_string()
            })
            .collect();
        self
    }

    #[must_use]
    pub fn with_force_delete(mut self, force: bool) -> Self {
        self.force_delete = force;
        self
    }

    #[must_use]
    pub fn with_store_api_specs(mut self, specs: Vec<StoreApiSpec>) -> Self {
        self.store_api_specs = specs;
        self
    }

    #[must_use]
    pub fn with_replacements(mut self, rules: Vec<ReplacementRule>) -> Self {
        self.replacements = rules;
        self
    }

    #[must_use]
    pub fn with_cookie_header(mut self, cookie: Option<String>) -> Self {
        self.cookie_header = cookie;
        self
    }

    /// Page cap honored before each dequeue; `None` when `--ignore-max`.
    #[must_use]
    pub fn effective_page_cap(&self) -> Option<usize> {
        if self.ignore_max { None } else { Some(self.max_pages) }
    }

    /// Quiescence max wait, with the settle-wait override applied.
    #[must_use]
    pub fn quiescence_max_wait(&self) -> Duration {
        match self.settle_wait {
            Some(wait) if !wait.is_zero() => wait,
            _ => self.quiescence.max_wait,
        }
    }

    /// Whether `path` falls under a forced-asset prefix.
    #[must_use]
    pub fn is_forced_asset_path(&self, path: &str) -> bool {
        self.forced_asset_prefixes
            .iter()
            .any(|prefix| path == prefix || path.starts_with(&format!("{prefix}/")))
    }

    /// Whether `path` looks like an API endpoint.
    #[must_use]
    pub fn is_api_path(&self, path: &str) -> bool {
        self.api_path_prefixes
            .iter()
            .any(|prefix| path == prefix || path.starts_with(&format!("{prefix}/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_host_from_start_url() {
        let config = MirrorConfig::new("https://site.test/start", "/tmp/out").unwrap();
        assert_eq!(config.allowed_hosts, vec!["site.test".to_string()]);
        assert_eq!(config.effective_page_cap(), Some(5000));
        assert!(config.is_api_path("/api/data"));
        assert!(!config.is_api_path("/apiary"));
    }

    #[test]
    fn ignore_max_removes_the_cap() {
        let config = MirrorConfig::new("https://site.test/", "/tmp/out")
            .unwrap()
            .with_max_pages(10)
            .with_ignore_max(true);
        assert_eq!(config.effective_page_cap(), None);
    }

    #[test]
    fn forced_asset_prefixes_are_normalized() {
        let config = MirrorConfig::new("https://site.test/", "/tmp/out")
            .unwrap()
            .with_forced_asset_prefixes(vec!["downloads/".to_string(), " ".to_string()]);
        assert_eq!(config.forced_asset_prefixes, vec!["/downloads".to_string()]);
        assert!(config.is_forced_asset_path("/downloads/file.pdf"));
        assert!(config.is_forced_asset_path("/downloads"));
        assert!(!config.is_forced_asset_path("/downloads-old"));
    }

    #[test]
    fn settle_wait_overrides_quiescence_max() {
        let config = MirrorConfig::new("https://site.test/", "/tmp/out")
            .unwrap()
            .with_settle_wait(Some(Duration::from_secs(40)));
        assert_eq!(config.quiescence_max_wait(), Duration::from_secs(40));

        let config = MirrorConfig::new("https://site.test/", "/tmp/out").unwrap();
        assert_eq!(config.quiescence_max_wait(), Duration::from_secs(15));
    }
}
