//! Command-line surface.
//!
//! Thin shell over [`MirrorConfig`]: flag parsing, list splitting and the
//! spec-string formats for `--store-api` and `--replace`. Malformed specs
//! fail here, before anything touches the network or the output directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::capture::api::StoreApiSpec;
use crate::config::MirrorConfig;
use crate::replace::ReplacementRule;

/// Crawl a website and save HTML, CSS, JS, images and API traffic for
/// offline use.
#[derive(Debug, Parser)]
#[command(name = "webstill", version, about)]
pub struct Args {
    /// Start URL
    #[arg(long)]
    pub start_url: String,

    /// Output directory
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Comma-separated allowed hosts (default: host of start-url)
    #[arg(long)]
    pub allowed_hosts: Option<String>,

    /// Max pages to crawl
    #[arg(long, default_value_t = 5000)]
    pub max_pages: usize,

    /// Ignore the max-pages cap and crawl until the queue is exhausted
    #[arg(long)]
    pub ignore_max: bool,

    /// Number of concurrent browser workers
    #[arg(long, default_value_t = 3)]
    pub concurrency: usize,

    /// Delay between requests in milliseconds
    #[arg(long, default_value_t = 200)]
    pub delay_ms: u64,

    /// Extra wait after network idle for delayed API calls, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub settle_wait_ms: u64,

    /// Comma-separated important API endpoints to wait for after navigation
    #[arg(long)]
    pub important_apis: Option<String>,

    /// Comma-separated in-scope URL path prefixes to force-download as assets
    #[arg(long)]
    pub asset_prefixes: Option<String>,

    /// Delete the output directory without confirmation
    #[arg(long)]
    pub force: bool,

    /// Store an API response: [type:]method:url[|headers]|localPath.
    /// Headers as key:value,key:value. Type is 'json' or 'script'
    /// (default json). Repeatable.
    #[arg(long = "store-api")]
    pub store_api: Vec<String>,

    /// Literal replacement applied to all output files, format: from::to.
    /// Repeatable, applied in order.
    #[arg(long = "replace")]
    pub replace: Vec<String>,

    /// Cookie header sent on out-of-band fetches (asset downloads, manual
    /// API stores)
    #[arg(long)]
    pub cookie: Option<String>,
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl Args {
    /// Validate and convert into a run configuration.
    pub fn into_config(self) -> Result<MirrorConfig> {
        let store_api_specs = self
            .store_api
            .iter()
            .map(|raw| StoreApiSpec::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        let replacements = self
            .replace
            .iter()
            .map(|raw| ReplacementRule::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        let settle_wait = (self.settle_wait_ms > 0)
            .then(|| Duration::from_millis(self.settle_wait_ms));

        Ok(MirrorConfig::new(self.start_url, self.out_dir)?
            .with_allowed_hosts(split_list(self.allowed_hosts.as_deref()))
            .with_max_pages(self.max_pages)
            .with_ignore_max(self.ignore_max)
            .with_concurrency(self.concurrency)
            .with_request_delay(Duration::from_millis(self.delay_ms))
            .with_settle_wait(settle_wait)
            .with_important_apis(split_list(self.important_apis.as_deref()))
            .with_forced_asset_prefixes(split_list(self.asset_prefixes.as_deref()))
            .with_force_delete(self.force)
            .with_store_api_specs(store_api_specs)
            .with_replacements(replacements)
            .with_cookie_header(self.cookie))
    }
}
