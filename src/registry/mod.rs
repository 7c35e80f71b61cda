//! Shared per-run registries.
//!
//! All registries are created fresh for a run, written during the
//! crawl/capture phase and treated as read-only once post-processing starts.
//! Writes are idempotent first-write-wins, so concurrent capture tasks need
//! no locking beyond the maps themselves.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use url::Url;

use crate::capture::api::ApiRegistry;
use crate::utils::{normalize, page_filename};

/// Mapping absolute resource URL (normalized) → local path relative to the
/// output root. Write-once per URL.
#[derive(Debug, Default)]
pub struct AssetRegistry {
    map: DashMap<String, String>,
    claims: DashSet<String>,
}

impl AssetRegistry {
    /// Claim a URL for passive capture. Returns `false` when some other task
    /// already claimed it, guaranteeing at most one persisted write per URL.
    pub fn claim(&self, url: &str) -> bool {
        self.claims.insert(normalize(url))
    }

    /// Register a local path for `url`. Returns `false` when the URL was
    /// already registered; the first write wins.
    pub fn register(&self, url: &str, local: &str) -> bool {
        let key = normalize(url);
        let mut inserted = false;
        self.map.entry(key).or_insert_with(|| {
            inserted = true;
            local.to_string()
        });
        inserted
    }

    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.map.contains_key(&normalize(url))
    }

    #[must_use]
    pub fn get(&self, url: &str) -> Option<String> {
        self.map.get(&normalize(url)).map(|entry| entry.clone())
    }

    /// Exact lookup first; on a miss, retry ignoring the query string against
    /// all registered keys. Two URLs differing only by query resolve to
    /// whichever one was downloaded.
    #[must_use]
    pub fn lookup(&self, url: &str) -> Option<String> {
        let key = normalize(url);
        if let Some(entry) = self.map.get(&key) {
            return Some(entry.clone());
        }
        let without_query = key.split('?').next().unwrap_or(&key);
        self.map.iter().find_map(|entry| {
            let stored = entry.key().split('?').next().unwrap_or(entry.key());
            (stored == without_query).then(|| entry.value().clone())
        })
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(String, String)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One crawled page saved to disk.
#[derive(Debug, Clone)]
pub struct SavedPage {
    /// Normalized URL the page was crawled from.
    pub url: String,
    /// Absolute path of the saved HTML file.
    pub path: PathBuf,
}

/// Mapping crawled page URL → saved file name (relative to the output root).
///
/// Every page is registered under both its normalized absolute URL and its
/// path-only form, so rewriting can resolve either shape to the same entry.
#[derive(Debug, Default)]
pub struct PageRegistry {
    map: DashMap<String, String>,
    saved: Mutex<Vec<SavedPage>>,
}

impl PageRegistry {
    /// Register a crawled page under both lookup forms and remember the
    /// saved file for post-processing.
    pub async fn register(&self, url: &str, saved_path: &Path) {
        let normalized = normalize(url);
        let filename = page_filename(&normalized);
        self.map.insert(normalized.clone(), filename.clone());
        if let Ok(parsed) = Url::parse(&normalized) {
            let mut path_form = parsed.path().to_string();
            if !path_form.starts_with('/') {
                path_form.insert(0, '/');
            }
            self.map.insert(path_form, filename);
        }
        self.saved.lock().await.push(SavedPage {
            url: normalized,
            path: saved_path.to_path_buf(),
        });
    }

    /// Look up by normalized absolute URL or path-only form.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|entry| entry.clone())
    }

    #[must_use]
    pub fn resolve(&self, url: &str) -> Option<String> {
        if let Some(found) = self.get(&normalize(url)) {
            return Some(found);
        }
        Url::parse(url)
            .ok()
            .and_then(|parsed| self.get(parsed.path()))
    }

    pub async fn saved_pages(&self) -> Vec<SavedPage> {
        self.saved.lock().await.clone()
    }

    pub async fn saved_count(&self) -> usize {
        self.saved.lock().await.len()
    }
}

/// Append-only per-URL failure record (`errors.log`).
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    count: AtomicUsize,
}

impl ErrorLog {
    #[must_use]
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join("errors.log"),
            write_lock: Mutex::new(()),
            count: AtomicUsize::new(0),
        }
    }

    /// Record a per-URL failure. Failures here are never fatal to the run.
    pub async fn record(&self, url: &str, error: &str) -> Result<()> {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(format!("{url}\n{error}\n\n").as_bytes())
            .await
            .context("failed to append to error log")?;
        Ok(())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// All shared registries for one run, passed by reference into each phase.
pub struct Registries {
    pub assets: AssetRegistry,
    pub pages: PageRegistry,
    pub api: ApiRegistry,
    pub errors: ErrorLog,
}

impl Registries {
    #[must_use]
    pub fn new(output_dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            assets: AssetRegistry::default(),
            pages: PageRegistry::default(),
            api: ApiRegistry::default(),
            errors: ErrorLog::new(output_dir),
        })
    }
}
