//! URL frontier and crawl scope.
//!
//! The frontier is the only contended state during the crawl phase; workers
//! reach it through a single `tokio::sync::Mutex`, so every method here is
//! synchronous and cheap.

use std::collections::{HashSet, VecDeque};

use url::Url;

/// Predicate deciding whether a URL belongs to the site being mirrored.
#[derive(Debug, Clone)]
pub struct Scope {
    allowed_hosts: Vec<String>,
    excluded_path_prefixes: Vec<String>,
}

impl Scope {
    #[must_use]
    pub fn new(allowed_hosts: Vec<String>, excluded_path_prefixes: Vec<String>) -> Self {
        Self {
            allowed_hosts,
            excluded_path_prefixes,
        }
    }

    /// Full crawl-scope check: allowed host AND not an excluded path.
    ///
    /// Excluded prefixes guard against crawl-induced side effects such as
    /// visiting a session-ending endpoint.
    #[must_use]
    pub fn contains(&self, raw: &str) -> bool {
        let Ok(url) = Url::parse(raw) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        if !self.allowed_hosts.iter().any(|h| h == host) {
            return false;
        }
        let path = url.path();
        !self
            .excluded_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Dedup FIFO of discovered URLs.
///
/// Every URL is in at most one of {pending+queued, seen}; once seen it is
/// never re-enqueued. All membership tests use [`crate::utils::normalize`]d
/// form, which callers are expected to have applied.
#[derive(Debug)]
pub struct Frontier {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    seen: HashSet<String>,
    seen_order: Vec<String>,
    scope: Scope,
}

impl Frontier {
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            pending: VecDeque::new(),
            queued: HashSet::new(),
            seen: HashSet::new(),
            seen_order: Vec::new(),
            scope,
        }
    }

    /// Enqueue a normalized URL. No-op (returning `false`) when the URL is
    /// already queued, already seen, or out of scope.
    pub fn enqueue(&mut self, normalized: &str) -> bool {
        if self.queued.contains(normalized) || self.seen.contains(normalized) {
            return false;
        }
        if !self.scope.contains(normalized) {
            return false;
        }
        self.queued.insert(normalized.to_string());
        self.pending.push_back(normalized.to_string());
        true
    }

    /// Pop the next URL in FIFO order, marking it seen.
    pub fn dequeue(&mut self) -> Option<String> {
        let url = self.pending.pop_front()?;
        self.queued.remove(&url);
        if self.seen.insert(url.clone()) {
            self.seen_order.push(url.clone());
        }
        Some(url)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Seen URLs in first-dequeue order, for `urls.txt`.
    #[must_use]
    pub fn seen_urls(&self) -> &[String] {
        &self.seen_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(
            vec!["site.test".to_string()],
            vec!["/logout".to_string(), "/signout".to_string()],
        )
    }

    #[test]
    fn scope_rejects_foreign_hosts_and_excluded_paths() {
        let scope = scope();
        assert!(scope.contains("https://site.test/docs"));
        assert!(!scope.contains("https://evil.test/docs"));
        assert!(!scope.contains("https://site.test/logout"));
        assert!(!scope.contains("https://site.test/logout/now"));
        assert!(!scope.contains("relative/path"));
    }

    #[test]
    fn discovery_order_is_fifo_with_dedup() {
        let mut frontier = Frontier::new(scope());
        for url in [
            "https://site.test/a",
            "https://site.test/b",
            "https://site.test/a",
            "https://site.test/c",
        ] {
            frontier.enqueue(url);
        }

        let mut order = Vec::new();
        while let Some(url) = frontier.dequeue() {
            order.push(url);
        }
        assert_eq!(
            order,
            vec![
                "https://site.test/a".to_string(),
                "https://site.test/b".to_string(),
                "https://site.test/c".to_string(),
            ]
        );
    }

    #[test]
    fn seen_urls_are_never_requeued() {
        let mut frontier = Frontier::new(scope());
        frontier.enqueue("https://site.test/a");
        let first = frontier.dequeue().unwrap();
        assert_eq!(first, "https://site.test/a");
        assert!(!frontier.enqueue("https://site.test/a"));
        assert_eq!(frontier.pending_len(), 0);
        assert_eq!(frontier.seen_urls(), &["https://site.test/a".to_string()]);
    }

    #[test]
    fn out_of_scope_urls_are_dropped() {
        let mut frontier = Frontier::new(scope());
        assert!(!frontier.enqueue("https://elsewhere.test/a"));
        assert_eq!(frontier.pending_len(), 0);
        assert_eq!(frontier.seen_count(), 0);
    }
}
