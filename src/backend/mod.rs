//! Browser automation backend interface.
//!
//! The mirror core drives navigation, DOM extraction and network observation
//! through these traits. The production implementation wraps headless
//! Chromium ([`chromium::ChromiumBackend`]); tests substitute an in-process
//! fake. Network activity arrives as a typed event stream so the core owns
//! its own bookkeeping (in-flight counts, activity timestamps) instead of
//! hiding it in listener closures.

pub mod chromium;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Coarse classification of a network request, mirroring what browser
/// devtools report as the resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Font,
    Script,
    Media,
    Fetch,
    Xhr,
    Other,
}

impl ResourceKind {
    /// Requests issued by page code rather than the HTML parser. These are
    /// the candidates for API capture. `Other` counts too: devtools leave
    /// some programmatic requests unclassified.
    #[must_use]
    pub fn is_programmatic(&self) -> bool {
        matches!(self, Self::Fetch | Self::Xhr | Self::Other)
    }
}

/// One outgoing request as observed by the backend.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub url: String,
    pub method: String,
    pub kind: ResourceKind,
    /// Raw request body text, when one was sent.
    pub body: Option<String>,
}

/// Response metadata for a completed exchange.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
}

impl ResponseInfo {
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
    }
}

/// A fully observed request/response pair, body included.
#[derive(Debug, Clone)]
pub struct NetworkExchange {
    pub request: RequestInfo,
    pub response: ResponseInfo,
    pub body: Vec<u8>,
}

/// Network lifecycle events emitted per page.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    RequestStarted(RequestInfo),
    RequestFinished(RequestInfo),
    RequestFailed(RequestInfo),
    /// Emitted once the response body has been retrieved. Follows the
    /// corresponding `RequestFinished`.
    ResponseCaptured(NetworkExchange),
}

/// Out-of-band HTTP request issued outside any page (active asset downloads,
/// manual API stores).
#[derive(Debug, Clone)]
pub struct OutOfBandRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl OutOfBandRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
        }
    }
}

/// Response to an out-of-band request.
#[derive(Debug, Clone)]
pub struct OutOfBandResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl OutOfBandResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One open browser page. Each crawl worker owns exactly one session for its
/// whole lifetime.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Navigate and wait for the DOM-ready signal, bounded by `timeout`.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Wait for the backend's network-idle signal.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()>;

    /// Fully rendered HTML of the current document.
    async fn content(&self) -> Result<String>;

    /// Anchor `href` attributes extracted from the live DOM, so
    /// client-rendered links are included.
    async fn extract_anchor_hrefs(&self) -> Result<Vec<String>>;

    /// Subscribe to this page's network events. Each subscription receives
    /// all events from the moment of the call.
    async fn subscribe_network(&self) -> Result<mpsc::UnboundedReceiver<NetworkEvent>>;

    /// Resolve once a response whose URL contains `fragment` is observed.
    /// Used for best-effort important-API waits; callers swallow errors.
    async fn wait_for_response_match(&self, fragment: String, timeout: Duration) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A running browser plus an out-of-band HTTP capability.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn open_page(&self) -> Result<Arc<dyn PageSession>>;

    /// Issue an HTTP request with custom headers, outside any page.
    async fn fetch(&self, request: OutOfBandRequest) -> Result<OutOfBandResponse>;

    async fn shutdown(&self) -> Result<()>;
}
