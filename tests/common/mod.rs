//! In-process fake of the browser automation backend.
//!
//! Pages are fixtures: static HTML, anchor targets and a canned list of
//! network exchanges replayed on navigation. Out-of-band fetches resolve
//! against a URL → response table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use webstill::backend::{
    BrowserBackend, NetworkEvent, NetworkExchange, OutOfBandRequest, OutOfBandResponse,
    PageSession, RequestInfo, ResourceKind, ResponseInfo,
};

/// One crawlable page served by the fake backend.
#[derive(Debug, Clone, Default)]
pub struct PageFixture {
    pub html: String,
    /// Raw anchor hrefs as the DOM would report them.
    pub anchors: Vec<String>,
    /// Network exchanges observed while the page loads.
    pub exchanges: Vec<NetworkExchange>,
}

#[derive(Default)]
pub struct MockBackend {
    pub pages: HashMap<String, PageFixture>,
    /// URL → (status, content-type, body) for out-of-band fetches.
    pub fetch_responses: HashMap<String, (u16, Option<String>, Vec<u8>)>,
    navigations: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, url: &str, fixture: PageFixture) {
        self.pages.insert(url.to_string(), fixture);
    }

    #[allow(dead_code)]
    pub fn add_fetch_response(&mut self, url: &str, status: u16, content_type: &str, body: &[u8]) {
        self.fetch_responses.insert(
            url.to_string(),
            (status, Some(content_type.to_string()), body.to_vec()),
        );
    }

    pub async fn navigations(&self) -> Vec<String> {
        self.navigations.lock().await.clone()
    }
}

#[async_trait]
impl BrowserBackend for MockBackend {
    async fn open_page(&self) -> Result<Arc<dyn PageSession>> {
        Ok(Arc::new(MockPage {
            pages: self.pages.clone(),
            navigations: Arc::clone(&self.navigations),
            current: Mutex::new(None),
            sender: Mutex::new(None),
        }))
    }

    async fn fetch(&self, request: OutOfBandRequest) -> Result<OutOfBandResponse> {
        match self.fetch_responses.get(&request.url) {
            Some((status, content_type, body)) => Ok(OutOfBandResponse {
                status: *status,
                content_type: content_type.clone(),
                body: body.clone(),
            }),
            None => Ok(OutOfBandResponse {
                status: 404,
                content_type: None,
                body: Vec::new(),
            }),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct MockPage {
    pages: HashMap<String, PageFixture>,
    navigations: Arc<Mutex<Vec<String>>>,
    current: Mutex<Option<String>>,
    sender: Mutex<Option<mpsc::UnboundedSender<NetworkEvent>>>,
}

impl MockPage {
    async fn fixture(&self) -> Option<PageFixture> {
        let current = self.current.lock().await;
        current.as_ref().and_then(|url| self.pages.get(url).cloned())
    }
}

#[async_trait]
impl PageSession for MockPage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.navigations.lock().await.push(url.to_string());
        let fixture = self
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("navigation failed: no page at {url}"))?;
        *self.current.lock().await = Some(url.to_string());

        if let Some(tx) = self.sender.lock().await.as_ref() {
            for exchange in fixture.exchanges {
                let _ = tx.send(NetworkEvent::RequestStarted(exchange.request.clone()));
                let _ = tx.send(NetworkEvent::RequestFinished(exchange.request.clone()));
                let _ = tx.send(NetworkEvent::ResponseCaptured(exchange));
            }
        }
        Ok(())
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        self.fixture()
            .await
            .map(|f| f.html)
            .ok_or_else(|| anyhow::anyhow!("no page loaded"))
    }

    async fn extract_anchor_hrefs(&self) -> Result<Vec<String>> {
        Ok(self.fixture().await.map(|f| f.anchors).unwrap_or_default())
    }

    async fn subscribe_network(&self) -> Result<mpsc::UnboundedReceiver<NetworkEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().await = Some(tx);
        Ok(rx)
    }

    async fn wait_for_response_match(&self, _fragment: String, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Dropping the sender ends the event stream for subscribers
        *self.sender.lock().await = None;
        Ok(())
    }
}

/// A programmatic JSON exchange, the shape API capture cares about.
#[allow(dead_code)]
pub fn json_exchange(method: &str, url: &str, body: &str, response: &str) -> NetworkExchange {
    NetworkExchange {
        request: RequestInfo {
            url: url.to_string(),
            method: method.to_string(),
            kind: ResourceKind::Fetch,
            body: (!body.is_empty()).then(|| body.to_string()),
        },
        response: ResponseInfo {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
        },
        body: response.as_bytes().to_vec(),
    }
}

/// A static-asset exchange as passive capture would observe it.
#[allow(dead_code)]
pub fn asset_exchange(url: &str, content_type: &str, body: &[u8]) -> NetworkExchange {
    NetworkExchange {
        request: RequestInfo {
            url: url.to_string(),
            method: "GET".to_string(),
            kind: ResourceKind::Image,
            body: None,
        },
        response: ResponseInfo {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::from([("content-type".to_string(), content_type.to_string())]),
        },
        body: body.to_vec(),
    }
}
