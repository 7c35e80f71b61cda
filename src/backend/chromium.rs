//! Headless-Chromium implementation of the browser backend.
//!
//! Finds a system Chrome/Chromium (environment override, well-known install
//! paths, `which`), falling back to a managed download. Network observation
//! is wired through CDP event listeners; out-of-band requests go through a
//! shared `reqwest` client.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, GetResponseBodyParams, Headers, RequestId, ResourceType,
};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    BrowserBackend, NetworkEvent, NetworkExchange, OutOfBandRequest, OutOfBandResponse,
    PageSession, RequestInfo, ResourceKind, ResponseInfo,
};
use crate::capture::assets::is_static_asset_content_type;
use crate::utils::BROWSER_USER_AGENT;
use async_trait::async_trait;

/// Find a Chrome/Chromium executable on the system.
pub async fn find_browser_executable() -> Result<PathBuf> {
    // Environment variable overrides all other methods
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "~/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = if let Some(rest) = path_str.strip_prefix("~/") {
            match dirs::home_dir() {
                Some(home) => home.join(rest),
                None => continue,
            }
        } else {
            PathBuf::from(path_str)
        };
        if path.exists() {
            info!("Found browser at: {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path_str.is_empty() {
                    let path = PathBuf::from(path_str);
                    info!("Found browser via 'which': {}", path.display());
                    return Ok(path);
                }
            }
        }
    }

    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Download a managed Chromium when no system browser is available.
pub async fn download_managed_browser() -> Result<PathBuf> {
    info!("Downloading managed Chromium browser...");

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("webstill")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("Failed to create browser cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("Failed to build fetcher options")?,
    );
    let revision_info = fetcher.fetch().await.context("Failed to fetch browser")?;

    info!(
        "Downloaded Chromium to: {}",
        revision_info.folder_path.display()
    );
    Ok(revision_info.executable_path)
}

/// Launch headless Chromium and spawn its CDP handler task.
async fn launch_browser() -> Result<(Browser, JoinHandle<()>)> {
    let chrome_path = match find_browser_executable().await {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };

    let user_data_dir =
        std::env::temp_dir().join(format!("webstill_chrome_{}", std::process::id()));
    std::fs::create_dir_all(&user_data_dir).context("Failed to create user data directory")?;

    let browser_config = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(user_data_dir)
        .chrome_executable(chrome_path)
        .headless_mode(HeadlessMode::default())
        .arg(format!("--user-agent={BROWSER_USER_AGENT}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-notifications")
        .arg("--disable-extensions")
        .arg("--disable-popup-blocking")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--ignore-certificate-errors")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("Failed to launch browser")?;

    let handler_task = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if let Err(e) = h {
                let msg = e.to_string();
                // Chrome emits CDP events chromiumoxide does not recognize;
                // those deserialization failures are not actionable.
                let benign = msg.contains("data did not match any variant of untagged enum Message")
                    || msg.contains("Failed to deserialize WS response");
                if benign {
                    trace!("Suppressed benign CDP serialization error: {msg}");
                } else {
                    warn!("Browser handler error: {msg}");
                }
            }
        }
        debug!("Browser handler task completed");
    });

    Ok((browser, handler_task))
}

/// Production backend: one Chromium process shared by all workers.
pub struct ChromiumBackend {
    browser: Mutex<Browser>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    http: reqwest::Client,
}

impl ChromiumBackend {
    pub async fn launch() -> Result<Self> {
        let (browser, handler_task) = launch_browser().await?;
        let http = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            browser: Mutex::new(browser),
            handler_task: Mutex::new(Some(handler_task)),
            http,
        })
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn open_page(&self) -> Result<Arc<dyn PageSession>> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .context("Failed to open page")?
        };
        // Network events are needed before the first navigation
        page.execute(network::EnableParams::default())
            .await
            .context("Failed to enable network domain")?;
        Ok(Arc::new(ChromiumPage { page }))
    }

    async fn fetch(&self, request: OutOfBandRequest) -> Result<OutOfBandResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .with_context(|| format!("invalid HTTP method: {}", request.method))?;
        let mut builder = self.http.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("request failed: {}", request.url))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body: {}", request.url))?
            .to_vec();

        Ok(OutOfBandResponse {
            status,
            content_type,
            body,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!("Browser close failed: {e}");
            }
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            task.abort();
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!("Handler task failed during abort: {e}");
            }
        }
        Ok(())
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| anyhow::anyhow!("navigation timeout after {timeout:?}: {url}"))?
            .with_context(|| format!("navigation failed: {url}"))?;
        Ok(())
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.page.wait_for_navigation())
            .await
            .map_err(|_| anyhow::anyhow!("network idle timeout after {timeout:?}"))?
            .context("wait for network idle failed")?;
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        self.page.content().await.context("failed to read page HTML")
    }

    async fn extract_anchor_hrefs(&self) -> Result<Vec<String>> {
        let hrefs: Vec<String> = self
            .page
            .evaluate(
                "Array.from(document.querySelectorAll('a[href]')).map(a => a.getAttribute('href'))",
            )
            .await
            .context("anchor extraction script failed")?
            .into_value()
            .context("anchor extraction returned unexpected shape")?;
        Ok(hrefs)
    }

    async fn subscribe_network(&self) -> Result<mpsc::UnboundedReceiver<NetworkEvent>> {
        let mut requests = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("failed to listen for request events")?;
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .context("failed to listen for response events")?;
        let mut finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .context("failed to listen for loading-finished events")?;
        let mut failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .context("failed to listen for loading-failed events")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let page = self.page.clone();

        tokio::spawn(async move {
            let mut inflight: HashMap<RequestId, RequestInfo> = HashMap::new();
            let mut response_meta: HashMap<RequestId, ResponseInfo> = HashMap::new();

            loop {
                if tx.is_closed() {
                    break;
                }
                tokio::select! {
                    maybe = requests.next() => {
                        let Some(event) = maybe else { break };
                        let info = RequestInfo {
                            url: event.request.url.clone(),
                            method: event.request.method.clone(),
                            kind: map_resource_type(event.r#type.as_ref()),
                            body: event.request.post_data_entries.as_ref().map(|entries| {
                                entries
                                    .iter()
                                    .filter_map(|e| e.bytes.clone())
                                    .map(String::from)
                                    .collect::<String>()
                            }),
                        };
                        inflight.insert(event.request_id.clone(), info.clone());
                        let _ = tx.send(NetworkEvent::RequestStarted(info));
                    }
                    maybe = responses.next() => {
                        let Some(event) = maybe else { break };
                        response_meta.insert(
                            event.request_id.clone(),
                            ResponseInfo {
                                status: event.response.status as u16,
                                status_text: event.response.status_text.clone(),
                                headers: headers_to_map(&event.response.headers),
                            },
                        );
                    }
                    maybe = finished.next() => {
                        let Some(event) = maybe else { break };
                        let Some(info) = inflight.remove(&event.request_id) else { continue };
                        let _ = tx.send(NetworkEvent::RequestFinished(info.clone()));

                        let Some(response) = response_meta.remove(&event.request_id) else { continue };
                        if !wants_body(&info, &response) {
                            continue;
                        }
                        match page.execute(GetResponseBodyParams::new(event.request_id.clone())).await {
                            Ok(result) => {
                                let body = if result.base64_encoded {
                                    base64::engine::general_purpose::STANDARD
                                        .decode(result.body.as_bytes())
                                        .unwrap_or_default()
                                } else {
                                    result.body.clone().into_bytes()
                                };
                                let _ = tx.send(NetworkEvent::ResponseCaptured(NetworkExchange {
                                    request: info,
                                    response,
                                    body,
                                }));
                            }
                            Err(e) => trace!("response body unavailable for {}: {e}", info.url),
                        }
                    }
                    maybe = failed.next() => {
                        let Some(event) = maybe else { break };
                        if let Some(info) = inflight.remove(&event.request_id) {
                            response_meta.remove(&event.request_id);
                            let _ = tx.send(NetworkEvent::RequestFailed(info));
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn wait_for_response_match(&self, fragment: String, timeout: Duration) -> Result<()> {
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .context("failed to listen for response events")?;

        tokio::time::timeout(timeout, async {
            while let Some(event) = responses.next().await {
                if event.response.url.contains(&fragment) {
                    return Ok(());
                }
            }
            Err(anyhow::anyhow!("response stream ended"))
        })
        .await
        .map_err(|_| anyhow::anyhow!("no response matching {fragment:?} within {timeout:?}"))?
    }

    async fn close(&self) -> Result<()> {
        self.page
            .clone()
            .close()
            .await
            .context("failed to close page")
    }
}

/// Bodies are retrieved only for exchanges the capture layer can use:
/// programmatic requests (API capture) and static-asset responses.
fn wants_body(request: &RequestInfo, response: &ResponseInfo) -> bool {
    if request.kind.is_programmatic() {
        return true;
    }
    response
        .content_type()
        .is_some_and(is_static_asset_content_type)
}

fn map_resource_type(kind: Option<&ResourceType>) -> ResourceKind {
    match kind {
        Some(ResourceType::Document) => ResourceKind::Document,
        Some(ResourceType::Stylesheet) => ResourceKind::Stylesheet,
        Some(ResourceType::Image) => ResourceKind::Image,
        Some(ResourceType::Font) => ResourceKind::Font,
        Some(ResourceType::Script) => ResourceKind::Script,
        Some(ResourceType::Media) => ResourceKind::Media,
        Some(ResourceType::Fetch) => ResourceKind::Fetch,
        Some(ResourceType::Xhr) => ResourceKind::Xhr,
        _ => ResourceKind::Other,
    }
}

fn headers_to_map(headers: &Headers) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(object) = headers.inner().as_object() {
        for (key, value) in object {
            let value = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            map.insert(key.clone(), value);
        }
    }
    map
}
