//! Active asset download paths: primary out-of-band fetch and the bare
//! HTTP fallback.

mod common;

use std::sync::Arc;

use common::MockBackend;
use webstill::capture::AssetFetcher;
use webstill::registry::Registries;

#[tokio::test]
async fn primary_path_uses_the_backend_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let registries = Registries::new(dir.path());

    let mut backend = MockBackend::new();
    backend.add_fetch_response("https://site.test/img/logo.png", 200, "image/png", b"LOGO");
    let fetcher = AssetFetcher::new(
        Arc::new(backend),
        dir.path().to_path_buf(),
        vec!["site.test".to_string()],
        Some("preview=1".to_string()),
        Arc::clone(&registries),
    );

    fetcher.download("https://site.test/img/logo.png").await;

    assert_eq!(
        std::fs::read(dir.path().join("assets/img/logo.png")).unwrap(),
        b"LOGO"
    );
    assert_eq!(
        registries.assets.get("https://site.test/img/logo.png").as_deref(),
        Some("assets/img/logo.png")
    );

    // Second download is a no-op (write-once per URL)
    fetcher.download("https://site.test/img/logo.png").await;
    assert_eq!(registries.assets.len(), 1);
}

#[tokio::test]
async fn fallback_path_kicks_in_when_the_primary_fails() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/img/logo.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body("FALLBACK")
        .create_async()
        .await;

    let host = server.host_with_port();
    let hostname = host.split(':').next().unwrap().to_string();
    let url = format!("{}/img/logo.png", server.url());

    let dir = tempfile::tempdir().unwrap();
    let registries = Registries::new(dir.path());
    // The mock backend knows nothing about this URL, so the primary path
    // returns 404 and the bare client takes over
    let fetcher = AssetFetcher::new(
        Arc::new(MockBackend::new()),
        dir.path().to_path_buf(),
        vec![hostname],
        None,
        Arc::clone(&registries),
    );

    fetcher.download(&url).await;

    mock.assert_async().await;
    assert_eq!(
        std::fs::read(dir.path().join("assets/img/logo.png")).unwrap(),
        b"FALLBACK"
    );
}

#[tokio::test]
async fn out_of_scope_and_total_failures_leave_no_registration() {
    let dir = tempfile::tempdir().unwrap();
    let registries = Registries::new(dir.path());
    let fetcher = AssetFetcher::new(
        Arc::new(MockBackend::new()),
        dir.path().to_path_buf(),
        vec!["site.test".to_string()],
        None,
        Arc::clone(&registries),
    );

    // Host outside the allow-set: skipped before any request
    fetcher.download("https://elsewhere.test/a.png").await;
    assert!(registries.assets.is_empty());
}
