//! End-to-end mirror run against the in-process fake backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockBackend, PageFixture, asset_exchange, json_exchange};
use webstill::config::MirrorConfig;

fn fast_config(out_dir: &std::path::Path) -> MirrorConfig {
    let mut config = MirrorConfig::new("https://site.test/", out_dir)
        .unwrap()
        .with_concurrency(1)
        .with_request_delay(Duration::from_millis(0));
    config.quiescence.quiet_window = Duration::from_millis(10);
    config.quiescence.max_wait = Duration::from_millis(100);
    config.quiescence.poll_interval = Duration::from_millis(5);
    config
}

fn three_page_site() -> MockBackend {
    let mut backend = MockBackend::new();
    backend.add_page(
        "https://site.test/",
        PageFixture {
            html: concat!(
                "<html><head><title>A</title></head><body>",
                r#"<img src="/a.png">"#,
                r#"<a href="/b">B</a><a href="/c">C</a>"#,
                "</body></html>"
            )
            .to_string(),
            anchors: vec![
                "/b".to_string(),
                "/c".to_string(),
                "https://external.test/d".to_string(),
            ],
            exchanges: vec![
                asset_exchange("https://site.test/a.png", "image/png", b"PNGDATA"),
                json_exchange(
                    "GET",
                    "https://site.test/api/data",
                    "",
                    r#"{"items":["/b","https://site.test/a.png"]}"#,
                ),
            ],
        },
    );
    backend.add_page(
        "https://site.test/b",
        PageFixture {
            html: "<html><head></head><body><a href=\"https://external.test/d\">D</a></body></html>"
                .to_string(),
            anchors: vec!["https://external.test/d".to_string()],
            exchanges: vec![],
        },
    );
    backend.add_page(
        "https://site.test/c",
        PageFixture {
            html: "<html><head></head><body>C</body></html>".to_string(),
            anchors: vec![],
            exchanges: vec![],
        },
    );
    backend
}

#[tokio::test]
async fn three_page_site_is_mirrored_without_leaving_scope() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(three_page_site());
    let config = fast_config(dir.path());

    let summary = webstill::mirror::run(config, backend.clone()).await.unwrap();

    // Exactly A, B, C visited; the external link is never followed
    let visited = backend.navigations().await;
    assert_eq!(
        visited,
        vec![
            "https://site.test/".to_string(),
            "https://site.test/b".to_string(),
            "https://site.test/c".to_string(),
        ]
    );
    assert_eq!(summary.pages_processed, 3);
    assert_eq!(summary.html_saved, 3);

    // Three saved HTML files
    assert!(dir.path().join("index.html").is_file());
    assert!(dir.path().join("b.html").is_file());
    assert!(dir.path().join("c.html").is_file());
    assert!(!dir.path().join("d.html").exists());

    // urls.txt has one line per visited page
    let urls = std::fs::read_to_string(dir.path().join("urls.txt")).unwrap();
    assert_eq!(urls.lines().count(), 3);
    assert!(!urls.contains("external.test"));

    // sitemap maps short names to original URLs
    let sitemap = std::fs::read_to_string(dir.path().join("sitemap.xml")).unwrap();
    assert!(sitemap.contains("<loc>b.html</loc>"));
    assert!(sitemap.contains("<original>https://site.test/b</original>"));
}

#[tokio::test]
async fn captured_assets_and_page_links_are_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(three_page_site());
    let config = fast_config(dir.path());

    let summary = webstill::mirror::run(config, backend).await.unwrap();
    assert_eq!(summary.assets_saved, 1);

    // Passively captured asset landed at its deterministic path
    assert_eq!(
        std::fs::read(dir.path().join("assets/a.png")).unwrap(),
        b"PNGDATA"
    );

    let index = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
    assert!(index.contains(r#"src="./assets/a.png""#), "asset not rewritten: {index}");
    assert!(index.contains(r#"href="./b.html""#), "page link not rewritten: {index}");
    assert!(index.contains(r#"href="./c.html""#));
}

#[tokio::test]
async fn api_capture_feeds_the_replay_shim() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(three_page_site());
    let config = fast_config(dir.path());

    let summary = webstill::mirror::run(config, backend).await.unwrap();
    assert_eq!(summary.api_stored, 1);
    assert_eq!(summary.api_calls, 1);

    // Payload persisted under the auto-capture namespace
    let payload = dir.path().join("assets/auto/GET_site.test_api_data.json");
    assert!(payload.is_file(), "missing {}", payload.display());

    // Every page carries the shim with the full alias fan
    for file in ["index.html", "b.html", "c.html"] {
        let html = std::fs::read_to_string(dir.path().join(file)).unwrap();
        assert!(html.contains("__WEBSTILL_RESOURCES__"), "{file} missing shim");
        assert!(html.contains(r#""GET /api/data""#), "{file} missing alias");
        assert!(html.contains(r#""GET https://site.test/api/data""#));
        assert!(html.contains("window.fetch = function"));
    }

    // Nested URLs inside the captured JSON body resolve offline: the page
    // link is rewritten per document, the API path is left to the shim
    let index = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
    assert!(index.contains(r#"./b.html"#));
    let b = std::fs::read_to_string(dir.path().join("b.html")).unwrap();
    assert!(b.contains(r#"./assets/a.png"#) || b.contains(r#"\"./assets/a.png\""#));
}

#[tokio::test]
async fn page_cap_stops_the_crawl_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(three_page_site());
    let config = fast_config(dir.path()).with_max_pages(1);

    let summary = webstill::mirror::run(config, backend.clone()).await.unwrap();
    assert_eq!(summary.pages_processed, 1);
    assert!(summary.truncated);
    assert_eq!(backend.navigations().await.len(), 1);
}

#[tokio::test]
async fn navigation_failures_are_recorded_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = three_page_site();
    // Remove C so navigating to it fails
    backend.pages.remove("https://site.test/c");
    let backend = Arc::new(backend);
    let config = fast_config(dir.path());

    let summary = webstill::mirror::run(config, backend).await.unwrap();
    assert_eq!(summary.pages_processed, 2);
    assert_eq!(summary.page_errors, 1);

    let errors = std::fs::read_to_string(dir.path().join("errors.log")).unwrap();
    assert!(errors.contains("https://site.test/c"));
    // The failed page still appears in urls.txt as visited
    let urls = std::fs::read_to_string(dir.path().join("urls.txt")).unwrap();
    assert_eq!(urls.lines().count(), 3);
}

#[tokio::test]
async fn replacements_run_last_over_the_whole_tree() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(three_page_site());
    let config = fast_config(dir.path()).with_replacements(vec![
        webstill::ReplacementRule::parse("site.test::mirror.local").unwrap(),
    ]);

    let summary = webstill::mirror::run(config, backend).await.unwrap();
    assert!(summary.replacements.total_hits > 0);

    let index = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
    assert!(!index.contains("site.test"));
    assert!(index.contains("mirror.local"));
}

#[tokio::test]
async fn manual_stores_merge_into_the_alias_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = three_page_site();
    backend.add_fetch_response(
        "https://site.test/api/menu",
        200,
        "application/json",
        br#"{"entries":[{"href":"/b"}]}"#,
    );
    backend.add_fetch_response(
        "https://site.test/js/boot.js",
        200,
        "application/javascript",
        b"window.booted=true;",
    );
    let backend = Arc::new(backend);

    let config = fast_config(dir.path()).with_store_api_specs(vec![
        webstill::StoreApiSpec::parse("GET:https://site.test/api/menu|/static/menu.json").unwrap(),
        webstill::StoreApiSpec::parse("script:GET:https://site.test/js/boot.js|/static/boot.js")
            .unwrap(),
    ]);

    let summary = webstill::mirror::run(config, backend).await.unwrap();
    assert_eq!(summary.manual_stored, 2);

    // Payloads written at their configured local paths
    assert!(dir.path().join("static/menu.json").is_file());
    assert!(dir.path().join("static/boot.js").is_file());

    let index = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
    assert!(index.contains(r#""GET /api/menu""#), "manual alias missing");
    // Global data var injected with per-page rewritten JSON
    assert!(index.contains("window.__MENU_DATA__"), "data var missing: {index}");
    assert!(index.contains("./b.html"));
    // Script-type stores are inlined verbatim, not aliased
    assert!(index.contains("<script>window.booted=true;</script>"));
    assert!(!index.contains(r#""GET /js/boot.js""#));
}
