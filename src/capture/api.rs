//! API traffic capture and the alias key space.
//!
//! Programmatic requests are identified by a signature of
//! `(method, normalized URL, body hash)`. Each distinct signature is
//! persisted once; the stored record is then reachable through a fan of
//! alias keys so replaying code can reconstruct the request at any
//! granularity (with or without method, host, query or body hash).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::backend::{BrowserBackend, NetworkExchange, OutOfBandRequest};
use crate::utils::normalize;

/// Verbs eligible for capture.
const SUPPORTED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

#[must_use]
pub fn is_supported_method(method: &str) -> bool {
    SUPPORTED_METHODS
        .iter()
        .any(|m| method.eq_ignore_ascii_case(m))
}

/// Cheap non-cryptographic hash of a request body.
///
/// This mirrors the rolling hash the injected replay shim computes in
/// JavaScript (`h = (h << 5) - h + code | 0` over UTF-16 code units,
/// absolute value, decimal). Capture and replay MUST agree on this value,
/// which is why it is hand-implemented instead of using a hashing crate.
#[must_use]
pub fn body_hash(body: &str) -> String {
    let mut hash: i32 = 0;
    for unit in body.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs().to_string()
}

/// Canonical signature of a captured API call.
#[must_use]
pub fn signature(method: &str, url: &str, body_hash: Option<&str>) -> String {
    let base = format!("{} {}", method.to_ascii_uppercase(), normalize(url));
    match body_hash {
        Some(hash) if !hash.is_empty() => format!("{base} #{hash}"),
        _ => base,
    }
}

fn extension_for_content_type(content_type: &str) -> &'static str {
    if content_type.to_ascii_lowercase().contains("json") {
        ".json"
    } else {
        ".txt"
    }
}

/// Deterministic payload path under the auto-capture namespace.
#[must_use]
pub fn auto_payload_path(
    method: &str,
    url: &str,
    body_hash: Option<&str>,
    content_type: &str,
) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let ext = extension_for_content_type(content_type);
    let body_part = match body_hash {
        Some(hash) if !hash.is_empty() => format!("_body_{hash}"),
        _ => String::new(),
    };
    let raw = format!(
        "{}_{}{}{}{}",
        method.to_ascii_uppercase(),
        host,
        parsed.path(),
        parsed.query().map(|q| format!("?{q}")).unwrap_or_default(),
        body_part
    );
    let mut slug = String::with_capacity(raw.len());
    let mut last_was_filler = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            slug.push(c);
            last_was_filler = false;
        } else if !last_was_filler {
            slug.push('_');
            last_was_filler = true;
        }
    }
    let slug = slug.trim_matches('_').to_string();
    let filename = if slug.ends_with(ext) {
        slug
    } else {
        format!("{slug}{ext}")
    };
    Some(format!("assets/auto/{filename}"))
}

/// One captured API response. Alias keys share the record by `Arc`, never a
/// copy.
#[derive(Debug, Clone)]
pub struct ApiRecord {
    /// Signature the record was captured under.
    pub signature: String,
    pub method: String,
    pub url: String,
    pub body_hash: Option<String>,
    /// Payload path relative to the output root.
    pub local_path: String,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    /// Serialized JSON response body.
    pub body: String,
}

/// Registry of captured API traffic: dedup set, per-signature call counts
/// and the stored records.
#[derive(Debug, Default)]
pub struct ApiRegistry {
    records: DashMap<String, Arc<ApiRecord>>,
    call_counts: DashMap<String, u64>,
}

impl ApiRegistry {
    /// Inspect one observed exchange and capture it when it is a new
    /// programmatic JSON response. Non-JSON and unparsable bodies are
    /// silently excluded; that is expected traffic, not an error.
    pub async fn capture(&self, exchange: &NetworkExchange, out_dir: &Path) {
        let request = &exchange.request;
        if !request.kind.is_programmatic() || !is_supported_method(&request.method) {
            return;
        }

        let hash = request
            .body
            .as_deref()
            .filter(|b| !b.is_empty())
            .map(body_hash);
        let sig = signature(&request.method, &request.url, hash.as_deref());
        *self.call_counts.entry(sig.clone()).or_insert(0) += 1;
        if self.records.contains_key(&sig) {
            return;
        }

        let raw = String::from_utf8_lossy(&exchange.body);
        let raw = raw.trim_start_matches('\u{feff}');
        let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let body = parsed.to_string();

        let Some(local_path) =
            auto_payload_path(&request.method, &request.url, hash.as_deref(), "application/json")
        else {
            return;
        };

        let out_path = out_dir.join(&local_path);
        if let Some(parent) = out_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            debug!("failed to create {}: {e}", parent.display());
            return;
        }
        if let Err(e) = tokio::fs::write(&out_path, &body).await {
            debug!("failed to persist API payload {}: {e}", out_path.display());
            return;
        }

        let mut headers = exchange.response.headers.clone();
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }

        let record = Arc::new(ApiRecord {
            signature: sig.clone(),
            method: request.method.to_ascii_uppercase(),
            url: request.url.clone(),
            body_hash: hash,
            local_path,
            status: exchange.response.status,
            status_text: exchange.response.status_text.clone(),
            headers,
            body,
        });
        if self.records.insert(sig.clone(), record).is_none() {
            info!("captured API {} {}", request.method, request.url);
        }
    }

    #[must_use]
    pub fn records(&self) -> Vec<Arc<ApiRecord>> {
        self.records.iter().map(|entry| entry.value().clone()).collect()
    }

    #[must_use]
    pub fn stored_count(&self) -> usize {
        self.records.len()
    }

    /// Total observed calls across all signatures, for the run summary.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.call_counts.iter().map(|entry| *entry.value()).sum()
    }
}

/// Alias-to-record index. Many keys map to shared `Arc`s of the same record.
#[derive(Debug, Default)]
pub struct AliasTable {
    map: HashMap<String, Arc<ApiRecord>>,
}

impl AliasTable {
    /// Index `record` under every alias form: `METHOD url`, `url`,
    /// `METHOD path?query`, `METHOD path`, `path?query`, `path`, and each of
    /// those again with a ` #bodyhash` suffix when a hash is present.
    pub fn insert_record(&mut self, record: Arc<ApiRecord>) {
        let method = record.method.to_ascii_uppercase();
        let absolute = normalize(&record.url);

        let mut forms = vec![format!("{method} {absolute}"), absolute.clone()];
        if let Ok(parsed) = Url::parse(&absolute) {
            let path = parsed.path().to_string();
            let path_query = match parsed.query() {
                Some(query) => format!("{path}?{query}"),
                None => path.clone(),
            };
            forms.push(format!("{method} {path_query}"));
            forms.push(format!("{method} {path}"));
            forms.push(path_query);
            forms.push(path);
        }

        if let Some(hash) = record.body_hash.as_deref().filter(|h| !h.is_empty()) {
            let hashed: Vec<String> = forms.iter().map(|f| format!("{f} #{hash}")).collect();
            forms.extend(hashed);
        }

        for form in forms {
            self.map.entry(form).or_insert_with(|| Arc::clone(&record));
        }
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&Arc<ApiRecord>> {
        self.map.get(key)
    }

    #[must_use]
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Arc<ApiRecord>)> {
        self.map.iter()
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

/// Payload kind of a manual API store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    Json,
    Script,
}

/// One `--store-api` spec: `[type:]method:url[|headers]|localPath`, headers
/// as a comma-separated `key:value` list. The comma short form
/// `method:url,localPath` is also accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreApiSpec {
    pub kind: StoreKind,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub local_path: String,
}

impl StoreApiSpec {
    /// Parse a spec string. Malformed specs fail fast before the crawl
    /// starts.
    pub fn parse(raw: &str) -> Result<Self> {
        let (type_method_url, headers_str, local_path) = if raw.contains('|') {
            let parts: Vec<&str> = raw.split('|').collect();
            match parts.as_slice() {
                [tmu, local] => (*tmu, "", *local),
                [tmu, headers, local] => (*tmu, *headers, *local),
                _ => bail!("invalid --store-api spec: {raw}"),
            }
        } else {
            let (tmu, local) = raw
                .split_once(',')
                .with_context(|| format!("invalid --store-api spec: {raw}"))?;
            (tmu, "", local)
        };

        let (first, rest) = type_method_url
            .split_once(':')
            .with_context(|| format!("invalid method:url in --store-api spec: {raw}"))?;
        let (kind, method_url) = match first {
            "json" => (StoreKind::Json, rest),
            "script" => (StoreKind::Script, rest),
            _ => (StoreKind::Json, type_method_url),
        };

        let (method, url) = method_url
            .split_once(':')
            .with_context(|| format!("invalid method:url in --store-api spec: {raw}"))?;
        if !is_supported_method(method) {
            bail!("unsupported method {method:?} in --store-api spec: {raw}");
        }
        if url.is_empty() || local_path.is_empty() {
            bail!("invalid --store-api spec: {raw}");
        }

        let mut headers = Vec::new();
        if !headers_str.is_empty() {
            for pair in headers_str.split(',') {
                let (key, value) = pair
                    .split_once(':')
                    .with_context(|| format!("invalid header {pair:?} in --store-api spec"))?;
                if key.is_empty() || value.is_empty() {
                    bail!("invalid header {pair:?} in --store-api spec");
                }
                headers.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            kind,
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            headers,
            local_path: local_path.to_string(),
        })
    }
}

/// A manual store after fetching: raw content plus the parsed JSON for
/// `json`-type specs.
#[derive(Debug, Clone)]
pub struct ManualStore {
    pub spec: StoreApiSpec,
    pub content: String,
    pub parsed: Option<Value>,
}

/// Fetch every manual spec once, outside the crawl loop, persisting each
/// payload at its configured local path. Individual failures are logged and
/// skipped; they pre-seed endpoints the automatic path might miss, so a miss
/// here only narrows the replay table.
pub async fn fetch_manual_stores(
    specs: &[StoreApiSpec],
    backend: &dyn BrowserBackend,
    out_dir: &Path,
    cookie_header: Option<&str>,
) -> Vec<ManualStore> {
    let mut stores = Vec::new();
    for spec in specs {
        let mut request = OutOfBandRequest {
            method: spec.method.clone(),
            url: spec.url.clone(),
            headers: spec.headers.clone(),
        };
        if let Some(cookie) = cookie_header {
            request.headers.push(("Cookie".to_string(), cookie.to_string()));
        }

        let response = match backend.fetch(request).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                debug!(
                    "manual store {} {} returned status {}",
                    spec.method, spec.url, response.status
                );
                continue;
            }
            Err(e) => {
                debug!("manual store {} {} failed: {e:#}", spec.method, spec.url);
                continue;
            }
        };

        let local_rel = spec.local_path.trim_start_matches('/');
        let out_path = out_dir.join(local_rel);
        if let Some(parent) = out_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            debug!("failed to create {}: {e}", parent.display());
            continue;
        }
        if let Err(e) = tokio::fs::write(&out_path, &response.body).await {
            debug!("failed to persist manual store {}: {e}", out_path.display());
            continue;
        }
        info!("stored API {} {} -> {}", spec.method, spec.url, spec.local_path);

        let content = String::from_utf8_lossy(&response.body).into_owned();
        let parsed = match spec.kind {
            StoreKind::Json => serde_json::from_str::<Value>(&content).ok(),
            StoreKind::Script => None,
        };
        stores.push(ManualStore {
            spec: spec.clone(),
            content,
            parsed,
        });
    }
    stores
}

/// Fold a manual JSON store into the alias table so the shim can serve it
/// under the same key space as auto-captured traffic.
pub fn alias_manual_store(table: &mut AliasTable, store: &ManualStore) {
    let Some(parsed) = &store.parsed else { return };
    let record = Arc::new(ApiRecord {
        signature: signature(&store.spec.method, &store.spec.url, None),
        method: store.spec.method.clone(),
        url: store.spec.url.clone(),
        body_hash: None,
        local_path: store.spec.local_path.clone(),
        status: 200,
        status_text: "OK".to_string(),
        headers: HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
        body: parsed.to_string(),
    });
    table.insert_record(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_hash_matches_the_shim_algorithm() {
        // Golden values computed with the JS reference:
        // h = (h << 5) - h + c | 0 over UTF-16 units, Math.abs, String()
        assert_eq!(body_hash(""), "0");
        assert_eq!(body_hash("a"), "97");
        assert_eq!(body_hash("abc"), "96354");
        assert_eq!(body_hash(r#"{"q":"search"}"#), "1653442429");
    }

    #[test]
    fn signatures_normalize_method_and_url() {
        assert_eq!(
            signature("get", "https://x.test/api/data/", None),
            "GET https://x.test/api/data"
        );
        assert_eq!(
            signature("POST", "https://x.test/api/data", Some("42")),
            "POST https://x.test/api/data #42"
        );
    }

    #[test]
    fn auto_payload_paths_are_deterministic() {
        let path = auto_payload_path(
            "GET",
            "https://x.test/api/menu?lang=en",
            None,
            "application/json; charset=utf-8",
        )
        .unwrap();
        assert_eq!(path, "assets/auto/GET_x.test_api_menu_lang_en.json");
        // Stable across calls
        assert_eq!(
            auto_payload_path("GET", "https://x.test/api/menu?lang=en", None, "application/json")
                .as_deref(),
            Some(path.as_str())
        );

        let with_body =
            auto_payload_path("POST", "https://x.test/api/q", Some("77"), "application/json")
                .unwrap();
        assert_eq!(with_body, "assets/auto/POST_x.test_api_q_body_77.json");
    }

    #[test]
    fn alias_expansion_covers_every_granularity() {
        let record = Arc::new(ApiRecord {
            signature: "GET https://x.test/api/data".to_string(),
            method: "GET".to_string(),
            url: "https://x.test/api/data".to_string(),
            body_hash: None,
            local_path: "assets/auto/GET_x.test_api_data.json".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body: "{}".to_string(),
        });

        let mut table = AliasTable::default();
        table.insert_record(Arc::clone(&record));

        for key in [
            "GET https://x.test/api/data",
            "https://x.test/api/data",
            "GET /api/data",
            "/api/data",
        ] {
            let found = table.lookup(key).unwrap_or_else(|| panic!("missing alias {key}"));
            // Aliases share the record, never a copy
            assert!(Arc::ptr_eq(found, &record));
        }
    }

    #[test]
    fn alias_expansion_adds_body_hash_forms() {
        let record = Arc::new(ApiRecord {
            signature: "POST https://x.test/api/q #42".to_string(),
            method: "POST".to_string(),
            url: "https://x.test/api/q?x=1".to_string(),
            body_hash: Some("42".to_string()),
            local_path: "assets/auto/p.json".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body: "{}".to_string(),
        });

        let mut table = AliasTable::default();
        table.insert_record(record);

        assert!(table.lookup("POST /api/q #42").is_some());
        assert!(table.lookup("POST /api/q?x=1 #42").is_some());
        assert!(table.lookup("/api/q #42").is_some());
        assert!(table.lookup("POST /api/q").is_some());
    }

    #[test]
    fn store_spec_full_form_round_trips() {
        let spec = StoreApiSpec::parse(
            "json:POST:https://x.test/api/d|Accept:application/json|/static/d.json",
        )
        .unwrap();
        assert_eq!(spec.kind, StoreKind::Json);
        assert_eq!(spec.method, "POST");
        assert_eq!(spec.url, "https://x.test/api/d");
        assert_eq!(
            spec.headers,
            vec![("Accept".to_string(), "application/json".to_string())]
        );
        assert_eq!(spec.local_path, "/static/d.json");
    }

    #[test]
    fn store_spec_defaults_and_short_forms() {
        let spec = StoreApiSpec::parse("GET:https://x.test/api/d|/static/d.json").unwrap();
        assert_eq!(spec.kind, StoreKind::Json);
        assert!(spec.headers.is_empty());

        let spec = StoreApiSpec::parse("GET:https://x.test/api/d,/static/d.json").unwrap();
        assert_eq!(spec.local_path, "/static/d.json");

        let spec =
            StoreApiSpec::parse("script:GET:https://x.test/api/s.js|/static/s.js").unwrap();
        assert_eq!(spec.kind, StoreKind::Script);
    }

    #[test]
    fn malformed_store_specs_fail_fast() {
        for raw in [
            "nonsense",
            "GET|/static/d.json",
            "FETCH:https://x.test/a|/d.json",
            "GET:https://x.test/a|bad-header|/d.json",
            "GET:,",
        ] {
            assert!(StoreApiSpec::parse(raw).is_err(), "accepted malformed spec {raw}");
        }
    }
}
