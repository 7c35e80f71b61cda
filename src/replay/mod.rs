//! Offline replay shim.
//!
//! Every saved page gets an injected script that overrides `window.fetch`
//! and serves captured API responses from an embedded table. Lookups use the
//! same signature and alias rules as capture; on a total miss the shim
//! synthesizes a 404 JSON error instead of touching the network, since the
//! mirror must never depend on a live origin.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use crate::capture::api::{AliasTable, ApiRecord, ManualStore, StoreKind};
use crate::registry::SavedPage;
use crate::rewrite::RewriteCtx;
use crate::utils::{asset_local_path, decode_entities, has_non_page_extension, page_filename, relative_from};

/// JS template for the fetch shim. Placeholders are substituted rather than
/// using `format!` so the braces in the script stay literal.
const SHIM_TEMPLATE: &str = r#"<script>(function(){
  window.__WEBSTILL_ROOT_BASE__ = @ROOT_BASE@;
  window.__WEBSTILL_ASSET_BASE__ = @ASSET_BASE@;
  window.__WEBSTILL_PATH__ = function(siteRelativePath){
    var base = String(window.__WEBSTILL_ROOT_BASE__ || '.').replace(/[/]+$/, '');
    var rel = String(siteRelativePath || '').replace(/^[/]+/, '');
    if (!rel) return base || '.';
    if (!base || base === '.') return './' + rel;
    return base + '/' + rel;
  };
  window.__WEBSTILL_ASSET__ = function(assetRelativePath){
    var base = String(window.__WEBSTILL_ASSET_BASE__ || './assets').replace(/[/]+$/, '');
    var rel = String(assetRelativePath || '').replace(/^[/]+/, '').replace(/^assets[/]/i, '');
    if (!rel) return base || window.__WEBSTILL_PATH__('assets');
    if (!base) return window.__WEBSTILL_PATH__('assets/' + rel);
    return base + '/' + rel;
  };

  window.__WEBSTILL_RESOURCES__ = @RESOURCE_DATA@;
  var data = window.__WEBSTILL_RESOURCES__ || {};

  function resolveAbsolute(rawInput){
    var url = typeof rawInput === 'string' ? rawInput : (rawInput && rawInput.url ? rawInput.url : String(rawInput));
    try { return new URL(url, window.location.href).toString(); } catch (e) { return null; }
  }

  function resolveMethod(input, init){
    if (init && init.method) return String(init.method).toUpperCase();
    if (input && input.method) return String(input.method).toUpperCase();
    return 'GET';
  }

  function requestBodyHash(input, init){
    var body = null;
    if (init && Object.prototype.hasOwnProperty.call(init, 'body')) body = init.body;
    else if (input && Object.prototype.hasOwnProperty.call(input, 'body')) body = input.body;
    if (body == null) return '';
    var str = typeof body === 'string' ? body : String(body);
    var hash = 0;
    for (var i = 0; i < str.length; i++) {
      hash = ((hash << 5) - hash + str.charCodeAt(i)) | 0;
    }
    return String(Math.abs(hash));
  }

  function allKeys(abs, method, bodyHash){
    try {
      var parsed = new URL(abs);
      var bare = [
        method + ' ' + abs,
        method + ' ' + (parsed.pathname + parsed.search),
        method + ' ' + parsed.pathname,
        abs,
        parsed.pathname + parsed.search,
        parsed.pathname
      ];
      if (!bodyHash) return bare;
      var hashed = bare.map(function(k){ return k + ' #' + bodyHash; });
      return hashed.concat(bare);
    } catch (e) {
      var fallback = abs ? [method + ' ' + abs, abs] : [];
      if (bodyHash && abs) fallback.unshift(method + ' ' + abs + ' #' + bodyHash);
      return fallback;
    }
  }

  function canonicalizeKey(k){
    var key = String(k || '').trim();
    var m = key.match(/^([A-Za-z]+)\s+(.*)$/);
    var method = m ? m[1].toLowerCase() : '';
    var rest = m ? m[2] : key;
    var hashPart = '';
    var hashIdx = rest.indexOf(' #');
    if (hashIdx !== -1) {
      hashPart = rest.slice(hashIdx);
      rest = rest.slice(0, hashIdx);
    }
    try {
      var u = new URL(rest, window.location.href);
      rest = u.pathname + u.search;
    } catch (e) {}
    rest = rest.replace(/\/{2,}/g, '/');
    if (rest.length > 1) rest = rest.replace(/\/+$/, '');
    return (method ? method + ' ' : '') + rest + hashPart;
  }

  function resolveKey(rawInput, init){
    var abs = resolveAbsolute(rawInput);
    if (!abs) return null;
    var method = resolveMethod(rawInput, init);
    var bodyHash = requestBodyHash(rawInput, init);
    var keys = allKeys(abs, method, bodyHash);
    for (var i = 0; i < keys.length; i++) {
      if (Object.prototype.hasOwnProperty.call(data, keys[i])) return keys[i];
    }
    var wanted = keys.map(canonicalizeKey);
    for (var prop in data) {
      if (!Object.prototype.hasOwnProperty.call(data, prop)) continue;
      var canon = canonicalizeKey(prop);
      for (var j = 0; j < wanted.length; j++) {
        if (canon === wanted[j]) return prop;
      }
    }
    return null;
  }

  window.fetch = function(input, init){
    var requestedUrl = String(typeof input === 'string' ? input : (input && input.url ? input.url : input));
    var requestedMethod = resolveMethod(input, init);
    var key = resolveKey(input, init);
    if (key) {
      var stored = data[key] || {};
      var status = typeof stored.status === 'number' ? stored.status : 200;
      var statusText = typeof stored.statusText === 'string' ? stored.statusText : 'OK';
      var headers = stored.headers || { 'content-type': 'application/json' };
      var body = typeof stored.body === 'string' ? stored.body : JSON.stringify(stored.body || {});
      console.log('[webstill fetch] serving "' + requestedUrl + '" from "' + (stored._localpath || '(memory)') + '" (' + requestedMethod + ')');
      return Promise.resolve(new Response(body, { status: status, statusText: statusText, headers: headers }));
    }

    console.warn('[webstill fetch] miss "' + requestedUrl + '" (' + requestedMethod + ')');
    var missPayload = JSON.stringify({ error: 'Offline fetch miss', url: requestedUrl });
    return Promise.resolve(new Response(missPayload, {
      status: 404,
      statusText: 'Not Found',
      headers: { 'content-type': 'application/json' }
    }));
  };
})();</script>
"#;

/// Build the per-page fetch shim from an already serialized resource table
/// and the page-relative base paths.
#[must_use]
pub fn build_shim_script(serialized_table: &str, root_base: &str, asset_base: &str) -> String {
    SHIM_TEMPLATE
        .replace("@ROOT_BASE@", &json!(root_base).to_string())
        .replace("@ASSET_BASE@", &json!(asset_base).to_string())
        .replace("@RESOURCE_DATA@", serialized_table)
}

/// Escape a serialized JSON blob for embedding inside a `<script>` element.
#[must_use]
pub fn escape_for_inline_script(serialized: &str) -> String {
    serialized
        .replace("</", "<\\/")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// Rewrite one string value from a captured JSON body to a document-relative
/// local path, when it is an in-scope URL. API-style paths stay untouched so
/// the shim resolves them through the alias table at runtime.
fn rewrite_json_url(raw: &str, page_path: &Path, ctx: &RewriteCtx) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let decoded = decode_entities(trimmed);

    let absolute = if decoded.starts_with("http://") || decoded.starts_with("https://") {
        Url::parse(&decoded).ok()?
    } else if decoded.starts_with('/') {
        Url::parse(&ctx.config.start_url).ok()?.join(&decoded).ok()?
    } else {
        return None;
    };

    let host = absolute.host_str()?;
    if !ctx.config.allowed_hosts.iter().any(|h| h == host) {
        return None;
    }
    let path = absolute.path();
    if ctx.config.is_api_path(path) {
        return None;
    }

    let out_dir = &ctx.config.output_dir;
    if has_non_page_extension(path) || ctx.config.is_forced_asset_path(path) {
        let local = asset_local_path(absolute.as_str(), &ctx.config.allowed_hosts)?;
        return Some(relative_from(page_path, &out_dir.join(local)));
    }

    let filename = ctx
        .registries
        .pages
        .resolve(absolute.as_str())
        .unwrap_or_else(|| page_filename(absolute.as_str()));
    Some(relative_from(page_path, &out_dir.join(filename)))
}

/// Recursively rewrite every URL-shaped string in a JSON value so nested
/// links in API payloads also resolve offline.
#[must_use]
pub fn rewrite_json_urls(value: &Value, page_path: &Path, ctx: &RewriteCtx) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| rewrite_json_urls(item, page_path, ctx))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_json_urls(v, page_path, ctx)))
                .collect(),
        ),
        Value::String(s) => match rewrite_json_url(s, page_path, ctx) {
            Some(rewritten) => Value::String(rewritten),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Shim-table entry for one record, with its JSON body rewritten for the
/// given page location.
fn record_shim_value(record: &ApiRecord, page_path: &Path, ctx: &RewriteCtx) -> Value {
    let is_json = record
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .is_some_and(|(_, v)| v.to_ascii_lowercase().contains("json"));

    let body = if is_json {
        match serde_json::from_str::<Value>(&record.body) {
            Ok(parsed) => rewrite_json_urls(&parsed, page_path, ctx).to_string(),
            Err(_) => record.body.clone(),
        }
    } else {
        record.body.clone()
    };

    json!({
        "status": record.status,
        "statusText": record.status_text,
        "headers": record.headers,
        "body": body,
        "_localpath": record.local_path,
    })
}

fn data_var_name(local_path: &str) -> String {
    let base = local_path
        .rsplit('/')
        .next()
        .unwrap_or(local_path)
        .trim_end_matches(".json");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("__{cleaned}_DATA__")
}

/// Inject the replay shim (and manual-store payloads) into every saved page.
///
/// Relative targets differ per document location, so each page gets its own
/// rewritten copy of the resource table; rewrite results are cached per
/// record within a page so alias fan-out costs nothing extra.
pub async fn inject_into_pages(
    ctx: &RewriteCtx,
    pages: &[SavedPage],
    table: &AliasTable,
    manual_stores: &[ManualStore],
) -> Result<()> {
    info!(
        "injecting replay data into {} pages ({} alias keys)",
        pages.len(),
        table.len()
    );

    for page in pages {
        let mut per_record: HashMap<usize, Value> = HashMap::new();
        let mut resource_data = serde_json::Map::new();
        for (key, record) in table.entries() {
            let ptr = Arc::as_ptr(record) as usize;
            let value = per_record
                .entry(ptr)
                .or_insert_with(|| record_shim_value(record, &page.path, ctx));
            resource_data.insert(key.clone(), value.clone());
        }

        let serialized = escape_for_inline_script(&Value::Object(resource_data).to_string());
        let out_dir = &ctx.config.output_dir;
        let root_base = relative_from(&page.path, out_dir)
            .trim_end_matches('/')
            .to_string();
        let asset_base = relative_from(&page.path, &out_dir.join("assets"))
            .trim_end_matches('/')
            .to_string();

        let mut scripts = build_shim_script(&serialized, &root_base, &asset_base);
        for store in manual_stores {
            match store.spec.kind {
                StoreKind::Script => {
                    scripts.push_str(&format!("<script>{}</script>\n", store.content));
                }
                StoreKind::Json => {
                    let Some(parsed) = &store.parsed else { continue };
                    let rewritten = rewrite_json_urls(parsed, &page.path, ctx);
                    let payload = escape_for_inline_script(&rewritten.to_string())
                        .replace('`', "\\`");
                    scripts.push_str(&format!(
                        "<script>window.{} = JSON.parse(`{}`);</script>\n",
                        data_var_name(&store.spec.local_path),
                        payload
                    ));
                }
            }
        }

        let html = tokio::fs::read_to_string(&page.path)
            .await
            .with_context(|| format!("failed to read {}", page.path.display()))?;
        let Some(head_end) = html.find("</head>") else {
            debug!("no </head> in {}, skipping injection", page.path.display());
            continue;
        };
        let mut injected = String::with_capacity(html.len() + scripts.len());
        injected.push_str(&html[..head_end]);
        injected.push_str(&scripts);
        injected.push_str(&html[head_end..]);

        tokio::fs::write(&page.path, injected)
            .await
            .with_context(|| format!("failed to write {}", page.path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shim_script_embeds_bases_and_table() {
        let script = build_shim_script(r#"{"GET /api/x":{"status":200}}"#, ".", "./assets");
        assert!(script.contains(r#"window.__WEBSTILL_ROOT_BASE__ = ".""#));
        assert!(script.contains(r#"window.__WEBSTILL_ASSET_BASE__ = "./assets""#));
        assert!(script.contains(r#""GET /api/x""#));
        assert!(script.contains("canonicalizeKey"));
        assert!(script.contains("status: 404"));
    }

    #[test]
    fn inline_script_escaping() {
        let escaped = escape_for_inline_script(r#"{"body":"</script><b>"}"#);
        assert_eq!(escaped, r#"{"body":"<\/script><b>"}"#);
    }

    #[test]
    fn data_var_names_are_valid_identifiers() {
        assert_eq!(data_var_name("/static/menu-data.json"), "__MENU_DATA_DATA__");
        assert_eq!(data_var_name("feed.json"), "__FEED_DATA__");
    }
}
