//! JavaScript reference rewriting.
//!
//! A heuristic scan, not a parser: absolute and root-relative string
//! literals that look like static-asset paths are downloaded and swapped for
//! a call to the runtime asset helper the replay shim installs. API-style
//! paths are excluded so the shim keeps serving them from the capture table.
//! The helper indirection is required because one script is shared by pages
//! at different directory depths, so no single relative path would be
//! correct.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::RewriteCtx;
use crate::utils::{has_non_page_extension, normalize};

static ABSOLUTE_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(["'`])((?:https?:)?//[^"'`\s]+)(["'`])"#).expect("absolute literal pattern")
});
static ROOT_RELATIVE_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(["'`])(/[^"'`\s]+)(["'`])"#).expect("root-relative literal pattern")
});

/// Resolve a candidate literal to a normalized absolute URL when it is an
/// in-scope static-asset path.
fn resolve_asset_candidate(reference: &str, base: &Url, ctx: &RewriteCtx) -> Option<String> {
    if reference.starts_with("data:") {
        return None;
    }
    let joined = base.join(reference).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    if ctx.config.is_api_path(joined.path()) {
        return None;
    }
    if !has_non_page_extension(joined.path()) {
        return None;
    }
    let absolute = normalize(joined.as_str());
    ctx.host_allowed(&absolute).then_some(absolute)
}

fn helper_call(local: &str, quote: &str) -> String {
    let mut relative = local.replace('\\', "/");
    relative = relative.trim_start_matches("./").trim_start_matches('/').to_string();
    if let Some(rest) = relative.to_ascii_lowercase().strip_prefix("assets/") {
        relative = relative[relative.len() - rest.len()..].to_string();
    }
    format!("window.__WEBSTILL_ASSET__({quote}{relative}{quote})")
}

/// Rewrite asset-path string literals to runtime helper calls.
#[must_use]
pub fn rewrite_js(js: &str, base_url: &str, ctx: &RewriteCtx) -> String {
    let Ok(base) = Url::parse(base_url) else {
        return js.to_string();
    };

    let rewrite = |caps: &Captures<'_>| -> String {
        let quote = &caps[1];
        let reference = &caps[2];
        let Some(absolute) = resolve_asset_candidate(reference, &base, ctx) else {
            return caps[0].to_string();
        };
        match ctx.registries.assets.lookup(&absolute) {
            Some(local) => helper_call(&local, quote),
            None => caps[0].to_string(),
        }
    };

    let pass_one = ABSOLUTE_LITERAL.replace_all(js, rewrite).into_owned();
    ROOT_RELATIVE_LITERAL
        .replace_all(&pass_one, rewrite)
        .into_owned()
}

/// Process one saved script: download referenced in-scope assets, then
/// rewrite the file in place.
pub async fn process_file(path: &Path, base_url: &str, ctx: &RewriteCtx) -> Result<()> {
    let js = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let base = Url::parse(base_url).with_context(|| format!("invalid base URL {base_url}"))?;
    for regex in [&*ABSOLUTE_LITERAL, &*ROOT_RELATIVE_LITERAL] {
        for caps in regex.captures_iter(&js) {
            if let Some(absolute) = resolve_asset_candidate(&caps[2], &base, ctx) {
                ctx.fetcher.download(&absolute).await;
            }
        }
    }

    let rewritten = rewrite_js(&js, base_url, ctx);
    if rewritten != js {
        tokio::fs::write(path, rewritten)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
