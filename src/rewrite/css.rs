//! CSS reference extraction and rewriting.
//!
//! Covers every `url()` occurrence, which includes `@import` and
//! `@font-face` sources. `data:` URIs are left alone. Emitted paths are
//! relative to the stylesheet itself, which is how the browser resolves
//! them.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::RewriteCtx;
use crate::utils::normalize;

static CSS_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*(['"]?)([^'")]+?)(['"]?)\s*\)"#).expect("css url pattern"));

fn resolve(reference: &str, base: &Url) -> Option<String> {
    if reference.trim_start().to_ascii_lowercase().starts_with("data:") {
        return None;
    }
    let joined = base.join(reference.trim()).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    Some(normalize(joined.as_str()))
}

/// Rewrite `url()` references in a CSS string. Returns the rewritten text.
#[must_use]
pub fn rewrite_css(css: &str, base_url: &str, document: &Path, ctx: &RewriteCtx) -> String {
    let Ok(base) = Url::parse(base_url) else {
        return css.to_string();
    };
    CSS_URL
        .replace_all(css, |caps: &Captures<'_>| {
            let quote = &caps[1];
            let reference = caps[2].trim();
            let Some(absolute) = resolve(reference, &base) else {
                return caps[0].to_string();
            };
            match ctx.asset_relative_to(&absolute, document) {
                Some(local) => format!("url({quote}{local}{quote})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Process one saved stylesheet: download referenced in-scope assets, then
/// rewrite the file in place.
pub async fn process_file(path: &Path, base_url: &str, ctx: &RewriteCtx) -> Result<()> {
    let css = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let base = Url::parse(base_url).with_context(|| format!("invalid base URL {base_url}"))?;
    for caps in CSS_URL.captures_iter(&css) {
        if let Some(absolute) = resolve(caps[2].trim(), &base)
            && ctx.host_allowed(&absolute)
        {
            ctx.fetcher.download(&absolute).await;
        }
    }

    let rewritten = rewrite_css(&css, base_url, path, ctx);
    if rewritten != css {
        tokio::fs::write(path, rewritten)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
