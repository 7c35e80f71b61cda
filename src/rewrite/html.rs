//! HTML reference extraction and rewriting.
//!
//! The rule table covers URL-bearing attributes (`src`, `href`, `data`,
//! `poster`, `formaction`, `data-*`, `xlink:href`), `srcset` lists, inline
//! `style` `url()` occurrences and `<meta http-equiv="refresh">` targets.
//! Comments are stripped and entities decoded before scanning.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::RewriteCtx;
use crate::utils::{decode_entities, has_non_page_extension, normalize, page_filename, relative_from};

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment pattern"));
static URL_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(data-[\w-]+|xlink:href|src|href|data|poster|formaction)=(['"])([^'"\s>]+)(['"])"#)
        .expect("url attribute pattern")
});
static SRCSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)srcset=(['"])([^'"]+)(['"])"#).expect("srcset pattern"));
// No backreferences in the regex crate: one alternation branch per quote
// style, so a double-quoted value may contain single quotes and vice versa.
static STYLE_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)style=(?:"([^"]*)"|'([^']*)')"#).expect("style attribute pattern")
});
static CSS_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*(['"]?)([^'")]+?)(['"]?)\s*\)"#).expect("css url pattern"));
static META_REFRESH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+http-equiv=["']refresh["'][^>]+content=["'][^"']*url=([^"'>\s]+)["']"#)
        .expect("meta refresh pattern")
});

fn is_opaque_ref(reference: &str) -> bool {
    let lowered = reference.trim_start().to_ascii_lowercase();
    lowered.starts_with("data:")
        || lowered.starts_with('#')
        || lowered.starts_with("javascript:")
        || lowered.starts_with("mailto:")
        || lowered.starts_with("tel:")
}

/// Extract every URL-bearing reference from an HTML document, entity-decoded
/// and comment-stripped, in source order.
#[must_use]
pub fn extract_refs(html: &str) -> Vec<String> {
    let stripped = COMMENT.replace_all(html, "");
    let mut refs = Vec::new();

    for caps in URL_ATTR.captures_iter(&stripped) {
        refs.push(decode_entities(&caps[3]));
    }
    for caps in SRCSET.captures_iter(&stripped) {
        for candidate in caps[2].split(',') {
            if let Some(url_part) = candidate.trim().split_whitespace().next() {
                refs.push(decode_entities(url_part));
            }
        }
    }
    for caps in STYLE_ATTR.captures_iter(&stripped) {
        let style = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        for inner in CSS_URL.captures_iter(style) {
            refs.push(decode_entities(inner[2].trim()));
        }
    }
    for caps in META_REFRESH.captures_iter(&stripped) {
        refs.push(decode_entities(&caps[1]));
    }

    refs.retain(|r| !r.is_empty() && !is_opaque_ref(r));
    refs
}

fn resolve_absolute(reference: &str, base: &Url) -> Option<String> {
    let decoded = decode_entities(reference);
    let joined = base.join(decoded.trim()).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    Some(normalize(joined.as_str()))
}

/// Resolve one asset-position reference to a document-relative local path.
fn rewrite_asset_ref(reference: &str, base: &Url, document: &Path, ctx: &RewriteCtx) -> Option<String> {
    let absolute = resolve_absolute(reference, base)?;
    ctx.asset_relative_to(&absolute, document)
}

/// Resolve an href, arbitrating between page and asset targets.
///
/// An href is a page reference unless it carries a non-page extension or
/// matches a registered asset; an extensionless path with both a page entry
/// and a coincidental asset entry resolves to the page. In-scope targets
/// with no entry at all get the deterministic filename so intra-site
/// navigation survives offline.
fn rewrite_href(reference: &str, base: &Url, document: &Path, ctx: &RewriteCtx) -> Option<String> {
    let absolute = resolve_absolute(reference, base)?;
    let parsed = Url::parse(&absolute).ok()?;
    let out_dir = &ctx.config.output_dir;

    if has_non_page_extension(parsed.path()) {
        if let Some(relative) = ctx.asset_relative_to(&absolute, document) {
            return Some(relative);
        }
        // Not captured: assume the deterministic asset location
        if ctx.host_allowed(&absolute) {
            let local = crate::utils::asset_local_path(&absolute, &ctx.config.allowed_hosts)?;
            return Some(relative_from(document, &out_dir.join(local)));
        }
        return None;
    }

    // Page-like: the page registry wins over any coincidental asset entry
    if let Some(filename) = ctx.registries.pages.resolve(&absolute) {
        return Some(relative_from(document, &out_dir.join(filename)));
    }
    if let Some(relative) = ctx.asset_relative_to(&absolute, document) {
        return Some(relative);
    }
    if ctx.host_allowed(&absolute) {
        let assumed = page_filename(&absolute);
        return Some(relative_from(document, &out_dir.join(assumed)));
    }
    None
}

/// Rewrite all references in `html`, resolved against `base_url`, emitting
/// paths relative to `document`.
#[must_use]
pub fn rewrite_html(html: &str, base_url: &str, document: &Path, ctx: &RewriteCtx) -> String {
    let Ok(base) = Url::parse(base_url) else {
        return html.to_string();
    };

    let rewritten = URL_ATTR.replace_all(html, |caps: &Captures<'_>| {
        let attr = &caps[1];
        let quote = &caps[2];
        let reference = &caps[3];
        if is_opaque_ref(reference) {
            return caps[0].to_string();
        }
        let replacement = if attr.eq_ignore_ascii_case("href")
            || attr.eq_ignore_ascii_case("formaction")
        {
            rewrite_href(reference, &base, document, ctx)
        } else {
            rewrite_asset_ref(reference, &base, document, ctx)
        };
        match replacement {
            Some(local) => format!("{attr}={quote}{local}{quote}"),
            None => caps[0].to_string(),
        }
    });

    let rewritten = SRCSET.replace_all(&rewritten, |caps: &Captures<'_>| {
        let quote = &caps[1];
        let list = caps[2]
            .split(',')
            .map(|candidate| {
                let trimmed = candidate.trim();
                let mut parts = trimmed.split_whitespace();
                let Some(url_part) = parts.next() else {
                    return trimmed.to_string();
                };
                let descriptors: Vec<&str> = parts.collect();
                match rewrite_asset_ref(url_part, &base, document, ctx) {
                    Some(local) => {
                        if descriptors.is_empty() {
                            local
                        } else {
                            format!("{local} {}", descriptors.join(" "))
                        }
                    }
                    None => trimmed.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("srcset={quote}{list}{quote}")
    });

    let rewritten = STYLE_ATTR.replace_all(&rewritten, |caps: &Captures<'_>| {
        let (quote, inner_style) = match caps.get(1) {
            Some(m) => ('"', m.as_str()),
            None => ('\'', caps.get(2).map_or("", |m| m.as_str())),
        };
        let style = CSS_URL.replace_all(inner_style, |inner: &Captures<'_>| {
            let reference = inner[2].trim();
            if is_opaque_ref(reference) {
                return inner[0].to_string();
            }
            match rewrite_asset_ref(reference, &base, document, ctx) {
                Some(local) => format!("url({local})"),
                None => inner[0].to_string(),
            }
        });
        format!("style={quote}{style}{quote}")
    });

    let rewritten = META_REFRESH.replace_all(&rewritten, |caps: &Captures<'_>| {
        let reference = &caps[1];
        match rewrite_href(reference, &base, document, ctx) {
            Some(local) => caps[0].replace(reference, &local),
            None => caps[0].to_string(),
        }
    });

    rewritten.into_owned()
}

/// Rewrite one saved page in place: download any in-scope asset references
/// discovered in the markup, then resolve and rewrite everything.
pub async fn process_file(path: &Path, base_url: &str, ctx: &RewriteCtx) -> Result<()> {
    let html = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let base = Url::parse(base_url).with_context(|| format!("invalid base URL {base_url}"))?;
    for reference in extract_refs(&html) {
        let Some(absolute) = resolve_absolute(&reference, &base) else {
            continue;
        };
        let Ok(parsed) = Url::parse(&absolute) else {
            continue;
        };
        if ctx.host_allowed(&absolute) && has_non_page_extension(parsed.path()) {
            ctx.fetcher.download(&absolute).await;
        }
    }

    let rewritten = rewrite_html(&html, base_url, path, ctx);
    if rewritten != html {
        tokio::fs::write(path, rewritten)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_attributes_srcset_style_and_meta_refresh() {
        let html = r#"
            <!-- <img src="/commented.png"> -->
            <img src="/a.png">
            <object data="/movie.swf"></object>
            <use xlink:href="/icons.svg#home"/>
            <img data-lazy-src="/lazy.png">
            <img srcset="/s1.png 1x, /s2.png 2x">
            <div style="background:url('/bg.jpg')"></div>
            <meta http-equiv="refresh" content="0; url=/next">
            <a href="/docs?a=1&amp;b=2">docs</a>
        "#;
        let refs = extract_refs(html);
        assert!(refs.contains(&"/a.png".to_string()));
        assert!(refs.contains(&"/movie.swf".to_string()));
        assert!(refs.contains(&"/icons.svg#home".to_string()));
        assert!(refs.contains(&"/lazy.png".to_string()));
        assert!(refs.contains(&"/s1.png".to_string()));
        assert!(refs.contains(&"/s2.png".to_string()));
        assert!(refs.contains(&"/bg.jpg".to_string()));
        assert!(refs.contains(&"/next".to_string()));
        // Entities decoded
        assert!(refs.contains(&"/docs?a=1&b=2".to_string()));
        // Comments stripped
        assert!(!refs.iter().any(|r| r.contains("commented")));
    }

    #[test]
    fn opaque_refs_are_ignored() {
        let refs = extract_refs(
            r##"<a href="#top">x</a><img src="data:image/png;base64,AAA"><a href="mailto:a@b.c">m</a>"##,
        );
        assert!(refs.is_empty());
    }
}
