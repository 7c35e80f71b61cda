//! URL and path manipulation shared by every phase of a mirror run.
//!
//! The same canonical forms are used at capture time and at replay time, so
//! everything that turns a URL into a set key or a local file name lives here.

use std::borrow::Cow;
use std::path::Path;

use url::Url;

/// Canonical form used for all set-membership tests.
///
/// Strips the fragment, collapses a non-root trailing slash and keeps the
/// query string. Unparseable input is returned unchanged so callers can treat
/// the result as an opaque key.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let path = url.path();
    if path != "/" && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }
    url.set_fragment(None);
    url.to_string()
}

/// Deterministic relative file name for a crawled page.
///
/// The URL path is kept as directory structure, an empty path becomes
/// `index`, characters outside `[A-Za-z0-9._/-]` are replaced with `_`, and
/// `.html` is appended when the final segment carries no extension. The
/// result never starts with a slash.
#[must_use]
pub fn page_filename(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return "unknown.html".to_string();
    };
    let mut path_part = url.path().trim_end_matches('/').to_string();
    if path_part.is_empty() {
        path_part = "/index".to_string();
    }

    let mut filename: String = path_part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    filename = filename.trim_start_matches('/').to_string();

    let last_segment = filename.rsplit('/').next().unwrap_or("");
    if !last_segment.contains('.') {
        filename.push_str(".html");
    }
    filename
}

/// Deterministic local path (relative to the output root) for an asset URL.
///
/// Returns `None` for URLs outside the allowed host set. Leading `assets/`
/// segments in the source path are stripped so the assets root is never
/// nested within itself.
#[must_use]
pub fn asset_local_path(raw: &str, allowed_hosts: &[String]) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    if !allowed_hosts.iter().any(|h| h == host) {
        return None;
    }

    let mut name = page_filename(raw);
    name = name.trim_start_matches('/').to_string();
    loop {
        let lowered = name.to_ascii_lowercase();
        if let Some(rest) = lowered.strip_prefix("assets/") {
            name = name[name.len() - rest.len()..].to_string();
        } else {
            break;
        }
    }
    Some(format!("assets/{name}"))
}

/// Whether a URL path names something that cannot be an HTML page.
#[must_use]
pub fn has_non_page_extension(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            ext != "html" && ext != "htm"
        }
        _ => false,
    }
}

/// Relative path from the directory of `from_file` to `to_file`,
/// slash-normalized and always anchored with `./` or `../`.
#[must_use]
pub fn relative_from(from_file: &Path, to_file: &Path) -> String {
    let from_dir = from_file.parent().unwrap_or_else(|| Path::new(""));
    let rel = pathdiff::diff_paths(to_file, from_dir)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    if rel.is_empty() {
        return "./".to_string();
    }
    if rel.starts_with('.') {
        rel
    } else {
        format!("./{rel}")
    }
}

/// Decode HTML entities in an extracted reference before resolving it.
#[must_use]
pub fn decode_entities(raw: &str) -> String {
    match html_escape::decode_html_entities(raw) {
        Cow::Borrowed(s) => s.to_string(),
        Cow::Owned(s) => s,
    }
}
