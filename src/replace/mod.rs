//! Ordered literal substitution over the finished output tree.
//!
//! Rules are plain substrings, never regex, applied in the order given to
//! every HTML/CSS/JS file. This is the last pass of a run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One `from::to` literal replacement pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub from: String,
    pub to: String,
}

impl ReplacementRule {
    /// Parse a `from::to` spec. Fails fast on a missing separator.
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((from, to)) = raw.split_once("::") else {
            bail!("each --replace must be in the format 'from::to', got: {raw}");
        };
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Counters reported in the run summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceStats {
    pub files_scanned: usize,
    pub files_changed: usize,
    pub total_hits: usize,
}

fn is_replaceable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "html" | "htm" | "css" | "js"
            )
        })
}

/// Apply all rules, in order, to one file's contents. Returns the rewritten
/// text and the number of occurrences replaced.
#[must_use]
pub fn apply_rules(content: &str, rules: &[ReplacementRule]) -> (String, usize) {
    let mut text = content.to_string();
    let mut hits = 0;
    for rule in rules {
        if rule.from.is_empty() {
            continue;
        }
        hits += text.matches(&rule.from).count();
        text = text.replace(&rule.from, &rule.to);
    }
    (text, hits)
}

/// Walk the output tree and apply every rule to each HTML/CSS/JS file.
pub async fn apply_replacements(out_dir: &Path, rules: &[ReplacementRule]) -> Result<ReplaceStats> {
    let mut stats = ReplaceStats::default();
    if rules.is_empty() {
        return Ok(stats);
    }

    let mut stack: Vec<PathBuf> = vec![out_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to iterate {}", dir.display()))?
        {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !is_replaceable(&path) {
                continue;
            }

            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let (replaced, hits) = apply_rules(&content, rules);
            stats.files_scanned += 1;
            stats.total_hits += hits;
            if replaced != content {
                stats.files_changed += 1;
                tokio::fs::write(&path, replaced)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
        }
    }

    info!(
        "replacements applied: {} files scanned, {} changed, {} hits",
        stats.files_scanned, stats.files_changed, stats.total_hits
    );
    Ok(stats)
}
