//! Output directory lifecycle and run artifacts.
//!
//! Preparation refuses implausible deletion targets (root, drive letters,
//! very short resolved paths) so a bad flag can never wipe anything outside
//! an intentional output tree.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::utils::page_filename;

/// Minimum plausible length of a resolved output path. Anything shorter is
/// assumed to be a mistake.
const MIN_PLAUSIBLE_PATH_LEN: usize = 10;

fn is_unsafe_target(resolved: &Path) -> bool {
    let display = resolved.to_string_lossy();
    if resolved.parent().is_none() {
        return true;
    }
    if display == "/" || display == "C:\\" || display == "C:/" {
        return true;
    }
    display.len() < MIN_PLAUSIBLE_PATH_LEN
}

fn ask_confirmation(resolved: &Path) -> Result<bool> {
    eprint!(
        "Output directory \"{}\" will be fully deleted. Continue? [y/N] ",
        resolved.display()
    );
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// Resolve and (re)create the output directory.
///
/// A non-empty directory requires either `force` or an interactive
/// confirmation on a TTY; non-interactive runs fail instead of deleting
/// silently.
pub async fn prepare_output_dir(dir: &Path, force: bool) -> Result<PathBuf> {
    let resolved = std::path::absolute(dir)
        .with_context(|| format!("failed to resolve {}", dir.display()))?;
    if is_unsafe_target(&resolved) {
        bail!(
            "output directory {} seems unsafe, refusing cleanup to prevent collateral damage",
            resolved.display()
        );
    }

    let has_entries = match std::fs::read_dir(&resolved) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    };

    if has_entries {
        if !force {
            if !std::io::stdin().is_terminal() || !std::io::stdout().is_terminal() {
                bail!(
                    "output directory {} is not empty; re-run with --force to delete without prompting",
                    resolved.display()
                );
            }
            let confirmed = {
                let resolved = resolved.clone();
                tokio::task::spawn_blocking(move || ask_confirmation(&resolved))
                    .await
                    .context("confirmation prompt failed")??
            };
            if !confirmed {
                bail!("aborted before deleting output directory");
            }
        }
        tokio::fs::remove_dir_all(&resolved)
            .await
            .with_context(|| format!("failed to delete {}", resolved.display()))?;
    }

    tokio::fs::create_dir_all(&resolved)
        .await
        .with_context(|| format!("failed to create {}", resolved.display()))?;
    tokio::fs::create_dir_all(resolved.join("assets"))
        .await
        .context("failed to create assets directory")?;
    Ok(resolved)
}

/// Write `urls.txt`: one visited URL per line, in first-visit order.
pub async fn write_urls_txt(out_dir: &Path, urls: &[String]) -> Result<()> {
    let path = out_dir.join("urls.txt");
    tokio::fs::write(&path, urls.join("\n"))
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Write `sitemap.xml` mapping each short filename to its original URL.
pub async fn write_sitemap(out_dir: &Path, urls: &[String]) -> Result<()> {
    let mut sitemap = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    sitemap.push_str("<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n");
    for url in urls {
        let short = page_filename(url);
        sitemap.push_str(&format!(
            "  <url>\n    <loc>{short}</loc>\n    <original>{url}</original>\n  </url>\n"
        ));
    }
    sitemap.push_str("</urlset>\n");

    let path = out_dir.join("sitemap.xml");
    tokio::fs::write(&path, sitemap)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Copy the start URL's saved page to `index.html` so the mirror opens from
/// a stable entry point.
pub async fn write_index_html(out_dir: &Path, start_url: &str) -> Result<()> {
    let start_file = out_dir.join(page_filename(start_url));
    let index_file = out_dir.join("index.html");
    if start_file == index_file {
        return Ok(());
    }
    if tokio::fs::try_exists(&start_file).await.unwrap_or(false) {
        tokio::fs::copy(&start_file, &index_file)
            .await
            .with_context(|| format!("failed to copy {}", start_file.display()))?;
        info!("wrote index.html from {}", start_file.display());
    }
    Ok(())
}
