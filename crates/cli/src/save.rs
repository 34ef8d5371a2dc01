//! Persisting received files.
//!
//! The peer controls the announced file name, so it is never trusted:
//! directory components are stripped and anything unusable falls back to
//! a generated name. Collisions get a `name(1).ext` style suffix.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const MAX_FILENAME_LEN: usize = 255;
const FALLBACK_NAME: &str = "download.bin";

/// Write a fully received file into `dir`, creating it if needed.
/// Returns the path actually written.
pub(crate) fn save_received(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let dest = unique_path(dir, &sanitize_filename(name));
    fs::write(&dest, bytes)
        .with_context(|| format!("Failed to write {}", dest.display()))?;

    info!(name, size = bytes.len(), dest = %dest.display(), "Received file saved");
    Ok(dest)
}

/// Reduce a peer-supplied name to a safe basename. Unlike an upload
/// endpoint there is nothing to reject here, so unusable names degrade
/// to a fallback instead of failing the transfer.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let name = name.replace('\0', "");

    // Strip any directory components, tolerating both separator styles.
    let basename = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if basename.is_empty() || basename == "." || basename == ".." {
        return FALLBACK_NAME.to_string();
    }

    // Dotfiles would be invisible in the downloads folder
    let visible = basename.trim_start_matches('.');
    if visible.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let mut out = visible.to_string();
    if out.len() > MAX_FILENAME_LEN {
        let mut cut = MAX_FILENAME_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

/// Pick a non-existing path in `dir` by appending (1), (2), ... to the
/// stem when needed.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = Path::new(name).extension().and_then(|e| e.to_str());

    for i in 1..=999 {
        let numbered = match ext {
            Some(e) => format!("{stem}({i}).{e}"),
            None => format!("{stem}({i})"),
        };
        let candidate = dir.join(&numbered);
        if !candidate.exists() {
            return candidate;
        }
    }

    let id = uuid::Uuid::new_v4();
    dir.join(match ext {
        Some(e) => format!("{stem}-{id}.{e}"),
        None => format!("{stem}-{id}"),
    })
}

/// Default downloads directory: ~/Downloads, falling back to /tmp when
/// HOME is unset.
pub(crate) fn default_downloads_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
