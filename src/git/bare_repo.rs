//! Bare Git repository lifecycle management.
//!
//! Repositories live at `<scan_path>/<owner did>/<name>`.  Each carries an
//! ownership marker file holding the owner's DID, which the SSH gate checks
//! before letting anyone near the git transport.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::OWNER_MARKER;

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a new bare Git repository at `path`.
///
/// Creates the directory (and any missing parents) and runs
/// `git init --bare`.  If the directory already exists and contains a valid
/// bare repo (i.e. has a `HEAD` file), this is a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path) -> Result<()> {
    if path.exists() && path.join("HEAD").is_file() {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Ownership marker
// ---------------------------------------------------------------------------

/// Record `owner` as the repository owner.
pub async fn write_owner_marker(repo_path: &Path, owner: &str) -> Result<()> {
    let marker = repo_path.join(OWNER_MARKER);
    tokio::fs::write(&marker, owner)
        .await
        .with_context(|| format!("failed to write owner marker: {}", marker.display()))
}

/// Contents of the ownership marker, byte for byte.
pub fn read_owner_marker(repo_path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(repo_path.join(OWNER_MARKER))
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

/// Recursively remove a bare repository at `path`.
///
/// If the path does not exist, this is a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn remove_repo(path: &Path) -> Result<()> {
    if !path.exists() {
        debug!("path does not exist; nothing to remove");
        return Ok(());
    }

    tokio::fs::remove_dir_all(path)
        .await
        .with_context(|| format!("failed to remove repo directory: {}", path.display()))?;

    debug!("repo directory removed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
