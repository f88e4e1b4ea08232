//! Git transport commands run on behalf of an SSH session.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Run `git <subcommand> <repo_path>` with this process's stdio, so the SSH
/// client talks to git directly.  Returns git's exit status.
///
/// `subcommand` is the bare name (`upload-pack`, not `git-upload-pack`).
#[instrument(fields(repo = %repo_path.display()))]
pub async fn run_transport(subcommand: &str, repo_path: &Path) -> Result<ExitStatus> {
    let status = Command::new("git")
        .arg(subcommand)
        .arg(repo_path)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to spawn git {subcommand}"))?;

    debug!(%status, "git transport exited");
    Ok(status)
}
