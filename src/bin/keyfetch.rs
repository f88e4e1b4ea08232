//! sshd `AuthorizedKeysCommand`: prints an `authorized_keys` file that sends
//! every registered key through `repoguard`.
//!
//! ```text
//! Match User git
//!   AuthorizedKeysCommand /usr/local/bin/keyfetch -internal-api http://localhost:5444
//!   AuthorizedKeysCommandUser nobody
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use knotserver::auth::{SharedSecret, SignedClient};
use knotserver::config::resolve_secret;
use knotserver::guard::authorized_keys::format_authorized_keys;
use knotserver::guard::normalize_flags;

#[derive(Parser, Debug)]
#[command(name = "keyfetch", about = "Emit authorized_keys for the knot's git user")]
struct Args {
    /// Base URL of the knot's internal API.
    #[arg(long, default_value = "http://localhost:5444")]
    internal_api: String,

    /// Path to the repoguard binary.
    #[arg(long, default_value = "/home/git/repoguard")]
    repoguard_path: PathBuf,

    /// Directory holding the repositories.
    #[arg(long, default_value = "/home/git")]
    git_dir: PathBuf,

    /// Audit log passed on to repoguard.
    #[arg(long, default_value = "/home/git/log")]
    log_path: PathBuf,

    /// Environment variable holding the shared secret.
    #[arg(long, default_value = "KNOT_SERVER_SECRET")]
    secret_env: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse_from(normalize_flags(std::env::args_os()));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let secret = SharedSecret::new(resolve_secret(&args.secret_env)?)
        .context("invalid shared secret")?;
    let client = SignedClient::new(&args.internal_api, secret)?;
    let keys = client.keys().await.context("error fetching keys")?;
    tracing::debug!(count = keys.len(), "fetched keys");

    let output = format_authorized_keys(&args.repoguard_path, &args.git_dir, &args.log_path, &keys);
    std::io::stdout()
        .lock()
        .write_all(output.as_bytes())
        .context("failed to write authorized keys")?;
    Ok(())
}
