//! Forced SSH command for the `git` user.
//!
//! sshd runs this for every connection, with the authenticated key's DID in
//! `-user` and the requested command in `SSH_ORIGINAL_COMMAND`.  See
//! [`knotserver::guard`] for the admission rules.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use knotserver::guard::{
    client_address, normalize_flags, AuditLog, Gatekeeper, GitRunner, GuardConfig, Outcome,
};

#[derive(Parser, Debug)]
#[command(name = "repoguard", about = "Gate git transport over SSH")]
struct Args {
    /// DID the SSH key is registered to.
    #[arg(long, default_value = "")]
    user: String,

    /// Directory holding `<did>/<repo>` repositories.
    #[arg(long, default_value = "/home/git")]
    base_dir: PathBuf,

    /// Append-only audit log.
    #[arg(long, default_value = "/var/log/git-wrapper.log")]
    log_path: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse_from(normalize_flags(std::env::args_os()));

    // stdout belongs to git; diagnostics go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let audit = match AuditLog::open(&args.log_path) {
        Ok(audit) => audit,
        Err(e) => {
            eprintln!("error: cannot open log {}: {e}", args.log_path.display());
            return ExitCode::from(1);
        }
    };

    let config = GuardConfig {
        principal: args.user,
        base_dir: args.base_dir,
        client: client_address(std::env::var("SSH_CONNECTION").ok().as_deref()),
    };
    let original_command = std::env::var("SSH_ORIGINAL_COMMAND").ok();

    let outcome = Gatekeeper::new(config, audit, GitRunner)
        .run(original_command.as_deref())
        .await;

    if let Outcome::Denied(err) = &outcome {
        eprintln!("error: {}", err.client_message());
    }
    outcome.exit_code()
}
