//! SSH command gate, run by sshd once per connection as the forced command
//! of every authorized key.
//!
//! ```text
//! Start ──► ParseCommand ──► Validate ──► Exec ──► Done
//!   │            │              │           │
//!   └────────────┴──────────────┴───────────┴──► Denied (exit 1)
//! ```
//!
//! Every step leaves a line in the [`AuditLog`].  Nothing is executed unless
//! the repository's ownership marker names the authenticated principal.

pub mod audit;
pub mod authorized_keys;
pub mod command;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, ExitStatus};

use async_trait::async_trait;
use thiserror::Error;

pub use audit::AuditLog;
pub use command::{parse_command, resolve_repo_path, verify_owner, GitSubcommand, ParsedCommand};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("no user specified")]
    NoPrincipal,
    #[error("interactive shell access is not available")]
    InteractiveShell,
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("command not allowed: {0}")]
    DisallowedCommand(String),
    #[error("invalid repository path: {0}")]
    InvalidRepoPath(String),
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("cannot determine owner of {repo}: {reason}")]
    OwnershipUnknown { repo: String, reason: String },
    #[error("{principal} does not own {repo}")]
    IdentityMismatch { principal: String, repo: String },
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("audit log write failed: {0}")]
    Audit(#[source] std::io::Error),
}

impl GuardError {
    /// What the SSH client gets to see.  Ownership details stay in the log.
    pub fn client_message(&self) -> String {
        match self {
            Self::RepoNotFound(_) | Self::OwnershipUnknown { .. } | Self::IdentityMismatch { .. } => {
                "access denied".to_string()
            }
            Self::Audit(_) => "access denied: internal error".to_string(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Exec seam
// ---------------------------------------------------------------------------

/// Runs an admitted git command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: GitSubcommand, repo_path: &Path) -> anyhow::Result<ExitStatus>;
}

/// Hands the connection's stdio to the real `git` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitRunner;

#[async_trait]
impl CommandRunner for GitRunner {
    async fn run(&self, command: GitSubcommand, repo_path: &Path) -> anyhow::Result<ExitStatus> {
        crate::git::run_transport(command.git_subcommand(), repo_path).await
    }
}

// ---------------------------------------------------------------------------
// Gatekeeper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// DID the SSH key was registered to.
    pub principal: String,
    pub base_dir: PathBuf,
    /// Client address from `SSH_CONNECTION`, for the log only.
    pub client: String,
}

#[derive(Debug)]
pub enum Outcome {
    Done,
    Denied(GuardError),
}

impl Outcome {
    /// Process status: 0 after a completed transfer, 1 on any denial.
    pub fn status(&self) -> u8 {
        match self {
            Self::Done => 0,
            Self::Denied(_) => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.status())
    }
}

pub struct Gatekeeper<R> {
    config: GuardConfig,
    audit: AuditLog,
    runner: R,
}

impl<R: CommandRunner> Gatekeeper<R> {
    pub fn new(config: GuardConfig, audit: AuditLog, runner: R) -> Self {
        Self {
            config,
            audit,
            runner,
        }
    }

    /// Drive one connection to completion.  `original_command` is
    /// `SSH_ORIGINAL_COMMAND`, absent for an interactive login.
    pub async fn run(&self, original_command: Option<&str>) -> Outcome {
        match self.admit_and_exec(original_command.unwrap_or_default()).await {
            Ok(()) => Outcome::Done,
            Err(err) => {
                if let Err(e) = self.audit.record(
                    "Access denied",
                    &[
                        ("error", &err.to_string()),
                        ("user", &self.config.principal),
                        ("client", &self.config.client),
                    ],
                ) {
                    tracing::error!(error = %e, "failed to record denial");
                }
                Outcome::Denied(err)
            }
        }
    }

    fn log(&self, event: &str, fields: &[(&str, &str)]) -> Result<(), GuardError> {
        self.audit.record(event, fields).map_err(GuardError::Audit)
    }

    async fn admit_and_exec(&self, raw: &str) -> Result<(), GuardError> {
        let principal = self.config.principal.as_str();
        let client = self.config.client.as_str();

        // Start
        if principal.is_empty() {
            return Err(GuardError::NoPrincipal);
        }
        self.log(
            "Connection attempt",
            &[("user", principal), ("command", raw), ("client", client)],
        )?;

        // ParseCommand
        if raw.trim().is_empty() {
            return Err(GuardError::InteractiveShell);
        }
        let parsed = parse_command(raw)?;
        let repo = parsed.repo();
        self.log(
            "Command parsed",
            &[("command", parsed.command.as_str()), ("repo", &repo)],
        )?;

        // Validate
        let repo_path = resolve_repo_path(&self.config.base_dir, &parsed.owner, &parsed.name)?;
        verify_owner(&repo_path, principal, &repo)?;
        let full_path = repo_path.display().to_string();
        self.log(
            "Processing command",
            &[
                ("user", principal),
                ("command", parsed.command.as_str()),
                ("repo", &repo),
                ("fullPath", &full_path),
                ("client", client),
            ],
        )?;

        // Exec
        let status = self
            .runner
            .run(parsed.command, &repo_path)
            .await
            .map_err(|e| GuardError::CommandFailed(format!("{e:#}")))?;
        if !status.success() {
            return Err(GuardError::CommandFailed(status.to_string()));
        }

        // Done. The transfer already happened, so a log failure here is
        // reported but does not change the outcome.
        if let Err(e) = self.log(
            "Command completed",
            &[
                ("user", principal),
                ("command", parsed.command.as_str()),
                ("repo", &repo),
                ("success", "true"),
            ],
        ) {
            tracing::error!(error = %e, "failed to record completion");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process environment helpers
// ---------------------------------------------------------------------------

/// Rewrite single-dash long flags (`-user`) to the double-dash form.
pub fn normalize_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let is_single_dash_long = arg.to_str().is_some_and(|s| {
                s.len() > 2
                    && s.starts_with('-')
                    && !s.starts_with("--")
                    && s[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            });
            if i > 0 && is_single_dash_long {
                let mut long = OsString::from("-");
                long.push(&arg);
                long
            } else {
                arg
            }
        })
        .collect()
}

/// First field of `SSH_CONNECTION` (`client_ip client_port server_ip server_port`).
pub fn client_address(ssh_connection: Option<&str>) -> String {
    ssh_connection
        .and_then(|c| c.split_whitespace().next())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records what would have been executed instead of running git.
    #[derive(Clone, Default)]
    struct FakeRunner {
        calls: Arc<Mutex<Vec<(GitSubcommand, PathBuf)>>>,
        exit_code: i32,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, command: GitSubcommand, repo_path: &Path) -> anyhow::Result<ExitStatus> {
            self.calls
                .lock()
                .unwrap()
                .push((command, repo_path.to_path_buf()));
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                Ok(ExitStatus::from_raw(self.exit_code << 8))
            }
            #[cfg(not(unix))]
            {
                use std::os::windows::process::ExitStatusExt;
                Ok(ExitStatus::from_raw(self.exit_code as u32))
            }
        }
    }

    struct Setup {
        base: tempfile::TempDir,
        log_dir: tempfile::TempDir,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                base: tempfile::tempdir().unwrap(),
                log_dir: tempfile::tempdir().unwrap(),
            }
        }

        fn repo(&self, owner: &str, name: &str, marker: &str) -> PathBuf {
            let path = self.base.path().join(owner).join(name);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("did"), marker).unwrap();
            path
        }

        fn gate(&self, principal: &str, runner: FakeRunner) -> Gatekeeper<FakeRunner> {
            let audit = AuditLog::open(&self.log_dir.path().join("audit.log")).unwrap();
            Gatekeeper::new(
                GuardConfig {
                    principal: principal.to_string(),
                    base_dir: self.base.path().to_path_buf(),
                    client: "203.0.113.7".to_string(),
                },
                audit,
                runner,
            )
        }

        fn log(&self) -> String {
            std::fs::read_to_string(self.log_dir.path().join("audit.log")).unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn owner_is_admitted() {
        let setup = Setup::new();
        let repo = setup.repo("did:abc", "repo", "did:abc");
        let runner = FakeRunner::default();
        let gate = setup.gate("did:abc", runner.clone());

        let outcome = gate.run(Some("git-upload-pack 'did:abc/repo'")).await;
        assert!(matches!(outcome, Outcome::Done), "{outcome:?}");

        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, GitSubcommand::UploadPack);
        assert_eq!(calls[0].1, repo.canonicalize().unwrap());

        let log = setup.log();
        assert!(log.contains("event=\"Connection attempt\""));
        assert!(log.contains("event=\"Processing command\""));
        assert!(log.contains("event=\"Command completed\""));
        assert!(!log.contains("Access denied"));
    }

    #[tokio::test]
    async fn marker_mismatch_denies_without_exec() {
        let setup = Setup::new();
        setup.repo("did:abc", "repo", "did:xyz");
        let runner = FakeRunner::default();
        let gate = setup.gate("did:abc", runner.clone());

        let outcome = gate.run(Some("git-upload-pack 'did:abc/repo'")).await;
        assert!(matches!(
            outcome,
            Outcome::Denied(GuardError::IdentityMismatch { .. })
        ));
        assert!(runner.calls.lock().unwrap().is_empty());
        assert!(setup.log().contains("event=\"Access denied\""));
    }

    #[tokio::test]
    async fn other_users_repo_is_denied() {
        let setup = Setup::new();
        setup.repo("did:abc", "repo", "did:abc");
        let runner = FakeRunner::default();
        let gate = setup.gate("did:mallory", runner.clone());

        let outcome = gate.run(Some("git-receive-pack 'did:abc/repo'")).await;
        assert!(matches!(outcome, Outcome::Denied(_)));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_principal_and_shell_are_denied() {
        let setup = Setup::new();
        let runner = FakeRunner::default();

        let outcome = setup.gate("", runner.clone()).run(Some("git-upload-pack 'a/b'")).await;
        assert!(matches!(outcome, Outcome::Denied(GuardError::NoPrincipal)));

        let outcome = setup.gate("did:abc", runner.clone()).run(None).await;
        assert!(matches!(outcome, Outcome::Denied(GuardError::InteractiveShell)));

        assert!(runner.calls.lock().unwrap().is_empty());
        assert_eq!(setup.log().matches("event=\"Access denied\"").count(), 2);
    }

    #[tokio::test]
    async fn failing_git_is_a_denial() {
        let setup = Setup::new();
        setup.repo("did:abc", "repo", "did:abc");
        let runner = FakeRunner {
            exit_code: 128,
            ..FakeRunner::default()
        };
        let gate = setup.gate("did:abc", runner.clone());

        let outcome = gate.run(Some("git-receive-pack 'did:abc/repo'")).await;
        assert!(matches!(outcome, Outcome::Denied(GuardError::CommandFailed(_))));
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
        assert!(!setup.log().contains("Command completed"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn unwritable_audit_log_denies() {
        let setup = Setup::new();
        setup.repo("did:abc", "repo", "did:abc");
        let runner = FakeRunner::default();
        // Every write to /dev/full fails with ENOSPC.
        let audit = AuditLog::open(Path::new("/dev/full")).unwrap();
        let gate = Gatekeeper::new(
            GuardConfig {
                principal: "did:abc".to_string(),
                base_dir: setup.base.path().to_path_buf(),
                client: "203.0.113.7".to_string(),
            },
            audit,
            runner.clone(),
        );

        let outcome = gate.run(Some("git-upload-pack 'did:abc/repo'")).await;
        assert!(matches!(outcome, Outcome::Denied(GuardError::Audit(_))), "{outcome:?}");
        assert_ne!(outcome.status(), 0);
        assert!(runner.calls.lock().unwrap().is_empty());
        if let Outcome::Denied(err) = &outcome {
            assert_eq!(err.client_message(), "access denied: internal error");
        }
    }

    #[test]
    fn client_message_hides_ownership() {
        let err = GuardError::IdentityMismatch {
            principal: "did:a".into(),
            repo: "did:b/r".into(),
        };
        assert_eq!(err.client_message(), "access denied");
        assert_eq!(
            GuardError::DisallowedCommand("sh".into()).client_message(),
            "command not allowed: sh"
        );
    }

    #[test]
    fn single_dash_flags_are_normalized() {
        let args = ["repoguard", "-user", "did:abc", "-base-dir=/srv", "--log-path", "/x", "-h"]
            .map(OsString::from);
        let normalized = normalize_flags(args);
        assert_eq!(
            normalized,
            ["repoguard", "--user", "did:abc", "--base-dir=/srv", "--log-path", "/x", "-h"]
                .map(OsString::from)
        );
    }

    #[test]
    fn client_address_is_first_field() {
        assert_eq!(client_address(Some("203.0.113.7 52144 10.0.0.1 22")), "203.0.113.7");
        assert_eq!(client_address(None), "");
    }
}
