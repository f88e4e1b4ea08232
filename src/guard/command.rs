use std::fmt;
use std::path::{Path, PathBuf};

use super::GuardError;
use crate::git::{self, is_safe_component};

/// Git transport commands the gate will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitSubcommand {
    ReceivePack,
    UploadPack,
    UploadArchive,
}

impl GitSubcommand {
    /// Name as it appears in `SSH_ORIGINAL_COMMAND`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReceivePack => "git-receive-pack",
            Self::UploadPack => "git-upload-pack",
            Self::UploadArchive => "git-upload-archive",
        }
    }

    /// Name as a `git` subcommand.
    pub fn git_subcommand(self) -> &'static str {
        match self {
            Self::ReceivePack => "receive-pack",
            Self::UploadPack => "upload-pack",
            Self::UploadArchive => "upload-archive",
        }
    }

    fn parse(name: &str) -> Result<Self, GuardError> {
        match name {
            "git-receive-pack" => Ok(Self::ReceivePack),
            "git-upload-pack" => Ok(Self::UploadPack),
            "git-upload-archive" => Ok(Self::UploadArchive),
            other => Err(GuardError::DisallowedCommand(other.to_string())),
        }
    }
}

impl fmt::Display for GitSubcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: GitSubcommand,
    pub owner: String,
    pub name: String,
}

impl ParsedCommand {
    pub fn repo(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Parse `<subcommand> '<owner>/<repo>'`.
///
/// The argument must be one single-quoted token; a leading `/` inside the
/// quotes is tolerated.  Anything else is refused rather than guessed at.
pub fn parse_command(raw: &str) -> Result<ParsedCommand, GuardError> {
    let raw = raw.trim();
    let (name, arg) = raw
        .split_once(' ')
        .ok_or_else(|| GuardError::MalformedCommand("expected <command> '<owner>/<repo>'".into()))?;
    let command = GitSubcommand::parse(name)?;

    let quoted = arg
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .filter(|a| !a.contains('\''))
        .ok_or_else(|| {
            GuardError::MalformedCommand("repository must be a single quoted argument".into())
        })?;
    let path = quoted.strip_prefix('/').unwrap_or(quoted);

    let (owner, repo) = path
        .split_once('/')
        .ok_or_else(|| GuardError::MalformedCommand("repository must be <owner>/<repo>".into()))?;
    if !is_safe_component(owner) || !is_safe_component(repo) {
        return Err(GuardError::InvalidRepoPath(path.to_string()));
    }

    Ok(ParsedCommand {
        command,
        owner: owner.to_string(),
        name: repo.to_string(),
    })
}

/// Canonical path of `owner/name` under `base_dir`.  The repository must
/// exist and must not resolve outside the base directory.
pub fn resolve_repo_path(base_dir: &Path, owner: &str, name: &str) -> Result<PathBuf, GuardError> {
    let joined = git::repo_dir(base_dir, owner, name)
        .ok_or_else(|| GuardError::InvalidRepoPath(format!("{owner}/{name}")))?;
    let base = base_dir
        .canonicalize()
        .map_err(|e| GuardError::InvalidRepoPath(format!("base dir {}: {e}", base_dir.display())))?;
    let resolved = joined
        .canonicalize()
        .map_err(|_| GuardError::RepoNotFound(format!("{owner}/{name}")))?;
    if !resolved.starts_with(&base) {
        return Err(GuardError::InvalidRepoPath(format!(
            "{owner}/{name} resolves outside the base directory"
        )));
    }
    Ok(resolved)
}

/// The ownership marker of `repo_path` must hold exactly `principal`.
pub fn verify_owner(repo_path: &Path, principal: &str, repo: &str) -> Result<(), GuardError> {
    let owner = git::read_owner_marker(repo_path).map_err(|e| GuardError::OwnershipUnknown {
        repo: repo.to_string(),
        reason: e.to_string(),
    })?;
    if owner != principal {
        return Err(GuardError::IdentityMismatch {
            principal: principal.to_string(),
            repo: repo.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_command ────────────────────────────────────────────────

    #[test]
    fn test_parse_allowed_commands() {
        let parsed = parse_command("git-upload-pack 'did:plc:abc/repo'").unwrap();
        assert_eq!(parsed.command, GitSubcommand::UploadPack);
        assert_eq!(parsed.owner, "did:plc:abc");
        assert_eq!(parsed.name, "repo");
        assert_eq!(parsed.repo(), "did:plc:abc/repo");

        assert_eq!(
            parse_command("git-receive-pack '/did:plc:abc/repo'").unwrap().command,
            GitSubcommand::ReceivePack
        );
        assert_eq!(
            parse_command("git-upload-archive 'did:plc:abc/repo'").unwrap().command,
            GitSubcommand::UploadArchive
        );
    }

    #[test]
    fn test_parse_rejects_other_commands() {
        assert!(matches!(
            parse_command("rm 'did:plc:abc/repo'"),
            Err(GuardError::DisallowedCommand(c)) if c == "rm"
        ));
        assert!(matches!(
            parse_command("git-upload-pack.sh 'did:plc:abc/repo'"),
            Err(GuardError::DisallowedCommand(_))
        ));
    }

    #[test]
    fn test_parse_rejects_loose_syntax() {
        for raw in [
            "git-upload-pack",
            "git-upload-pack did:plc:abc/repo",
            "git-upload-pack 'did:plc:abc/repo",
            "git-upload-pack  'did:plc:abc/repo'",
            "git-upload-pack 'did:plc:abc/repo' extra",
            "git-upload-pack 'did:plc:abc/repo'; rm -rf /",
            "git-upload-pack 'a'b/c'",
            "git-upload-pack 'did:plc:abc'",
        ] {
            assert!(
                matches!(parse_command(raw), Err(GuardError::MalformedCommand(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_traversal() {
        for raw in [
            "git-upload-pack '../etc/passwd'",
            "git-upload-pack 'did:plc:abc/..'",
            "git-upload-pack 'did:plc:abc/repo/../../x'",
            "git-upload-pack '//did:plc:abc/repo'",
            "git-upload-pack 'did:plc:abc/re\\po'",
        ] {
            assert!(
                matches!(parse_command(raw), Err(GuardError::InvalidRepoPath(_))),
                "{raw}"
            );
        }
    }

    // ── resolve_repo_path / verify_owner ─────────────────────────────

    #[test]
    fn test_resolve_existing_repo() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("did:plc:abc/repo")).unwrap();

        let path = resolve_repo_path(base.path(), "did:plc:abc", "repo").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("did:plc:abc/repo"));
    }

    #[test]
    fn test_resolve_missing_repo() {
        let base = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_repo_path(base.path(), "did:plc:abc", "nope"),
            Err(GuardError::RepoNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("did:plc:abc")).unwrap();
        std::os::unix::fs::symlink(outside.path(), base.path().join("did:plc:abc/repo")).unwrap();

        assert!(matches!(
            resolve_repo_path(base.path(), "did:plc:abc", "repo"),
            Err(GuardError::InvalidRepoPath(_))
        ));
    }

    #[test]
    fn test_verify_owner_is_exact() {
        let repo = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify_owner(repo.path(), "did:plc:abc", "did:plc:abc/repo"),
            Err(GuardError::OwnershipUnknown { .. })
        ));

        std::fs::write(repo.path().join("did"), "did:plc:abc").unwrap();
        verify_owner(repo.path(), "did:plc:abc", "did:plc:abc/repo").unwrap();
        assert!(matches!(
            verify_owner(repo.path(), "did:plc:abcd", "did:plc:abc/repo"),
            Err(GuardError::IdentityMismatch { .. })
        ));

        std::fs::write(repo.path().join("did"), "did:plc:abc\n").unwrap();
        assert!(matches!(
            verify_owner(repo.path(), "did:plc:abc", "did:plc:abc/repo"),
            Err(GuardError::IdentityMismatch { .. })
        ));
    }
}
