//! Bare repository management and git transport execution.
//!
//! All operations shell out to the `git` binary using
//! `tokio::process::Command`.

pub mod bare_repo;
pub mod commands;

use std::path::{Path, PathBuf};

pub use bare_repo::{init_bare_repo, read_owner_marker, remove_repo, write_owner_marker};
pub use commands::run_transport;

/// File inside each repository naming its owner DID.
pub const OWNER_MARKER: &str = "did";

/// A single path component that cannot escape its parent.
pub fn is_safe_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains(['/', '\\', '\0'])
}

/// `<base>/<owner>/<name>`, or `None` if either part is not a safe component.
pub fn repo_dir(base: &Path, owner: &str, name: &str) -> Option<PathBuf> {
    (is_safe_component(owner) && is_safe_component(name)).then(|| base.join(owner).join(name))
}
