//! `authorized_keys` lines that force every key through the gate.

use std::fmt::Write as _;
use std::path::Path;

use tracing::warn;

use crate::db::{check_public_key, is_valid_did, PublicKey};

const KEY_OPTIONS: &str = "no-port-forwarding,no-X11-forwarding,no-agent-forwarding,no-pty";

/// One forced-command line per registered key, each newline-terminated.
/// Keys or DIDs that could break out of their line or the `command=` quoting
/// are left out.
pub fn format_authorized_keys(
    repoguard_path: &Path,
    base_dir: &Path,
    log_path: &Path,
    keys: &[PublicKey],
) -> String {
    let mut out = String::new();
    for key in keys {
        if !is_valid_did(&key.did) {
            warn!(did = ?key.did, name = %key.name, "skipping key with malformed DID");
            continue;
        }
        let Ok(public_key) = check_public_key(&key.key) else {
            warn!(did = %key.did, name = %key.name, "skipping malformed key");
            continue;
        };
        // Writing to a String cannot fail.
        let _ = writeln!(
            out,
            "command=\"{} -base-dir {} -user {} -log-path {}\",{KEY_OPTIONS} {}",
            repoguard_path.display(),
            base_dir.display(),
            key.did,
            log_path.display(),
            public_key,
        );
    }
    out
}
