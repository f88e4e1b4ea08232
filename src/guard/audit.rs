//! Append-only audit log of the SSH gate.
//!
//! One line per event, `timestamp="…" event="…"` followed by `key="value"`
//! pairs in the order given.  Values are quoted and escaped so a line can
//! always be split back into its fields.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{SecondsFormat, Utc};

#[derive(Debug)]
pub struct AuditLog {
    file: File,
}

impl AuditLog {
    /// Open `path` for appending, creating it with mode 0600 if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        Ok(Self {
            file: options.open(path)?,
        })
    }

    /// Append one line.  The whole line goes out in a single write so
    /// concurrent gate processes never interleave within a line.
    pub fn record(&self, event: &str, fields: &[(&str, &str)]) -> io::Result<()> {
        let line = format_line(&Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true), event, fields);
        (&self.file).write_all(line.as_bytes())
    }
}

fn format_line(timestamp: &str, event: &str, fields: &[(&str, &str)]) -> String {
    let mut line = format!("timestamp={timestamp:?} event={event:?}");
    for (key, value) in fields {
        line.push_str(&format!(" {key}={value:?}"));
    }
    line.push('\n');
    line
}
