use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::firehose::{KNOT_MEMBER_NSID, PUBLIC_KEY_NSID};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub signature: SignatureConfig,
    #[serde(default)]
    pub firehose: FirehoseConfig,
    pub directory: DirectoryConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the internal API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Public hostname of this knot.  Doubles as the policy domain.
    pub hostname: String,
    /// Name of the environment variable holding the shared HMAC secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    /// Skip signature verification on the internal API.  Development only.
    #[serde(default)]
    pub dev: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:5444".to_string()
}

fn default_secret_env() -> String {
    "KNOT_SERVER_SECRET".to_string()
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/knotserver/knotserver.db")
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Root under which repositories live as `<did>/<name>`.
    #[serde(default = "default_scan_path")]
    pub scan_path: PathBuf,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            scan_path: default_scan_path(),
        }
    }
}

fn default_scan_path() -> PathBuf {
    PathBuf::from("/home/git")
}

// ---------------------------------------------------------------------------
// Request signatures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SignatureConfig {
    /// Maximum accepted age of `X-Timestamp`, in seconds.  `0` disables the
    /// freshness check entirely.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl SignatureConfig {
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
        }
    }
}

fn default_max_age_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Firehose
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FirehoseConfig {
    /// Websocket subscribe endpoint of the event stream.
    #[serde(default = "default_firehose_url")]
    pub url: String,
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    /// A persisted cursor older than this is discarded on startup.
    #[serde(default = "default_max_cursor_age_secs")]
    pub max_cursor_age_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl FirehoseConfig {
    pub fn max_cursor_age(&self) -> Duration {
        Duration::from_secs(self.max_cursor_age_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            url: default_firehose_url(),
            collections: default_collections(),
            max_cursor_age_secs: default_max_cursor_age_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

fn default_firehose_url() -> String {
    "wss://jetstream1.us-west.bsky.network/subscribe".to_string()
}

fn default_collections() -> Vec<String> {
    vec![PUBLIC_KEY_NSID.to_string(), KNOT_MEMBER_NSID.to_string()]
}

fn default_max_cursor_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_reconnect_delay_secs() -> u64 {
    2
}

// ---------------------------------------------------------------------------
// Directory service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL serving newline-separated public keys at `<endpoint>/<did>`.
    pub endpoint: String,
    #[serde(default = "default_key_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_key_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_key_cache_ttl() -> u64 {
    300
}

fn default_key_cache_capacity() -> u64 {
    1024
}

fn default_request_timeout() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate YAML config text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid config YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.server.hostname.trim().is_empty(),
        "server.hostname must not be empty"
    );
    anyhow::ensure!(
        !config.server.secret_env.is_empty(),
        "server.secret_env must name an environment variable"
    );
    anyhow::ensure!(
        !config.firehose.collections.is_empty(),
        "firehose.collections must list at least one collection"
    );
    anyhow::ensure!(
        config.firehose.reconnect_delay_secs > 0,
        "firehose.reconnect_delay_secs must be positive"
    );
    anyhow::ensure!(
        config.directory.cache_capacity > 0,
        "directory.cache_capacity must be positive"
    );
    Ok(())
}

/// Read the shared HMAC secret from the environment variable named in config.
pub fn resolve_secret(env_name: &str) -> Result<String> {
    let secret = std::env::var(env_name)
        .with_context(|| format!("shared secret env var {env_name} is not set"))?;
    anyhow::ensure!(
        !secret.is_empty(),
        "shared secret env var {env_name} is empty"
    );
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  hostname: knot.example.com
directory:
  endpoint: https://directory.example.com/keys
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:5444");
        assert_eq!(config.server.secret_env, "KNOT_SERVER_SECRET");
        assert!(!config.server.dev);
        assert_eq!(config.repo.scan_path, PathBuf::from("/home/git"));
        assert_eq!(config.signature.max_age(), Some(Duration::from_secs(60)));
        assert_eq!(
            config.firehose.collections,
            vec![PUBLIC_KEY_NSID.to_string(), KNOT_MEMBER_NSID.to_string()]
        );
        assert_eq!(config.firehose.max_cursor_age(), Duration::from_secs(604_800));
        assert_eq!(config.directory.cache_ttl_secs, 300);
    }

    #[test]
    fn zero_max_age_disables_freshness() {
        let yaml = format!("{MINIMAL}signature:\n  max_age_secs: 0\n");
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.signature.max_age(), None);
    }

    #[test]
    fn empty_hostname_is_rejected() {
        let yaml = r#"
server:
  hostname: ""
directory:
  endpoint: https://directory.example.com/keys
"#;
        let err = parse_config(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("hostname"));
    }

    #[test]
    fn missing_secret_env_is_an_error() {
        let err = resolve_secret("KNOTSERVER_TEST_SECRET_THAT_IS_NEVER_SET").unwrap_err();
        assert!(err.to_string().contains("not set"));
    }
}
