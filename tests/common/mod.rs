use std::net::SocketAddr;
use std::sync::Arc;

use knotserver::auth::{SharedSecret, SignedClient, Verifier};
use knotserver::config::parse_config;
use knotserver::db::Db;
use knotserver::firehose::SyncHandle;
use knotserver::identity::DirectoryClient;
use knotserver::metrics::MetricsRegistry;
use knotserver::rbac::Enforcer;
use knotserver::AppState;
use tokio::net::TcpListener;

pub const HOSTNAME: &str = "knot.example.com";
pub const SECRET: &str = "integration-secret";

pub struct TestServer {
    pub url: String,
    #[allow(dead_code)]
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: SignedClient,
    /// Holds the repository root alive for the test's duration.
    pub scan_dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let scan_dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "server:\n  hostname: {HOSTNAME}\n\
             repo:\n  scan_path: {}\n\
             directory:\n  endpoint: http://127.0.0.1:9\n  timeout_secs: 1\n",
            scan_dir.path().display()
        );
        let config = Arc::new(parse_config(&yaml).unwrap());

        let db = Db::in_memory().unwrap();
        let enforcer = Enforcer::sqlite(db.clone());
        enforcer.add_domain(HOSTNAME).unwrap();
        let secret = SharedSecret::new(SECRET).unwrap();
        // The consumer is not running; reconnect signals are simply dropped.
        let (sync, _reconnect_rx) = SyncHandle::new(config.firehose.collections.clone());

        let state = AppState {
            verifier: Arc::new(Verifier::new(secret.clone(), config.signature.max_age())),
            directory: DirectoryClient::new(&config.directory).unwrap(),
            config,
            db,
            enforcer,
            secret: secret.clone(),
            metrics: MetricsRegistry::new(),
            sync,
        };
        let app = knotserver::http::create_router(Arc::new(state.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give server a moment to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let url = format!("http://{addr}");
        let client = SignedClient::new(&url, secret).unwrap();
        Self {
            url,
            addr,
            state,
            client,
            scan_dir,
        }
    }

    /// A client holding a different secret.
    #[allow(dead_code)]
    pub fn impostor(&self) -> SignedClient {
        SignedClient::new(&self.url, SharedSecret::new("wrong-secret").unwrap()).unwrap()
    }
}

/// Whether a `git` binary is on PATH.
#[allow(dead_code)]
pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
