use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use knotserver::auth::{SharedSecret, Verifier};
use knotserver::config::{self, Config};
use knotserver::db::Db;
use knotserver::firehose::{EventSync, Ingester, SyncHandle, SyncSettings, WebsocketSource};
use knotserver::identity::DirectoryClient;
use knotserver::metrics::MetricsRegistry;
use knotserver::rbac::Enforcer;
use knotserver::{http, AppState};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "knotserver", about = "Federated git hosting node")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/knotserver/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listen_addr = state.config.server.listen_addr.clone();
    let app = http::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "internal API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config: Arc<Config> = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = %cli.config,
        hostname = %config.server.hostname,
        dev = config.server.dev,
        "starting knotserver"
    );
    if config.server.dev {
        tracing::warn!("dev mode: internal API signatures are NOT verified");
    }

    // ---- Secret ----
    let secret = SharedSecret::new(config::resolve_secret(&config.server.secret_env)?)
        .context("invalid shared secret")?;
    let verifier = Arc::new(Verifier::new(secret.clone(), config.signature.max_age()));

    // ---- Store and policy ----
    let db = Db::open(&config.database.path)
        .with_context(|| format!("failed to open database {}", config.database.path.display()))?;
    let enforcer = Enforcer::sqlite(db.clone());
    enforcer
        .add_domain(&config.server.hostname)
        .context("failed to seed policy domain")?;

    tokio::fs::create_dir_all(&config.repo.scan_path)
        .await
        .with_context(|| {
            format!(
                "failed to create repository dir: {}",
                config.repo.scan_path.display()
            )
        })?;

    // ---- Event sync ----
    let (sync, reconnect_rx) = SyncHandle::new(config.firehose.collections.clone());
    let known = db.known_dids().context("failed to load known DIDs")?;
    sync.seed_dids(known.iter().cloned());
    if enforcer
        .has_owner(&config.server.hostname)
        .context("failed to read knot owner")?
    {
        sync.mark_initialized();
        tracing::info!(known_dids = known.len(), "knot already initialized");
    } else {
        tracing::info!("knot is waiting for /init");
    }

    let metrics = MetricsRegistry::new();
    let directory = DirectoryClient::new(&config.directory)?;
    let ingester = Ingester::new(
        db.clone(),
        enforcer.clone(),
        config.server.hostname.clone(),
        sync.clone(),
        directory.clone(),
        metrics.clone(),
    );

    let shutdown = CancellationToken::new();
    let event_sync = EventSync::new(
        WebsocketSource::new(config.firehose.url.clone()),
        ingester,
        sync.clone(),
        reconnect_rx,
        db.clone(),
        SyncSettings::from(&config.firehose),
        metrics.clone(),
        shutdown.child_token(),
    );

    // ---- Shared state ----
    let state = AppState {
        config: Arc::clone(&config),
        db,
        enforcer,
        verifier,
        secret,
        metrics,
        sync,
        directory,
    };

    // ---- Spawn tasks ----
    let http_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = run_http_server(state, shutdown.child_token()).await;
            // Take the consumer down with the API.
            shutdown.cancel();
            result
        }
    });
    let sync_handle = tokio::spawn(event_sync.run());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let (http_result, ()) = tokio::try_join!(http_handle, sync_handle)?;
    http_result?;

    tracing::info!("knotserver stopped");
    Ok(())
}
