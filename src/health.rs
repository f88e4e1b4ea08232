use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::db::Db;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub initialized: bool,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub repos: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    /// `detail` is served unauthenticated; keep it coarse.
    fn unhealthy(detail: &'static str) -> Self {
        Self {
            ok: false,
            detail: Some(detail.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(db: &Db) -> CheckResult {
    let db = db.clone();
    match tokio::task::spawn_blocking(move || db.ping()).await {
        Ok(Ok(())) => CheckResult::healthy(),
        Ok(Err(e)) => {
            warn!(error = %e, "store health check failed");
            CheckResult::unhealthy("store unavailable")
        }
        Err(e) => {
            warn!(error = %e, "store health check task failed");
            CheckResult::unhealthy("store unavailable")
        }
    }
}

async fn check_repos(scan_path: &Path) -> CheckResult {
    match tokio::fs::metadata(scan_path).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(),
        Ok(_) => {
            warn!(path = %scan_path.display(), "repository path is not a directory");
            CheckResult::unhealthy("repository path unavailable")
        }
        Err(e) => {
            warn!(path = %scan_path.display(), error = %e, "repository path check failed");
            CheckResult::unhealthy("repository path unavailable")
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.store.ok {
        // Every decision depends on the store.
        HealthStatus::Unhealthy
    } else if !checks.repos.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (store, repos) = tokio::join!(
        check_store(&state.db),
        check_repos(&state.config.repo.scan_path),
    );

    let checks = HealthChecks { store, repos };
    let status = aggregate_status(&checks);
    let body = HealthResponse {
        status,
        initialized: state.sync.is_initialized(),
        checks,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
