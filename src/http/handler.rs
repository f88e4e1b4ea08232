//! Internal API of a knot, called by the directory service.
//!
//! Routes (all signed, see [`verify_signature`]):
//! - `GET    /push-allowed?user=&repo=`          - push authorization check
//! - `POST   /init`                              - claim an unowned knot
//! - `PUT    /repo/new`                          - create a bare repository
//! - `DELETE /repo`                              - delete a repository
//! - `PUT    /member/add`                        - add a knot member
//! - `POST   /{did}/{name}/collaborator/add`     - add a repo collaborator
//! - `GET    /keys`, `PUT /keys`                 - list / register SSH keys
//! - `GET    /health`                            - liveness for the directory
//!
//! Unsigned operational routes:
//! - `GET  /healthz`                             - store health check
//! - `GET  /metrics`                             - Prometheus metrics

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::auth::middleware::verify_signature;
use crate::auth::signature::SIGNATURE_HEADER;
use crate::auth::signer::INIT_ACK;
use crate::db::{check_public_key, is_valid_did, StoreError};
use crate::metrics::Decision;
use crate::rbac::action;
use crate::AppState;

/// Name recorded for keys submitted with `/init`.
const INIT_KEY_NAME: &str = "default";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let signed = Router::new()
        .route("/push-allowed", get(handle_push_allowed))
        .route("/init", post(handle_init))
        .route("/repo/new", put(handle_new_repo))
        .route("/repo", delete(handle_delete_repo))
        .route("/member/add", put(handle_add_member))
        .route("/{did}/{name}/collaborator/add", post(handle_add_collaborator))
        .route("/keys", get(handle_list_keys).put(handle_add_key))
        .route("/health", get(handle_health))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_signature));

    Router::new()
        .merge(signed)
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PushAllowedQuery {
    user: Option<String>,
    repo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InitRequest {
    did: String,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RepoRequest {
    did: String,
    name: String,
    /// Who is asking, when not the owner.
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberRequest {
    did: String,
}

#[derive(Debug, Deserialize)]
struct KeyRequest {
    did: String,
    name: String,
    key: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /push-allowed?user=<did>&repo=<did>/<name>`
///
/// 204 when `user` holds `repo:push` on `repo`, 403 otherwise.
async fn handle_push_allowed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PushAllowedQuery>,
) -> Result<StatusCode, AppError> {
    let (Some(user), Some(repo)) = (
        query.user.filter(|u| !u.is_empty()),
        query.repo.filter(|r| !r.is_empty()),
    ) else {
        return Err(AppError::BadRequest("user and repo are required".into()));
    };

    authorize(&state, &user, &repo, action::REPO_PUSH)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /init`
///
/// Makes `did` the owner of a knot that has none yet.  The response carries
/// a signature over a fixed message so the caller can tell the knot shares
/// its secret.
#[instrument(skip(state, body), fields(did = %body.did))]
async fn handle_init(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitRequest>,
) -> Result<Response, AppError> {
    if !state.sync.claim_init() {
        return Err(AppError::Conflict("knot is already initialized".into()));
    }
    if let Err(e) = initialize(&state, &body) {
        state.sync.release_init();
        return Err(e);
    }

    let ack = state
        .secret
        .sign_message(INIT_ACK)
        .context("failed to sign init acknowledgement")?;
    info!(keys = body.keys.len(), "knot initialized");
    Ok((StatusCode::NO_CONTENT, [(SIGNATURE_HEADER, ack)]).into_response())
}

fn initialize(state: &AppState, body: &InitRequest) -> Result<(), AppError> {
    if !is_valid_did(&body.did) {
        return Err(AppError::BadRequest("did must be a DID".into()));
    }
    let keys: Vec<&str> = body
        .keys
        .iter()
        .filter(|k| !k.trim().is_empty())
        .map(|k| check_public_key(k))
        .collect::<Result<_, _>>()?;
    let domain = state.domain();

    state.enforcer.add_domain(domain)?;
    state.db.add_did(&body.did)?;
    for key in keys {
        state
            .db
            .add_public_key(&body.did, INIT_KEY_NAME, key, None)?;
    }
    state.enforcer.add_owner(domain, &body.did)?;

    state.sync.add_dids([body.did.clone()]);
    state.sync.mark_initialized();
    Ok(())
}

/// `PUT /repo/new`
///
/// Creates `<scan_path>/<did>/<name>` as a bare repository owned by `did`.
#[instrument(skip(state, body), fields(did = %body.did, name = %body.name))]
async fn handle_new_repo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RepoRequest>,
) -> Result<StatusCode, AppError> {
    let domain = state.domain().to_string();
    authorize(&state, &body.did, &domain, action::REPO_CREATE)?;

    let path = crate::git::repo_dir(&state.config.repo.scan_path, &body.did, &body.name)
        .ok_or_else(|| AppError::BadRequest("invalid repository name".into()))?;
    let repo = format!("{}/{}", body.did, body.name);
    crate::rbac::enforcer::check_repo_name(&repo)?;

    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(AppError::Conflict(format!("{repo} already exists")));
    }

    crate::git::init_bare_repo(&path).await?;
    crate::git::write_owner_marker(&path, &body.did).await?;

    if let Err(e) = state.enforcer.add_repo(&body.did, &domain, &repo) {
        // Without grants nobody could use or delete it.
        if let Err(cleanup) = crate::git::remove_repo(&path).await {
            warn!(error = %cleanup, "failed to remove repo after policy error");
        }
        return Err(e.into());
    }

    info!(%repo, path = %path.display(), "repository created");
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /repo`
///
/// Removes the repository directory and every grant on it.  `actor`
/// defaults to the owner.
#[instrument(skip(state, body), fields(did = %body.did, name = %body.name))]
async fn handle_delete_repo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RepoRequest>,
) -> Result<StatusCode, AppError> {
    let repo = format!("{}/{}", body.did, body.name);
    let path = crate::git::repo_dir(&state.config.repo.scan_path, &body.did, &body.name)
        .ok_or_else(|| AppError::BadRequest("invalid repository name".into()))?;

    let actor = body.actor.as_deref().unwrap_or(&body.did);
    authorize(&state, actor, &repo, action::REPO_DELETE)?;

    crate::git::remove_repo(&path).await?;
    let removed = state.enforcer.remove_repo(state.domain(), &repo)?;

    info!(%repo, %actor, grants_removed = removed, "repository deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /member/add`
#[instrument(skip(state, body), fields(did = %body.did))]
async fn handle_add_member(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MemberRequest>,
) -> Result<StatusCode, AppError> {
    if !is_valid_did(&body.did) {
        return Err(AppError::BadRequest("did must be a DID".into()));
    }

    state.enforcer.add_member(state.domain(), &body.did)?;
    track_identity(&state, &body.did)?;

    info!("member added");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /{did}/{name}/collaborator/add`
#[instrument(skip(state, body), fields(collaborator = %body.did))]
async fn handle_add_collaborator(
    State(state): State<Arc<AppState>>,
    Path((did, name)): Path<(String, String)>,
    Json(body): Json<MemberRequest>,
) -> Result<StatusCode, AppError> {
    if !is_valid_did(&body.did) {
        return Err(AppError::BadRequest("did must be a DID".into()));
    }
    let repo = format!("{did}/{name}");

    state
        .enforcer
        .add_collaborator(&body.did, state.domain(), &repo)?;
    track_identity(&state, &body.did)?;

    info!(%repo, "collaborator added");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /keys`
async fn handle_list_keys(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let keys = state.db.public_keys()?;
    Ok(Json(keys).into_response())
}

/// `PUT /keys`
#[instrument(skip(state, body), fields(did = %body.did, name = %body.name))]
async fn handle_add_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KeyRequest>,
) -> Result<StatusCode, AppError> {
    if !is_valid_did(&body.did) || body.key.trim().is_empty() {
        return Err(AppError::BadRequest("did and key are required".into()));
    }
    let added = state
        .db
        .add_public_key(&body.did, &body.name, &body.key, None)?;
    info!(added, "public key registered");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /health`
async fn handle_health() -> &'static str {
    "ok"
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Enforce `(subject, this knot, object, action)`.  Store failures are
/// refused like denials but logged and counted apart from them.
fn authorize(state: &AppState, subject: &str, object: &str, action: &str) -> Result<(), AppError> {
    let domain = state.domain();
    let metrics = &state.metrics.metrics;
    match state.enforcer.enforce(subject, domain, object, action) {
        Ok(true) => {
            metrics.record_decision(action, Decision::Allow);
            Ok(())
        }
        Ok(false) => {
            warn!(
                principal = %subject,
                %domain,
                %object,
                %action,
                outcome = "deny",
                "authorization denied"
            );
            metrics.record_decision(action, Decision::Deny);
            Err(AppError::Forbidden)
        }
        Err(e) => {
            error!(
                principal = %subject,
                %domain,
                %object,
                %action,
                outcome = "error",
                error = %e,
                "authorization failed"
            );
            metrics.record_decision(action, Decision::Error);
            Err(AppError::Forbidden)
        }
    }
}

/// Remember `did`, widen the event filter to it and pull its keys from the
/// directory in the background.
fn track_identity(state: &AppState, did: &str) -> Result<(), AppError> {
    state.db.add_did(did)?;
    state.sync.add_dids([did.to_string()]);
    state
        .directory
        .spawn_register_keys(state.db.clone(), did.to_string());
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
/// Internal details are logged, never returned.
#[derive(Debug)]
pub enum AppError {
    /// Authorization refused.
    Forbidden,
    /// The request itself is unusable.
    BadRequest(String),
    /// The request conflicts with existing state.
    Conflict(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Forbidden => StatusCode::FORBIDDEN.into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRepo(_)
            | StoreError::InvalidDid(_)
            | StoreError::InvalidKey
            | StoreError::EmptyDomain => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::Internal(other.into()),
        }
    }
}
