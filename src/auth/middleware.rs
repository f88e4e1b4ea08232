//! Axum middleware that rejects internal API calls lacking a valid signature.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify `X-Signature` / `X-Timestamp` before the request reaches a handler.
///
/// Failures get a bare 403; the reason is only logged.  Verification is
/// skipped entirely when the server runs in dev mode.
pub async fn verify_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.server.dev {
        return next.run(request).await;
    }

    let headers = request.headers();
    let result = state.verifier.verify(
        request.method().as_str(),
        request.uri().path(),
        header_str(headers, TIMESTAMP_HEADER),
        header_str(headers, SIGNATURE_HEADER),
    );

    match result {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!(
                method = %request.method(),
                path = %request.uri().path(),
                error = %e,
                "rejected internal API request"
            );
            state.metrics.metrics.signature_rejections.inc();
            StatusCode::FORBIDDEN.into_response()
        }
    }
}
