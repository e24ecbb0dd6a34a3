//! The writer's HTTP surface: the two RFC 6962 write endpoints plus
//! operational health and metrics.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use rand::Rng;
use tracing::warn;

use crate::metrics::Metrics;
use crate::stage0::StageZero;
use crate::SubmitError;

/// RFC 6962 request bodies are small; anything larger is abuse.
pub const MAX_BODY_BYTES: usize = 128 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub stage0: Arc<StageZero>,
    pub metrics: Metrics,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ct/v1/add-chain", post(add_chain))
        .route("/ct/v1/add-pre-chain", post(add_pre_chain))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather_text(),
    )
}

async fn add_chain(State(state): State<AppState>, body: Bytes) -> Response {
    submit(state, body, false).await
}

async fn add_pre_chain(State(state): State<AppState>, body: Bytes) -> Response {
    submit(state, body, true).await
}

async fn submit(state: AppState, body: Bytes, precert_endpoint: bool) -> Response {
    let endpoint = if precert_endpoint {
        "add-pre-chain"
    } else {
        "add-chain"
    };
    match state.stage0.add_chain(&body, precert_endpoint).await {
        Ok(sct) => {
            state
                .metrics
                .submissions
                .with_label_values(&[endpoint, "ok"])
                .inc();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                serde_json::to_vec(&sct).expect("sct serializes"),
            )
                .into_response()
        }
        Err(err) => {
            state
                .metrics
                .submissions
                .with_label_values(&[endpoint, "error"])
                .inc();
            warn!(endpoint, error = %err, "submission rejected");
            error_response(&err)
        }
    }
}

/// Maps stage-0 errors onto the RFC 6962 status conventions; overload
/// answers carry a jittered Retry-After so clients spread their retries.
fn error_response(err: &SubmitError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status == StatusCode::SERVICE_UNAVAILABLE {
        let retry_after = rand::thread_rng().gen_range(30..=90);
        (
            status,
            [(header::RETRY_AFTER, retry_after.to_string())],
            "pool full\n".to_string(),
        )
            .into_response()
    } else {
        (status, format!("{err}\n")).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        assert_eq!(
            SubmitError::InvalidRequest("x".into()).status(),
            400
        );
        assert_eq!(SubmitError::SequencerBusy.status(), 503);
        assert_eq!(SubmitError::Internal("x".into()).status(), 500);
    }
}
