//! HTTP surface for Tiller: webhook receivers, manual sync triggers,
//! and read-only booking/run inspection endpoints.
//!
//! Acknowledgment policy for webhooks: payloads that can never be
//! processed (not JSON, no booking code) are archived and acknowledged
//! with 200 so the sender stops redelivering; a transient storage
//! failure answers 502 so the sender retries.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tiller_adapters::PayloadShape;
use tiller_storage::{BookingStore, StoreError, StoredRow};
use tiller_sync::{IngestOutcome, SyncError, SyncScheduler, WebhookPipeline};
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "tiller-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<WebhookPipeline>,
    pub store: Arc<dyn BookingStore>,
    pub scheduler: Option<Arc<SyncScheduler>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/booking-engine", post(booking_engine_webhook))
        .route("/webhooks/forms", post(forms_webhook))
        .route("/sync/run", post(sync_run))
        .route("/sync/status", get(sync_status))
        .route("/bookings/{code}", get(booking_by_code))
        .route("/healthz", get(healthz))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn booking_engine_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    ingest_response(state.pipeline.ingest("booking-engine", &body, None).await)
}

async fn forms_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    ingest_response(
        state
            .pipeline
            .ingest("forms", &body, Some(PayloadShape::FlatFields))
            .await,
    )
}

fn ingest_response(result: Result<IngestOutcome, StoreError>) -> Response {
    match result {
        Ok(IngestOutcome::Skipped { reason }) => {
            Json(json!({ "skipped": true, "reason": reason })).into_response()
        }
        Ok(outcome @ IngestOutcome::Processed { .. }) => Json(outcome).into_response(),
        Err(err) => {
            warn!(%err, "ingest failed on a storage call");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn sync_run(State(state): State<Arc<AppState>>) -> Response {
    let Some(scheduler) = &state.scheduler else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no booking-engine poll source configured" })),
        )
            .into_response();
    };
    match scheduler.run_once().await {
        Ok(report) => Json(report).into_response(),
        Err(SyncError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a reconciliation run is already in flight" })),
        )
            .into_response(),
        Err(err) => {
            warn!(%err, "manual reconciliation run failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn sync_status(State(state): State<Arc<AppState>>) -> Response {
    let Some(scheduler) = &state.scheduler else {
        return Json(json!({ "configured": false, "last_run": null })).into_response();
    };
    Json(json!({
        "configured": true,
        "last_run": scheduler.last_report().await,
    }))
    .into_response()
}

async fn booking_by_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    match state.store.find_by_code(&code).await {
        Ok(rows) if rows.is_empty() => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no booking with code {code}") })),
        )
            .into_response(),
        Ok(rows) => Json(booking_view(&code, rows)).into_response(),
        Err(err) => {
            warn!(code, %err, "booking lookup failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

fn booking_view(code: &str, rows: Vec<StoredRow>) -> serde_json::Value {
    let canonical_row_id = tiller_sync::select_canonical(&rows).map(|row| row.id.clone());
    json!({
        "code": code,
        "row_count": rows.len(),
        "canonical_row_id": canonical_row_id,
        "rows": rows,
    })
}

async fn healthz() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}
