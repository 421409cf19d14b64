//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::AppState;
use crate::aggregator::RunAggregator;
use crate::events::{EventError, RawMessage, Topic};
use crate::model::ProtocolId;
use crate::session::{refresh_protocol, RunSession};
use crate::snapshot::SnapshotError;
use crate::tree::ResultFilter;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/run", get(run))
        .route("/forest", get(forest))
        .route("/statistics", get(statistics))
        .route("/protocols/{id}/performance", get(protocol_performance))
        .route("/protocols/{id}/summary", get(protocol_summary))
        .route("/protocols/{id}/refresh", post(protocol_refresh))
        .route("/startup-times", get(startup_times))
        .route("/notices", get(notices))
        .route("/notices/{id}", delete(dismiss_notice))
        .route("/events", post(ingest_event))
}

// ---------------------------------------------------------------------------
// Envelope & errors
// ---------------------------------------------------------------------------

fn envelope(data: impl serde::Serialize, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_seeded() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "run not loaded yet")
    }

    fn unknown_protocol(id: ProtocolId) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("protocol {} not found", id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "data": null, "meta": { "error": self.message } });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Run `read` against the seeded aggregator.
async fn with_run<T>(
    state: &AppState,
    read: impl FnOnce(&RunSession, &RunAggregator) -> T,
) -> Result<T, ApiError> {
    let session = state.session.read().await;
    let aggregator = session.aggregator().ok_or_else(ApiError::not_seeded)?;
    Ok(read(&*session, aggregator))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let session = state.session.read().await;
    envelope(
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "activeRun": session.active_run(),
            "seeded": session.aggregator().is_some(),
        }),
        json!({ "timestamp": Utc::now().to_rfc3339() }),
    )
}

async fn run(State(state): State<AppState>) -> ApiResult {
    with_run(&state, |session, agg| {
        let run = agg.run();
        let neighbours = session.neighbours();
        envelope(
            run,
            json!({
                "version": agg.version(),
                "environment": run.environment_parameters(),
                "nextRunId": neighbours.next_run_id,
                "prevRunId": neighbours.prev_run_id,
            }),
        )
    })
    .await
}

async fn forest(State(state): State<AppState>, Query(filter): Query<ResultFilter>) -> ApiResult {
    with_run(&state, |_, agg| {
        let forest = agg.filtered_forest(&filter);
        let visible: usize = forest.iter().map(|n| n.size()).sum();
        envelope(
            &forest,
            json!({
                "roots": forest.len(),
                "visible": visible,
                "orphans": agg.orphans(),
                "filter": filter,
                "version": agg.version(),
            }),
        )
    })
    .await
}

async fn statistics(State(state): State<AppState>) -> ApiResult {
    with_run(&state, |_, agg| {
        let stats = agg.statistics();
        let settled = stats.is_settled();
        envelope(stats, json!({ "version": agg.version(), "settled": settled }))
    })
    .await
}

async fn protocol_performance(
    State(state): State<AppState>,
    Path(id): Path<ProtocolId>,
) -> ApiResult {
    with_run(&state, |_, agg| {
        agg.performance_view(id)
            .map(|view| {
                let regressions = view.deltas.regressions();
                envelope(
                    view,
                    json!({ "version": agg.version(), "regressions": regressions }),
                )
            })
            .ok_or_else(|| ApiError::unknown_protocol(id))
    })
    .await?
}

async fn protocol_summary(
    State(state): State<AppState>,
    Path(id): Path<ProtocolId>,
) -> ApiResult {
    with_run(&state, |_, agg| {
        agg.protocol_summary(id)
            .map(|summary| envelope(summary, json!({ "version": agg.version() })))
            .ok_or_else(|| ApiError::unknown_protocol(id))
    })
    .await?
}

async fn protocol_refresh(
    State(state): State<AppState>,
    Path(id): Path<ProtocolId>,
) -> ApiResult {
    match refresh_protocol(&state.session, state.loader.as_ref(), id).await {
        Ok(applied) => Ok(envelope(json!({ "applied": applied }), json!({}))),
        Err(SnapshotError::NotFound(what)) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("{} not found", what),
        )),
        Err(e) => {
            warn!(protocol_id = id, error = %e, "Protocol refresh failed");
            Err(ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

async fn startup_times(State(state): State<AppState>) -> ApiResult {
    with_run(&state, |_, agg| {
        let times = agg.startup_times();
        let total = times.len();
        envelope(times, json!({ "total": total }))
    })
    .await
}

async fn notices(State(state): State<AppState>) -> Json<Value> {
    let notices = state.session.read().await.notices(Utc::now());
    let total = notices.len();
    envelope(notices, json!({ "total": total }))
}

async fn dismiss_notice(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.session.write().await.dismiss_notice(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(message): Json<RawMessage>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let topic: Topic = message
        .topic
        .parse()
        .map_err(|e: EventError| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    debug!(%topic, "Ingesting push message");

    state.publisher.publish(message).await.map_err(|_| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "event stream is not running")
    })?;
    Ok((
        StatusCode::ACCEPTED,
        envelope(json!({ "topic": topic.to_string() }), json!({})),
    ))
}
