//! HTTP surface of the gateway.
//!
//! Routed calls enter under `/gateway/{service}/...` and are handed to the
//! mailbox controller, which decides inline versus detached handling from the
//! call-mode header. The `/mailbox/...` routes serve polling clients, always
//! scoped by the mailbox id in the path. `/health` and `/status` are
//! operational endpoints.
use std::{sync::Arc, time::Instant};

use arc_swap::ArcSwap;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, RawQuery, Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use bytes::Bytes;
use serde_json::json;

use crate::{
    config::GatewayConfig,
    core::{
        breaker::BreakerState,
        callback::RESPONSE_STATUS_HEADER,
        error::GatewayError,
        executor::GatewayRequest,
        mailbox::{MailboxController, RequestState, SubmitOutcome},
        registry::ResilienceRegistry,
        trace::{REQUEST_ID_HEADER, TraceInfo},
    },
};

/// Inbound bodies are buffered; anything above this is rejected.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub mailbox: Arc<MailboxController>,
    pub registry: Arc<ResilienceRegistry>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/gateway/{service}", any(forward_root))
        .route("/gateway/{service}/{*path}", any(forward))
        .route("/mailbox/{mailbox_id}/requests", get(list_requests))
        .route(
            "/mailbox/{mailbox_id}/requests/{request_id}/state",
            get(request_state),
        )
        .route(
            "/mailbox/{mailbox_id}/requests/{request_id}/ack",
            post(acknowledge),
        )
        .route("/mailbox/{mailbox_id}/responses", get(list_responses))
        .route(
            "/mailbox/{mailbox_id}/responses/{request_id}",
            get(fetch_response).post(external_response),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.load();
    let pools: Vec<_> = state
        .registry
        .gauges()
        .into_iter()
        .map(|g| {
            json!({
                "pool": g.pool,
                "in_flight": g.in_flight,
                "limit": g.limit,
                "breaker": breaker_state_str(g.breaker_state),
            })
        })
        .collect();

    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "services": config.services.len(),
        "pools": pools,
    }))
}

async fn forward_root(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    RawQuery(query): RawQuery,
    request: Request,
) -> Response {
    handle_forward(state, service, String::new(), query, request).await
}

async fn forward(
    State(state): State<Arc<AppState>>,
    Path((service, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    request: Request,
) -> Response {
    handle_forward(state, service, path, query, request).await
}

async fn handle_forward(
    state: Arc<AppState>,
    service: String,
    path: String,
    query: Option<String>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let headers = request.headers().clone();

    let trace = match TraceInfo::from_headers(&headers) {
        Ok(trace) => trace,
        Err(err) => return error_response(&err),
    };

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return error_response(&GatewayError::BadRequest(
                "request body too large".to_string(),
            ));
        }
    };

    let mut full_path = format!("/{path}");
    if let Some(query) = query {
        full_path.push('?');
        full_path.push_str(&query);
    }

    let gateway_request = GatewayRequest {
        service,
        path: full_path,
        method,
        headers,
        body,
        trace: trace.clone(),
    };

    match state.mailbox.submit(gateway_request).await {
        Ok(SubmitOutcome::Completed(response)) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK));
            if let Some(headers) = builder.headers_mut() {
                *headers = response.headers;
                headers.remove(header::TRANSFER_ENCODING);
            }
            builder
                .body(Body::from(response.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(SubmitOutcome::Accepted { request_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "request_id": request_id,
                "state": RequestState::Received,
            })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn request_state(
    State(state): State<Arc<AppState>>,
    Path((mailbox_id, request_id)): Path<(String, String)>,
) -> Response {
    match state.mailbox.request_state(&mailbox_id, &request_id).await {
        Ok(request_state) => Json(json!({
            "request_id": request_id,
            "state": request_state,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Moves a delivered outcome to `Read`. Only terminal states can be acked;
/// an id this mailbox does not hold is a plain 404.
async fn acknowledge(
    State(state): State<Arc<AppState>>,
    Path((mailbox_id, request_id)): Path<(String, String)>,
) -> Response {
    match state.mailbox.acknowledge(&mailbox_id, &request_id).await {
        Ok(RequestState::Unknown) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "not_found",
                "message": format!("no request '{request_id}'"),
            })),
        )
            .into_response(),
        Ok(acked) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "request_id": request_id,
                "state": acked,
            })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Accepts an outcome pushed by the downstream system itself, completing the
/// stored request as if the original call had answered. The response status
/// is taken from the `x-response-status` header, defaulting to 200.
async fn external_response(
    State(state): State<Arc<AppState>>,
    Path((mailbox_id, request_id)): Path<(String, String)>,
    request: Request,
) -> Response {
    let status = request
        .headers()
        .get(RESPONSE_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(200);

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return error_response(&GatewayError::BadRequest(
                "request body too large".to_string(),
            ));
        }
    };

    match state
        .mailbox
        .complete_external(&mailbox_id, &request_id, status, body.to_vec())
        .await
    {
        Ok(true) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "request_id": request_id,
                "state": RequestState::Responded,
            })),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "not_found",
                "message": format!("no request '{request_id}'"),
            })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Relays the stored outcome as the HTTP response: the downstream status and
/// body come back exactly as captured.
async fn fetch_response(
    State(state): State<Arc<AppState>>,
    Path((mailbox_id, request_id)): Path<(String, String)>,
) -> Response {
    match state.mailbox.fetch_response(&mailbox_id, &request_id).await {
        Ok(Some(stored)) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK));
            if let Some(headers) = builder.headers_mut() {
                if let Ok(value) = HeaderValue::from_str(&stored.request_id) {
                    headers.insert(REQUEST_ID_HEADER, value);
                }
            }
            builder
                .body(Body::from(Bytes::from(stored.body)))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "not_found",
                "message": format!("no response for request '{request_id}'"),
            })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn list_requests(
    State(state): State<Arc<AppState>>,
    Path(mailbox_id): Path<String>,
) -> Response {
    match state.mailbox.list_requests(&mailbox_id).await {
        Ok(records) => {
            let summaries: Vec<_> = records
                .into_iter()
                .map(|r| {
                    json!({
                        "request_id": r.request_id,
                        "state": r.state,
                        "service": r.service,
                        "path": r.path,
                        "method": r.method,
                        "mode": r.mode,
                        "received_at": r.received_at.to_rfc3339(),
                    })
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn list_responses(
    State(state): State<Arc<AppState>>,
    Path(mailbox_id): Path<String>,
) -> Response {
    match state.mailbox.list_responses(&mailbox_id).await {
        Ok(records) => {
            let summaries: Vec<_> = records
                .into_iter()
                .map(|r| {
                    json!({
                        "request_id": r.request_id,
                        "status": r.status,
                        "error": r.error_kind,
                        "completed_at": r.completed_at.to_rfc3339(),
                    })
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &GatewayError) -> Response {
    (
        err.status_code(),
        Json(json!({
            "error": err.kind(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

fn breaker_state_str(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    }
}
