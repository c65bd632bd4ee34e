use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::responses::{ApiResponse, ErrorResponse};
use crate::api::routes::AppState;
use crate::idempotency::{CapturedResponse, IdempotencyOutcome, ResponseBody};
use crate::observability::{get_metrics, LatencyTimer};

pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const REPLAY_HEADER: &str = "x-idempotency-replay";

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Header value as sent. Blank values read as absent.
fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_owned)
}

/// Framing headers are recomputed for the rebuilt body and never recorded.
fn is_recorded_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "content-length" | "transfer-encoding" | "connection" | "keep-alive" | "trailer" | "upgrade"
    )
}

/// Coordinates mutating requests that carry `x-idempotency-key`.
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }

    let timer = LatencyTimer::new();
    let method = request.method().clone();

    let key = match header_str(request.headers(), IDEMPOTENCY_KEY_HEADER) {
        Some(key) => key,
        None => {
            state.coordinator.record_bypass();
            return next.run(request).await;
        }
    };
    let request_id = header_str(request.headers(), REQUEST_ID_HEADER);

    let body_limit = state.coordinator.config().body_limit_bytes;
    let outcome = state
        .coordinator
        .execute(Some(&key), request_id.as_deref(), move || async move {
            capture_response(next.run(request).await, body_limit).await
        })
        .await;

    let response = outcome_response(outcome);
    get_metrics().record_http_request(method.as_str(), response.status().as_u16(), timer.elapsed_ms());
    response
}

/// Buffers a downstream response into its recordable form.
pub async fn capture_response(response: Response, body_limit: usize) -> CapturedResponse {
    let (parts, body) = response.into_parts();
    let declared_json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false);

    let mut headers = Vec::with_capacity(parts.headers.len());
    for (name, value) in parts.headers.iter() {
        if !is_recorded_header(name) {
            continue;
        }
        match value.to_str() {
            Ok(value) => headers.push((name.as_str().to_owned(), value.to_owned())),
            Err(_) => tracing::warn!("Dropping non-text response header {} from capture", name),
        }
    }

    match to_bytes(body, body_limit).await {
        Ok(bytes) => CapturedResponse {
            status: parts.status.as_u16(),
            headers,
            body: ResponseBody::from_bytes(&bytes, declared_json),
        },
        Err(e) => {
            tracing::error!("Failed to buffer response body: {}", e);
            CapturedResponse::internal_error()
        }
    }
}

/// Builds the outgoing response for a coordinator outcome.
pub fn outcome_response(outcome: IdempotencyOutcome) -> Response {
    match outcome {
        IdempotencyOutcome::Bypassed(captured) | IdempotencyOutcome::Fresh(captured) => {
            captured_response(&captured)
        }
        IdempotencyOutcome::Replayed(captured) => {
            let mut response = captured_response(&captured);
            response
                .headers_mut()
                .insert(HeaderName::from_static(REPLAY_HEADER), HeaderValue::from_static("1"));
            response
        }
        IdempotencyOutcome::Conflict { retry_after } => {
            let seconds = retry_after.as_secs().max(1);
            let body = ApiResponse::<()>::error(
                ErrorResponse::new(
                    "IDEMPOTENCY_IN_PROGRESS",
                    "A request with this idempotency key is still being processed. Retry later.",
                )
                .with_retry_after(seconds),
            );
            let mut response = (StatusCode::CONFLICT, Json(body)).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
            response
        }
    }
}

fn captured_response(captured: &CapturedResponse) -> Response {
    let status = StatusCode::from_u16(captured.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(captured.body.to_bytes()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &captured.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!("Skipping unreplayable recorded header {}", name),
        }
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        if let Some(content_type) = captured.body.content_type() {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
    }
    response
}
