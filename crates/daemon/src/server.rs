//! HTTP surface: webhook admission plus the control plane.
//!
//! All responses are JSON. Failures carry a stable `error_kind` alongside
//! the human-readable message. The webhook secret is always enforced when
//! configured; API-key auth can be switched off for trusted networks.

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::info;

use crate::admission::{self, AdmissionError, AdmissionOutcome};
use crate::error::ErrorKind;
use crate::store::{JobStatus, Store, StoreError};
use crate::worker::SharedPhase;
use ripline_config::AuthConfig;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Access level granted by an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Readonly,
}

/// One configured API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub role: Role,
    pub key: String,
}

/// Parse the comma-separated API_KEYS value. An entry may carry an
/// `admin:` or `readonly:` prefix; a bare key gets full access.
pub fn parse_api_keys(raw: &str) -> Vec<ApiKey> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            if let Some(key) = entry.strip_prefix("readonly:") {
                ApiKey {
                    role: Role::Readonly,
                    key: key.to_string(),
                }
            } else if let Some(key) = entry.strip_prefix("admin:") {
                ApiKey {
                    role: Role::Admin,
                    key: key.to_string(),
                }
            } else {
                ApiKey {
                    role: Role::Admin,
                    key: entry.to_string(),
                }
            }
        })
        .collect()
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub api_keys: Vec<ApiKey>,
    pub require_api_auth: bool,
    pub webhook_secret: String,
    pub max_retry_count: u32,
    pub wake: Arc<Notify>,
    pub phase: SharedPhase,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        auth: &AuthConfig,
        max_retry_count: u32,
        wake: Arc<Notify>,
        phase: SharedPhase,
    ) -> Self {
        Self {
            store,
            api_keys: parse_api_keys(&auth.api_keys),
            require_api_auth: auth.require_api_auth,
            webhook_secret: auth.webhook_secret.clone(),
            max_retry_count,
            wake,
            phase,
        }
    }
}

/// An API failure with its HTTP status and taxonomy kind.
struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorKind::Unauthorized,
            "missing or invalid credential",
        )
    }

    fn forbidden() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            ErrorKind::Unauthorized,
            "admin access required",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.message,
                "error_kind": self.kind.as_str(),
            })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                ErrorKind::Malformed,
                format!("job {} not found", id),
            ),
            StoreError::RetryExhausted(id) => Self::new(
                StatusCode::CONFLICT,
                ErrorKind::RetryExhausted,
                format!("job {} has exhausted its retries", id),
            ),
            StoreError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, ErrorKind::Malformed, e.to_string())
            }
            StoreError::Sqlite(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Malformed,
                "internal storage error",
            ),
        }
    }
}

fn authorize(state: &AppState, headers: &HeaderMap, need_admin: bool) -> Result<(), ApiError> {
    if !state.require_api_auth {
        return Ok(());
    }
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;
    let Some(key) = state.api_keys.iter().find(|k| k.key == presented) else {
        return Err(ApiError::unauthorized());
    };
    if need_admin && key.role != Role::Admin {
        return Err(ApiError::forbidden());
    }
    Ok(())
}

/// Handler for GET /health. Open, cheap, and honest about the worker.
async fn get_health(State(state): State<AppState>) -> Response {
    let queue = state.store.count_pending().unwrap_or(0);
    let phase = state.phase.lock().unwrap().as_str();
    Json(json!({
        "status": "ok",
        "worker": phase,
        "queue": queue,
    }))
    .into_response()
}

/// Handler for POST /webhook/arm, the admission endpoint.
async fn post_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let secret_header = headers.get("x-webhook-secret").and_then(|v| v.to_str().ok());
    admission::check_webhook_secret(&state.webhook_secret, secret_header)
        .map_err(admission_error)?;

    match admission::parse_notification(&body).map_err(admission_error)? {
        AdmissionOutcome::Accept { title, source_hint } => {
            let job = state.store.insert(&title, &source_hint)?;
            info!(job_id = job.id, source_hint = %job.source_hint, "job admitted");
            state.wake.notify_one();
            Ok((StatusCode::CREATED, Json(json!({ "job_id": job.id }))).into_response())
        }
        AdmissionOutcome::Ignore => {
            Ok(Json(json!({ "status": "ignored" })).into_response())
        }
    }
}

fn admission_error(e: AdmissionError) -> ApiError {
    match e {
        AdmissionError::Oversized => ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Oversized,
            e.to_string(),
        ),
        AdmissionError::Malformed(_) => {
            ApiError::new(StatusCode::BAD_REQUEST, ErrorKind::Malformed, e.to_string())
        }
        AdmissionError::Unauthorized => ApiError::unauthorized(),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

/// Handler for GET /jobs. Paginated listing with optional status filter.
async fn get_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, false)?;

    let status = match query.status.as_deref() {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorKind::Malformed,
                format!("unknown status: {}", raw),
            )
        })?),
        None => None,
    };

    let (items, total) = state
        .store
        .list(status, query.limit.unwrap_or(50), query.offset.unwrap_or(0))?;
    Ok(Json(json!({ "items": items, "total": total })).into_response())
}

/// Handler for GET /stats.
async fn get_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, false)?;
    let stats = state.store.stats()?;
    Ok(Json(stats).into_response())
}

/// Handler for POST /jobs/{id}/retry.
async fn post_retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<i64>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, true)?;
    let job = state.store.requeue(id, state.max_retry_count)?;
    info!(job_id = id, retry_count = job.retry_count, "job requeued");
    state.wake.notify_one();
    Ok(Json(json!({ "job": job })).into_response())
}

/// Handler for DELETE /jobs/{id}.
async fn delete_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<i64>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, true)?;
    state.store.delete(id)?;
    info!(job_id = id, "job deleted");
    Ok(Json(json!({})).into_response())
}

/// Creates the axum Router with every endpoint.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/webhook/arm", post(post_webhook))
        .route("/jobs", get(get_jobs))
        .route("/stats", get(get_stats))
        .route("/jobs/:id/retry", post(post_retry))
        .route("/jobs/:id", delete(delete_job))
        .with_state(state)
}

/// Runs the HTTP server until the process shuts down.
pub async fn run_server(state: AppState, bind_addr: &str) -> Result<(), ServerError> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::new_shared_phase;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(require_auth: bool, webhook_secret: &str) -> AppState {
        let auth = AuthConfig {
            require_api_auth: require_auth,
            api_keys: "admin:root-key,readonly:view-key".to_string(),
            webhook_secret: webhook_secret.to_string(),
        };
        AppState::new(
            Arc::new(Store::open_in_memory().unwrap()),
            &auth,
            3,
            Arc::new(Notify::new()),
            new_shared_phase(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn webhook_request(body: &str, secret: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook/arm")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header("x-webhook-secret", secret);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn test_parse_api_keys() {
        let keys = parse_api_keys("admin:a1, readonly:r1,bare");
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], ApiKey { role: Role::Admin, key: "a1".into() });
        assert_eq!(keys[1], ApiKey { role: Role::Readonly, key: "r1".into() });
        assert_eq!(keys[2], ApiKey { role: Role::Admin, key: "bare".into() });
        assert!(parse_api_keys("").is_empty());
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let state = test_state(true, "s3cret");
        state.store.insert("a", "a").unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["worker"], "idle");
        assert_eq!(json["queue"], 1);
    }

    #[tokio::test]
    async fn test_webhook_creates_job() {
        let state = test_state(true, "");
        let app = create_router(state.clone());

        let response = app
            .oneshot(webhook_request(
                r#"{"title":"ARM","body":"Inception (2010) rip complete","type":"info"}"#,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let json = body_json(response).await;
        let id = json["job_id"].as_i64().unwrap();
        let job = state.store.get(id).unwrap();
        assert_eq!(job.source_hint, "Inception (2010)");
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_webhook_secret_enforced() {
        let state = test_state(false, "s3cret");
        let app = create_router(state.clone());

        let body = r#"{"title":"t","path":"dir"}"#;
        let response = app
            .clone()
            .oneshot(webhook_request(body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(webhook_request(body, Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "unauthorized");

        let response = app.oneshot(webhook_request(body, Some("s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_webhook_traversal_rejected_without_side_effect() {
        let state = test_state(true, "");
        let app = create_router(state.clone());

        let response = app
            .oneshot(webhook_request(r#"{"title":"x","path":"../etc","job_id":"1"}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "malformed");

        let (_, total) = state.store.list(None, 10, 0).unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_webhook_oversize_rejected() {
        let state = test_state(true, "");
        let app = create_router(state.clone());

        let huge = format!(
            r#"{{"title":"x","body":"{}"}}"#,
            "a".repeat(20_000)
        );
        let response = app.oneshot(webhook_request(&huge, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let (_, total) = state.store.list(None, 10, 0).unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_webhook_broadcast_noise_ignored() {
        let state = test_state(true, "");
        let app = create_router(state.clone());

        let response = app
            .oneshot(webhook_request(
                r#"{"title":"ARM","body":"Drive tray opened","type":"info"}"#,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ignored");

        let (_, total) = state.store.list(None, 10, 0).unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_jobs_requires_api_key() {
        let state = test_state(true, "");
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs")
                    .header("x-api-key", "view-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total"], 0);
        assert!(json["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_auth_bypass() {
        let state = test_state(false, "");
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_jobs_status_filter_validation() {
        let state = test_state(true, "");
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=bogus")
                    .header("x-api-key", "view-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let state = test_state(true, "");
        state.store.insert("a", "a").unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stats")
                    .header("x-api-key", "view-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["pending"], 1);
        assert_eq!(json["total_processed"], 0);
    }

    #[tokio::test]
    async fn test_retry_needs_admin() {
        let state = test_state(true, "");
        let job = state.store.insert("t", "t").unwrap();
        state.store.claim_next().unwrap().unwrap();
        state
            .store
            .finish(job.id, JobStatus::Failed, Some(ErrorKind::Encode), Some("x"), None)
            .unwrap();
        let app = create_router(state.clone());

        let retry_uri = format!("/jobs/{}/retry", job.id);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&retry_uri)
                    .header("x-api-key", "view-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&retry_uri)
                    .header("x-api-key", "root-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["job"]["status"], "pending");
        assert_eq!(json["job"]["retry_count"], 1);
        assert_eq!(json["job"]["error"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_retry_conflicts() {
        let state = test_state(true, "");
        let job = state.store.insert("t", "t").unwrap();
        let app = create_router(state.clone());

        // Pending job is not retryable
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/jobs/{}/retry", job.id))
                    .header("x-api-key", "root-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Unknown job is 404
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs/9999/retry")
                    .header("x-api-key", "root-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_exhausted_is_conflict() {
        let state = test_state(true, "");
        let job = state.store.insert("t", "t").unwrap();
        // Burn the whole retry budget
        for _ in 0..3 {
            state.store.claim_next().unwrap().unwrap();
            state
                .store
                .finish(job.id, JobStatus::Failed, Some(ErrorKind::Encode), Some("x"), None)
                .unwrap();
            state.store.requeue(job.id, 3).unwrap();
        }
        state.store.claim_next().unwrap().unwrap();
        state
            .store
            .finish(job.id, JobStatus::Failed, Some(ErrorKind::Encode), Some("x"), None)
            .unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/jobs/{}/retry", job.id))
                    .header("x-api-key", "root-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "retry_exhausted");
    }

    #[tokio::test]
    async fn test_delete_running_conflicts() {
        let state = test_state(true, "");
        let job = state.store.insert("t", "t").unwrap();
        state.store.claim_next().unwrap().unwrap();
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/jobs/{}", job.id))
                    .header("x-api-key", "root-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        state
            .store
            .finish(job.id, JobStatus::Cancelled, None, None, None)
            .unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/jobs/{}", job.id))
                    .header("x-api-key", "root-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(matches!(
            state.store.get(job.id),
            Err(StoreError::NotFound(_))
        ));
    }
}
