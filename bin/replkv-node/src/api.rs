//! HTTP API
//!
//! Every response except `/metrics` is a JSON object with a single
//! `message` field.

use crate::metrics::{ApiOperation, NodeMetrics};
use crate::service::KvService;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use replkv_cluster::membership::PING_PATH;
use replkv_cluster::{ORIGIN_HEADER, RemoteApply, UPDATE_PATH, UpdateRequest};
use replkv_common::Error;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

const INTERNAL_ERROR: &str = "Internal Server Error";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<KvService>,
    pub metrics: Arc<NodeMetrics>,
}

/// Error response with a status and a client-facing message
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    /// Server-side failure; the cause is logged, not returned
    pub fn server(status: StatusCode) -> Self {
        Self {
            status,
            message: status
                .canonical_reason()
                .unwrap_or(INTERNAL_ERROR)
                .to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = StatusCode::from_u16(e.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match e {
            Error::Validation(msg) => Self::bad_request(msg),
            Error::MalformedEntry(msg) => Self::bad_request(format!("Invalid update: {msg}")),
            other => {
                error!("Request failed: {}", other);
                Self::server(status)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        message(self.status, self.message)
    }
}

fn message(status: StatusCode, msg: impl Into<String>) -> Response {
    let body = serde_json::json!({ "message": msg.into() });
    (status, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetQuery {
    key: Option<String>,
    value: Option<String>,
}

/// Build the node's router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/get", get(get_handler))
        .route("/set", get(set_handler))
        .route("/delete", get(delete_handler))
        .route(PING_PATH, get(ping_handler))
        .route(UPDATE_PATH, post(update_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl AppState {
    /// Count the request's outcome
    fn observe(&self, result: Result<Response, ApiError>) -> Response {
        match result {
            Ok(response) => response,
            Err(e) => {
                if e.status == StatusCode::BAD_REQUEST {
                    self.metrics.record_rejection();
                } else if e.status.is_server_error() {
                    self.metrics.record_internal_error();
                }
                e.into_response()
            }
        }
    }
}

async fn get_handler(State(state): State<AppState>, Query(query): Query<KeyQuery>) -> Response {
    state.metrics.record_request(ApiOperation::Get);

    let result = match query.key.filter(|k| !k.is_empty()) {
        None => Err(ApiError::not_found("Key not found")),
        Some(key) => state
            .service
            .read(&key)
            .map(|value| message(StatusCode::OK, value))
            .ok_or_else(|| ApiError::not_found("Value Not found")),
    };
    state.observe(result)
}

async fn set_handler(State(state): State<AppState>, Query(query): Query<SetQuery>) -> Response {
    state.metrics.record_request(ApiOperation::Set);

    let result = (|| -> Result<Response, ApiError> {
        let key = query.key.ok_or_else(|| ApiError::bad_request("Key not found"))?;
        let value = query
            .value
            .ok_or_else(|| ApiError::bad_request("Value not found"))?;
        let written = state.service.write(&key, &value)?;
        debug!("Saved {} at LSN {}", key, written.lsn);
        Ok(message(StatusCode::OK, "Key saved"))
    })();
    state.observe(result)
}

async fn delete_handler(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Response {
    state.metrics.record_request(ApiOperation::Delete);

    let result = match query.key {
        None => Err(ApiError::not_found("Key not found")),
        Some(key) => state
            .service
            .delete(&key)
            .map(|_| message(StatusCode::OK, "Key deleted"))
            .map_err(ApiError::from),
    };
    state.observe(result)
}

async fn ping_handler(State(state): State<AppState>) -> Response {
    state.metrics.record_request(ApiOperation::Ping);
    message(StatusCode::OK, "OK")
}

async fn update_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> Response {
    state.metrics.record_request(ApiOperation::InternalUpdate);

    let origin = headers
        .get(ORIGIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|o| !o.is_empty());
    let result = match body {
        Err(rejection) => {
            warn!("Rejected update body: {}", rejection);
            Err(ApiError::bad_request("Invalid request body"))
        }
        Ok(Json(request)) => match state.service.receive_remote(origin, &request.update) {
            Ok(RemoteApply::Applied { lsn }) => {
                debug!("Applied update from {:?} as LSN {}", origin, lsn);
                Ok(message(StatusCode::OK, "OK"))
            }
            Ok(RemoteApply::Duplicate) => Ok(message(StatusCode::OK, "OK")),
            Err(e) => Err(ApiError::from(e)),
        },
    };
    state.observe(result)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.export_prometheus(&state.service);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::FailureReporter;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use replkv_cluster::{Membership, Replicator};
    use replkv_common::config::StorageConfig;
    use replkv_storage::StorageEngine;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir) -> AppState {
        let config = StorageConfig {
            sync_on_write: false,
            ..StorageConfig::with_data_dir(dir.path())
        };
        let engine = Arc::new(StorageEngine::open(&config).unwrap());
        let membership =
            Arc::new(Membership::from_peers(None, Vec::new(), Duration::from_secs(1)).unwrap());
        let replicator = Arc::new(
            Replicator::new(Arc::clone(&engine), membership, Duration::from_secs(1)).unwrap(),
        );
        AppState {
            service: Arc::new(KvService::new(
                engine,
                replicator,
                FailureReporter::detached(),
            )),
            metrics: Arc::new(NodeMetrics::new()),
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn get_uri(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = call(app, request).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    async fn post_update(app: &Router, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(UPDATE_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .header(ORIGIN_HEADER, "http://peer:8080")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = call(app, request).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));

        let (status, body) = get_uri(&app, "/set?key=color&value=blue").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Key saved");

        let (status, body) = get_uri(&app, "/get?key=color").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "blue");

        let (status, body) = get_uri(&app, "/delete?key=color").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Key deleted");

        let (status, body) = get_uri(&app, "/get?key=color").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Value Not found");
    }

    #[tokio::test]
    async fn test_missing_params() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));

        let (status, body) = get_uri(&app, "/get").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Key not found");

        let (status, _) = get_uri(&app, "/delete").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get_uri(&app, "/set?key=a").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Value not found");
    }

    #[tokio::test]
    async fn test_oversized_value_rejected_and_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state.clone());

        let uri = format!("/set?key=k&value={}", "v".repeat(101));
        let (status, body) = get_uri(&app, &uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Value length too long");

        let uri = format!("/set?key={}&value=v", "k".repeat(51));
        let (status, body) = get_uri(&app, &uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Key length too long");

        assert_eq!(state.service.engine().current_lsn(), 0);
        let wal = std::fs::read_to_string(dir.path().join("wal.log")).unwrap();
        assert!(wal.is_empty());
    }

    #[tokio::test]
    async fn test_internal_update() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state.clone());

        let (status, body) = post_update(&app, r#"{"update":"9,SET,k,a,b"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "OK");

        // A retried delivery is acknowledged without a second append
        let (status, _) = post_update(&app, r#"{"update":"9,SET,k,a,b"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.service.engine().current_lsn(), 1);

        let (_, body) = get_uri(&app, "/get?key=k").await;
        assert_eq!(body["message"], "a,b");
    }

    #[tokio::test]
    async fn test_internal_update_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state.clone());

        let (status, body) = post_update(&app, "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid request body");

        let (status, _) = post_update(&app, r#"{"update":"1,DELETE,k,extra"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_update(&app, r#"{"other":"1,SET,k,v"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(state.service.engine().current_lsn(), 0);
    }

    #[test]
    fn test_error_status_follows_error_kind() {
        let e = ApiError::from(Error::validation("Key is empty"));
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.message, "Key is empty");

        let e = ApiError::from(Error::storage("disk full"));
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.message, "Internal Server Error");

        let e = ApiError::from(Error::Timeout);
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(e.message, "Service Unavailable");
    }

    #[tokio::test]
    async fn test_ping_and_method_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));

        let (status, body) = get_uri(&app, "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "OK");

        let request = Request::builder()
            .method(Method::POST)
            .uri("/get?key=a")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));

        get_uri(&app, "/set?key=a&value=1").await;
        get_uri(&app, "/set?key=a").await;

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("replkv_requests_total{operation=\"set\"} 2"));
        assert!(body.contains("replkv_validation_rejections_total 1"));
        assert!(body.contains("replkv_wal_lsn 1"));
        assert!(body.contains("replkv_keys 1"));
    }
}
