use crate::config::ApiConfig;
use crate::image_store::content_type_for;
use crate::ingest::{IngestError, IngestService};
use crate::record::{DiagnosisRecord, DiagnosisSubmission, StepOutcome};
use crate::remote_mirror::MirrorOutcome;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
}

/// Response to a stored submission
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    /// Always "Success" once the image is stored
    pub status: &'static str,
    pub record_id: Uuid,
    pub local_storage: StepOutcome,
    pub supabase_sync: MirrorOutcome,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let mut origins: Vec<HeaderValue> = Vec::with_capacity(config.cors_origins.len());
            for origin in &config.cors_origins {
                match origin.parse() {
                    Ok(value) => origins.push(value),
                    Err(_) => warn!(origin = %origin.escape_debug(), "Ignoring invalid CORS origin"),
                }
            }
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/record", post(store_record))
        .route("/records", get(list_records))
        .route("/records/:record_id", get(get_record))
        .route("/records/:record_id/image", get(get_record_image))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "diagnosis-store"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let remote = state.ingest.mirror().describe();

    match state.ingest.records().await {
        Ok(records) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "local_store": "readable",
                "records": records.len(),
                "remote": remote
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "local_store": "unreadable",
                "remote": remote,
                "error": e.to_string()
            })),
        ),
    }
}

/// Store a diagnosis submission
#[instrument(skip(state, submission))]
async fn store_record(
    State(state): State<AppState>,
    Json(submission): Json<DiagnosisSubmission>,
) -> Result<Json<RecordResponse>, ApiError> {
    let result = state
        .ingest
        .submit(submission)
        .await
        .map_err(|e: IngestError| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IMAGE_STORAGE_ERROR",
            )
        })?;

    Ok(Json(RecordResponse {
        status: "Success",
        record_id: result.record_id,
        local_storage: result.local_storage,
        supabase_sync: result.remote_sync,
    }))
}

/// List all stored records
#[instrument(skip(state))]
async fn list_records(
    State(state): State<AppState>,
) -> Result<Json<Vec<DiagnosisRecord>>, ApiError> {
    let records = state.ingest.records().await.map_err(|e| {
        error!(error = %e, "Failed to read records");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read records",
            "STORE_ERROR",
        )
    })?;

    Ok(Json(records))
}

/// Get single record metadata
#[instrument(skip(state))]
async fn get_record(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<DiagnosisRecord>, ApiError> {
    let record = state.ingest.record(record_id).await.map_err(|e| {
        error!(error = %e, "Failed to read record");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read record",
            "STORE_ERROR",
        )
    })?;

    record
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Record not found", "NOT_FOUND"))
}

/// Get the stored image for a record
#[instrument(skip(state))]
async fn get_record_image(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let image = state.ingest.image(record_id).await.map_err(|e| {
        error!(error = %e, "Failed to read image");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read image",
            "STORE_ERROR",
        )
    })?;

    let bytes = image
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Image not found", "NOT_FOUND"))?;

    Ok((
        [(header::CONTENT_TYPE, content_type_for(state.ingest.image_extension()))],
        bytes,
    ))
}

/// Start the API server, stopping when `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting diagnosis API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::remote_mirror::{MockMirrorSink, RemoteMirror};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_router(root: &std::path::Path, mirror: RemoteMirror) -> Router {
        let storage = StorageConfig {
            root_dir: root.to_path_buf(),
            ..Default::default()
        };
        let ingest = IngestService::open(&storage, mirror).await.unwrap();
        create_router(
            AppState {
                ingest: Arc::new(ingest),
            },
            &ApiConfig::default(),
        )
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn post_record(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/record")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn wheat_rust(image_data: &str) -> serde_json::Value {
        serde_json::json!({
            "cropName": "Wheat",
            "diseaseName": "Rust",
            "category": "fungal",
            "confidence": 0.92,
            "imageData": image_data,
            "symptoms": ["yellow streaks"],
            "isBiotic": true
        })
    }

    #[tokio::test]
    async fn test_store_record_without_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(tmp.path(), RemoteMirror::Disconnected).await;

        let (status, body) = send(
            &router,
            post_record(wheat_rust("data:image/jpeg;base64,/9j/4AAQSkZJRg==")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["status"], "Success");
        assert_eq!(response["local_storage"], "Ok");
        assert_eq!(response["supabase_sync"], "Not Connected");

        let record_id = response["record_id"].as_str().unwrap();
        assert!(tmp.path().join("images").join(format!("{}.jpg", record_id)).exists());
    }

    #[tokio::test]
    async fn test_store_record_with_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = MockMirrorSink::new();
        sink.expect_insert().times(1).returning(|_| Ok(()));
        let router = test_router(tmp.path(), RemoteMirror::Connected(Arc::new(sink))).await;

        let (status, body) = send(&router, post_record(wheat_rust("SGVsbG8="))).await;
        assert_eq!(status, StatusCode::OK);

        let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["supabase_sync"], "Success");
    }

    #[tokio::test]
    async fn test_invalid_image_returns_server_error() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(tmp.path(), RemoteMirror::Disconnected).await;

        let (status, body) = send(&router, post_record(wheat_rust("not-base64!!"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["code"], "IMAGE_STORAGE_ERROR");
        assert!(response["error"]
            .as_str()
            .unwrap()
            .starts_with("Local image save failed"));

        let records = std::fs::read_to_string(tmp.path().join("records.json")).unwrap();
        assert_eq!(records, "[]");
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(tmp.path(), RemoteMirror::Disconnected).await;

        let (status, _) = send(
            &router,
            post_record(serde_json::json!({ "cropName": "Wheat" })),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_read_back_record_and_image() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(tmp.path(), RemoteMirror::Disconnected).await;

        let (_, body) = send(&router, post_record(wheat_rust("SGVsbG8gV29ybGQ="))).await;
        let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let record_id = response["record_id"].as_str().unwrap().to_string();

        let get = |uri: String| Request::builder().uri(uri).body(Body::empty()).unwrap();

        let (status, body) = send(&router, get("/records".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let records: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(records.as_array().unwrap().len(), 1);

        let (status, body) = send(&router, get(format!("/records/{}", record_id))).await;
        assert_eq!(status, StatusCode::OK);
        let record: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(record["crop"], "Wheat");
        assert_eq!(record["symptoms"][0], "yellow streaks");

        let response = router
            .clone()
            .oneshot(get(format!("/records/{}/image", record_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/jpeg");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Hello World");
    }

    #[tokio::test]
    async fn test_unknown_record_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(tmp.path(), RemoteMirror::Disconnected).await;

        let uri = format!("/records/{}", Uuid::new_v4());
        let (status, _) = send(
            &router,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_readiness_reports_store_state() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(tmp.path(), RemoteMirror::Disconnected).await;
        let ready = || Request::builder().uri("/ready").body(Body::empty()).unwrap();

        let (status, _) = send(&router, ready()).await;
        assert_eq!(status, StatusCode::OK);

        std::fs::write(tmp.path().join("records.json"), "garbage").unwrap();
        let (status, _) = send(&router, ready()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_any_origin() {
        let tmp = tempfile::tempdir().unwrap();
        let router = test_router(tmp.path(), RemoteMirror::Disconnected).await;

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/record")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_cors_keeps_valid_origins_when_one_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            root_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let ingest = IngestService::open(&storage, RemoteMirror::Disconnected).await.unwrap();
        let config = ApiConfig {
            cors_origins: vec![
                "http://bad\norigin".to_string(),
                "http://localhost:5173".to_string(),
            ],
            ..Default::default()
        };
        let router = create_router(
            AppState {
                ingest: Arc::new(ingest),
            },
            &config,
        );

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/record")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );
    }
}
