use crate::caption_store::CaptionStore;
use crate::config::ApiConfig;
use crate::gallery::{GalleryError, GalleryService, PresignedView};
use crate::upload::{IncomingFile, UploadError, UploadService};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

const INDEX_PAGE: &str = include_str!("../static/index.html");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadService>,
    pub gallery: Arc<GalleryService>,
    pub caption_store: Arc<dyn CaptionStore>,
    pub expose_error_details: bool,
}

/// Successful upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub key: String,
    pub file_url: String,
    pub caption: String,
    /// `ready`, `pending` or `unavailable`
    pub caption_status: &'static str,
    pub poll_attempts: u32,
    pub waited_ms: u64,
    /// Base64 of the uploaded bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
}

/// Gallery response; `error` is set only when listing failed
#[derive(Debug, Serialize)]
pub struct GalleryResponse {
    pub images: Vec<PresignedView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned by the upload endpoint
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                code: code.to_string(),
            },
        }
    }

    fn from_upload(err: UploadError, expose_details: bool) -> Self {
        if err.is_validation() {
            return Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string());
        }

        error!(error = %err, "Upload failed");
        let message = if expose_details {
            err.to_string()
        } else {
            "S3 Upload Error".to_string()
        };
        Self::new(StatusCode::BAD_GATEWAY, "STORAGE_ERROR", message)
    }

    fn from_multipart(err: MultipartError) -> Self {
        Self::new(
            err.status(),
            "VALIDATION_ERROR",
            format!("Failed to read upload: {}", err.body_text()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig, max_upload_bytes: usize) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(upload_form))
        .route("/upload", post(upload_image))
        .route("/gallery", get(list_gallery))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Upload form page
async fn upload_form() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gallery-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match state.caption_store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");

            let message = if state.expose_error_details {
                e.to_string()
            } else {
                "Database Error".to_string()
            };

            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected",
                    "error": message
                })),
            )
        }
    }
}

/// Store an image and wait briefly for its caption
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let file = read_file_field(multipart)
        .await
        .map_err(ApiError::from_multipart)?;

    let receipt = state
        .uploads
        .upload(file)
        .await
        .map_err(|e| ApiError::from_upload(e, state.expose_error_details))?;

    Ok(Json(UploadResponse {
        key: receipt.key,
        file_url: receipt.file_url,
        caption: receipt.caption,
        caption_status: receipt.wait.outcome.status(),
        poll_attempts: receipt.wait.attempts,
        waited_ms: receipt.wait.elapsed.as_millis() as u64,
        image_data: receipt.image_data,
    }))
}

/// List every captioned image with a presigned URL
#[instrument(skip(state))]
async fn list_gallery(State(state): State<AppState>) -> (StatusCode, Json<GalleryResponse>) {
    match state.gallery.list().await {
        Ok(images) => (StatusCode::OK, Json(GalleryResponse { images, error: None })),
        Err(e) => {
            error!(error = %e, "Failed to list gallery");

            let (status, generic) = match e {
                GalleryError::Database(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Database Error")
                }
                GalleryError::Presign(_) => {
                    (StatusCode::BAD_GATEWAY, "Failed to presign image URLs")
                }
            };
            let message = if state.expose_error_details {
                e.to_string()
            } else {
                generic.to_string()
            };

            (
                status,
                Json(GalleryResponse {
                    images: Vec::new(),
                    error: Some(message),
                }),
            )
        }
    }
}

/// Pull the `file` part out of the form; other fields are ignored
async fn read_file_field(
    mut multipart: Multipart,
) -> Result<Option<IncomingFile>, MultipartError> {
    let mut file = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        if file.is_some() {
            warn!("Ignoring repeated file field");
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await?;

        file = Some(IncomingFile {
            filename,
            data: data.to_vec(),
        });
    }

    Ok(file)
}

/// Start the HTTP server, stopping when `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    max_upload_bytes: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config, max_upload_bytes);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gallery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption_store::{CaptionRecord, CaptionStoreError, MockCaptionStore};
    use crate::config::UploadConfig;
    use crate::object_store::{MockObjectStore, PresignedUrl};
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "gallery-test-boundary";

    fn app(objects: MockObjectStore, captions: MockCaptionStore) -> Router {
        app_with(objects, captions, true, 1024 * 1024)
    }

    fn app_with(
        objects: MockObjectStore,
        captions: MockCaptionStore,
        expose_error_details: bool,
        max_upload_bytes: usize,
    ) -> Router {
        let objects = Arc::new(objects);
        let captions = Arc::new(captions);

        let state = AppState {
            uploads: Arc::new(UploadService::new(
                objects.clone(),
                captions.clone(),
                UploadConfig::default(),
                CancellationToken::new(),
            )),
            gallery: Arc::new(GalleryService::new(
                objects,
                captions.clone(),
                Duration::from_secs(3600),
            )),
            caption_store: captions,
            expose_error_details,
        };

        create_router(state, &ApiConfig::default(), max_upload_bytes)
    }

    fn multipart_request(field: &str, filename: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_index_serves_form() {
        let response = app(MockObjectStore::new(), MockCaptionStore::new())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("action=\"/upload\""));
        assert!(page.contains("name=\"file\""));
    }

    #[tokio::test]
    async fn test_upload_invalid_type_is_bad_request() {
        let mut objects = MockObjectStore::new();
        objects.expect_put().never();
        let mut captions = MockCaptionStore::new();
        captions.expect_get_caption().never();

        let response = app(objects, captions)
            .oneshot(multipart_request("file", "cat.txt", b"meow"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"], "Invalid file type");
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let response = app(MockObjectStore::new(), MockCaptionStore::new())
            .oneshot(multipart_request("avatar", "cat.png", b"png"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "No file selected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_success() {
        let mut objects = MockObjectStore::new();
        objects.expect_put().times(1).returning(|_, _, _| Ok(()));
        objects
            .expect_public_url()
            .returning(|key| format!("https://images.s3.us-east-1.amazonaws.com/{}", key));

        let mut captions = MockCaptionStore::new();
        captions
            .expect_get_caption()
            .times(1)
            .returning(|_| Ok(Some("A cat".to_string())));

        let response = app(objects, captions)
            .oneshot(multipart_request("file", "cat.png", b"png"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["key"], "uploads/cat.png");
        assert_eq!(body["caption"], "A cat");
        assert_eq!(body["caption_status"], "ready");
        assert_eq!(body["poll_attempts"], 1);
        assert_eq!(
            body["file_url"],
            "https://images.s3.us-east-1.amazonaws.com/uploads/cat.png"
        );
        assert_eq!(body["image_data"], "cG5n");
    }

    #[tokio::test]
    async fn test_upload_storage_failure_is_bad_gateway() {
        let mut objects = MockObjectStore::new();
        objects.expect_put().returning(|_, _, _| {
            Err(crate::object_store::ObjectStoreError::Write(
                "NoSuchBucket".to_string(),
            ))
        });

        let response = app(objects, MockCaptionStore::new())
            .oneshot(multipart_request("file", "cat.png", b"png"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["code"], "STORAGE_ERROR");
        assert_eq!(body["error"], "S3 Upload Error: NoSuchBucket");
    }

    #[tokio::test]
    async fn test_gallery_lists_in_order() {
        let mut captions = MockCaptionStore::new();
        captions.expect_list_captions().returning(|| {
            Ok(vec![
                CaptionRecord {
                    image_key: "uploads/a.png".to_string(),
                    caption: Some("A".to_string()),
                    uploaded_at: Utc::now(),
                },
                CaptionRecord {
                    image_key: "uploads/b.png".to_string(),
                    caption: Some("B".to_string()),
                    uploaded_at: Utc::now() - chrono::Duration::minutes(5),
                },
            ])
        });

        let mut objects = MockObjectStore::new();
        objects.expect_presign_get().returning(|key, _| {
            Ok(PresignedUrl {
                url: format!("https://images.s3.amazonaws.com/{}?sig=1", key),
                expires_at: Utc::now(),
            })
        });

        let response = app(objects, captions)
            .oneshot(Request::get("/gallery").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let images = body["images"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0]["caption"], "A");
        assert!(images[0]["url"].as_str().unwrap().contains("uploads/a.png"));
        assert_eq!(images[1]["caption"], "B");
        assert!(images[1]["url"].as_str().unwrap().contains("uploads/b.png"));
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_gallery_database_error_has_empty_list() {
        let mut captions = MockCaptionStore::new();
        captions
            .expect_list_captions()
            .returning(|| Err(CaptionStoreError::Query(sqlx::Error::PoolTimedOut)));

        let response = app(MockObjectStore::new(), captions)
            .oneshot(Request::get("/gallery").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["images"].as_array().unwrap().len(), 0);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Database Error:"));
    }

    #[tokio::test]
    async fn test_readiness_reflects_database() {
        let mut captions = MockCaptionStore::new();
        captions
            .expect_ping()
            .returning(|| Err(CaptionStoreError::Query(sqlx::Error::PoolTimedOut)));

        let response = app(MockObjectStore::new(), captions)
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_upload_storage_failure_hides_details() {
        let mut objects = MockObjectStore::new();
        objects.expect_put().returning(|_, _, _| {
            Err(crate::object_store::ObjectStoreError::Write(
                "AccessDenied: arn:aws:s3:::private-bucket".to_string(),
            ))
        });

        let response = app_with(objects, MockCaptionStore::new(), false, 1024 * 1024)
            .oneshot(multipart_request("file", "cat.png", b"png"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["code"], "STORAGE_ERROR");
        assert_eq!(body["error"], "S3 Upload Error");
    }

    #[tokio::test]
    async fn test_gallery_database_error_hides_details() {
        let mut captions = MockCaptionStore::new();
        captions
            .expect_list_captions()
            .returning(|| Err(CaptionStoreError::Query(sqlx::Error::PoolTimedOut)));

        let response = app_with(MockObjectStore::new(), captions, false, 1024 * 1024)
            .oneshot(Request::get("/gallery").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["images"].as_array().unwrap().len(), 0);
        assert_eq!(body["error"], "Database Error");
    }

    #[tokio::test]
    async fn test_readiness_hides_details() {
        let mut captions = MockCaptionStore::new();
        captions
            .expect_ping()
            .returning(|| Err(CaptionStoreError::Query(sqlx::Error::PoolTimedOut)));

        let response = app_with(MockObjectStore::new(), captions, false, 1024 * 1024)
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["error"], "Database Error");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let mut objects = MockObjectStore::new();
        objects.expect_put().never();
        let mut captions = MockCaptionStore::new();
        captions.expect_get_caption().never();

        let response = app_with(objects, captions, true, 1024)
            .oneshot(multipart_request("file", "cat.png", &[0u8; 4096]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
