use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::SdkConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Errors from the object store
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("S3 Upload Error: {0}")]
    Write(String),

    #[error("Failed to presign {key}: {message}")]
    Presign { key: String, message: String },
}

/// Time-limited read URL for a stored object
#[derive(Debug, Clone, PartialEq)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Object storage used for uploaded images
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Produce a read URL for `key` valid for `ttl`
    async fn presign_get(&self, key: &str, ttl: Duration)
        -> Result<PresignedUrl, ObjectStoreError>;

    /// Non-expiring URL of `key`; only resolves when the bucket allows public reads
    fn public_url(&self, key: &str) -> String;
}

/// S3 backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub fn new(sdk_config: &SdkConfig, config: &S3Config) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config)
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        let public_base_url = public_base_url(config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base_url = %public_base_url,
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url,
            config: config.clone(),
        }
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Write(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Write(DisplayErrorContext(&e).to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| ObjectStoreError::Write("No upload ID in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, &body).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| ObjectStoreError::Write(DisplayErrorContext(&e).to_string()))?;

                Ok(())
            }
            Err(e) => {
                // Abandoned parts are billed until aborted.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        s3_key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &[u8],
    ) -> Result<Vec<CompletedPart>, ObjectStoreError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in body.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| ObjectStoreError::Write(DisplayErrorContext(&e).to_string()))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(s3_key = %key, size_bytes = body.len()))]
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let size_bytes = body.len();
        debug!("Uploading image to S3");

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
        }

        info!(s3_key = %key, size_bytes, "Image uploaded successfully");
        Ok(())
    }

    async fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ObjectStoreError> {
        let presign_error = |message: String| ObjectStoreError::Presign {
            key: key.to_string(),
            message,
        };

        let presigning_config =
            PresigningConfig::expires_in(ttl).map_err(|e| presign_error(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| presign_error(DisplayErrorContext(&e).to_string()))?;

        let ttl = chrono::Duration::from_std(ttl).map_err(|e| presign_error(e.to_string()))?;

        Ok(PresignedUrl {
            url: presigned.uri().to_string(),
            expires_at: Utc::now() + ttl,
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

/// Base of non-expiring object URLs
fn public_base_url(config: &S3Config) -> String {
    if let Some(ref base) = config.public_base_url {
        return base.trim_end_matches('/').to_string();
    }

    match config.endpoint_url {
        Some(ref endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        None => format!(
            "https://{}.s3.{}.amazonaws.com",
            config.bucket, config.region
        ),
    }
}

/// Get content type for an image extension
pub fn content_type_for(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> S3Config {
        S3Config {
            bucket: "gallery-images".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
            presigned_url_expiry_secs: 3600,
            multipart_threshold_bytes: 5 * 1024 * 1024,
            part_size_bytes: 5 * 1024 * 1024,
        }
    }

    #[test]
    fn test_public_url_virtual_hosted() {
        assert_eq!(
            public_base_url(&test_config()),
            "https://gallery-images.s3.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn test_public_url_custom_endpoint() {
        let config = S3Config {
            endpoint_url: Some("http://localhost:9000/".to_string()),
            force_path_style: true,
            ..test_config()
        };

        assert_eq!(
            public_base_url(&config),
            "http://localhost:9000/gallery-images"
        );
    }

    #[test]
    fn test_public_url_explicit_base() {
        let config = S3Config {
            public_base_url: Some("https://cdn.example.com/".to_string()),
            ..test_config()
        };

        assert_eq!(public_base_url(&config), "https://cdn.example.com");
    }

    #[test]
    fn test_get_content_type() {
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
        assert_eq!(content_type_for("JPG"), "image/jpeg");
        assert_eq!(content_type_for("png"), "image/png");
        assert_eq!(content_type_for("gif"), "image/gif");
        assert_eq!(content_type_for("unknown"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_presigned_url_contains_key() {
        let sdk_config = SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .credentials_provider(aws_sdk_s3::config::SharedCredentialsProvider::new(
                aws_sdk_s3::config::Credentials::new("AKIDEXAMPLE", "secret", None, None, "test"),
            ))
            .build();
        let store = S3ObjectStore::new(&sdk_config, &test_config());

        let presigned = store
            .presign_get("uploads/a.png", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(presigned.url.contains("uploads/a.png"));
        assert!(presigned.url.contains("X-Amz-Expires=3600"));
        assert!(presigned.expires_at > Utc::now());
        assert_eq!(
            store.public_url("uploads/a.png"),
            "https://gallery-images.s3.us-east-1.amazonaws.com/uploads/a.png"
        );
    }
}
