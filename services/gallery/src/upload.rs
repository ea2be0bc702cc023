use crate::caption_store::CaptionStore;
use crate::caption_wait::{wait_for_caption, CaptionWait, PollErrorPolicy, PollPolicy};
use crate::config::UploadConfig;
use crate::object_store::{content_type_for, ObjectStore, ObjectStoreError};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Longest sanitized filename kept in a storage key
const MAX_FILENAME_LENGTH: usize = 255;

/// Errors that end an upload request
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No file selected")]
    NoFile,

    #[error("Invalid file type")]
    InvalidType,

    #[error("Invalid file name")]
    InvalidFilename,

    #[error(transparent)]
    Storage(#[from] ObjectStoreError),
}

impl UploadError {
    /// Whether the client can fix the request
    pub fn is_validation(&self) -> bool {
        !matches!(self, UploadError::Storage(_))
    }

    fn reason(&self) -> &'static str {
        match self {
            UploadError::NoFile => "no_file",
            UploadError::InvalidType => "invalid_type",
            UploadError::InvalidFilename => "invalid_filename",
            UploadError::Storage(_) => "storage",
        }
    }
}

/// File part received from the client
#[derive(Debug, Clone)]
pub struct IncomingFile {
    /// Filename as sent by the client, possibly empty
    pub filename: String,
    pub data: Vec<u8>,
}

/// Validated image ready for storage
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub key: String,
    pub data: Vec<u8>,
    pub content_type: &'static str,
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub key: String,
    /// Non-expiring URL of the stored object
    pub file_url: String,
    /// Caption text or the placeholder
    pub caption: String,
    pub wait: CaptionWait,
    /// Base64 payload, when echoing is enabled
    pub image_data: Option<String>,
}

/// Upload-then-wait workflow
pub struct UploadService {
    objects: Arc<dyn ObjectStore>,
    captions: Arc<dyn CaptionStore>,
    config: UploadConfig,
    poll_policy: PollPolicy,
    shutdown: CancellationToken,
}

impl UploadService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        captions: Arc<dyn CaptionStore>,
        config: UploadConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let poll_policy = PollPolicy {
            interval: config.caption_poll_interval(),
            timeout: config.caption_wait_timeout(),
            on_error: if config.retry_on_poll_error {
                PollErrorPolicy::Retry
            } else {
                PollErrorPolicy::Abort
            },
        };

        Self {
            objects,
            captions,
            config,
            poll_policy,
            shutdown,
        }
    }

    /// Validate, store, then wait for the caption of `file`
    ///
    /// Storage failures are terminal: no caption wait is attempted. A caption
    /// that never arrives is reported through the placeholder, not as an error.
    #[instrument(skip(self, file))]
    pub async fn upload(&self, file: Option<IncomingFile>) -> Result<UploadReceipt, UploadError> {
        let image = self.prepare(file).inspect_err(|e| {
            metrics::counter!("gallery.uploads.rejected", "reason" => e.reason()).increment(1);
        })?;

        let key = image.key.clone();
        let image_data = self.config.echo_image.then(|| STANDARD.encode(&image.data));

        if let Err(e) = self
            .objects
            .put(&image.key, image.data, image.content_type)
            .await
        {
            warn!(s3_key = %key, error = %e, "Image upload failed");
            metrics::counter!("gallery.uploads.rejected", "reason" => "storage").increment(1);
            return Err(e.into());
        }

        metrics::counter!("gallery.uploads.stored").increment(1);

        let wait = wait_for_caption(
            self.captions.as_ref(),
            &key,
            &self.poll_policy,
            &self.shutdown,
        )
        .await;

        metrics::counter!("gallery.captions.waits", "status" => wait.outcome.status())
            .increment(1);
        metrics::histogram!("gallery.captions.wait_seconds").record(wait.elapsed.as_secs_f64());

        info!(
            s3_key = %key,
            status = wait.outcome.status(),
            attempts = wait.attempts,
            "Upload completed"
        );

        Ok(UploadReceipt {
            file_url: self.objects.public_url(&key),
            caption: wait.caption_or(&self.config.placeholder_caption).to_string(),
            key,
            wait,
            image_data,
        })
    }

    /// Validation and key derivation, without side effects
    pub fn prepare(&self, file: Option<IncomingFile>) -> Result<UploadedImage, UploadError> {
        let file = file
            .filter(|f| !f.filename.is_empty())
            .ok_or(UploadError::NoFile)?;

        let extension = allowed_extension(&file.filename, &self.config.allowed_extensions)
            .ok_or(UploadError::InvalidType)?;

        let filename = secure_filename(&file.filename);
        if filename.is_empty() {
            return Err(UploadError::InvalidFilename);
        }

        let filename = if self.config.unique_keys {
            with_unique_token(&filename)
        } else {
            filename
        };

        Ok(UploadedImage {
            key: storage_key(&self.config.key_prefix, &filename),
            data: file.data,
            content_type: content_type_for(&extension),
        })
    }
}

/// Lower-cased extension of `filename` when it is in `allowed`
pub fn allowed_extension(filename: &str, allowed: &[String]) -> Option<String> {
    let (_, extension) = filename.rsplit_once('.')?;
    let extension = extension.to_lowercase();

    allowed
        .iter()
        .any(|a| a.eq_ignore_ascii_case(&extension))
        .then_some(extension)
}

/// Reduce a client filename to a safe, flat name
///
/// The name is NFKD-normalized and reduced to ASCII, so accented letters keep
/// their base letter. Path separators become spaces, whitespace runs become a
/// single `_`, and anything outside `[A-Za-z0-9._-]` is dropped. Leading and
/// trailing dots and underscores are trimmed so the result can never be `..`
/// or hidden. Overlong names lose the end of their stem, never the extension.
pub fn secure_filename(filename: &str) -> String {
    let flattened: String = filename
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");

    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    truncate_stem(cleaned.trim_matches(|c| c == '.' || c == '_'))
}

/// Cap `filename` at `MAX_FILENAME_LENGTH`, cutting the stem only
fn truncate_stem(filename: &str) -> String {
    if filename.len() <= MAX_FILENAME_LENGTH {
        return filename.to_string();
    }

    // Input is ASCII here, so byte offsets are char boundaries
    match filename.rsplit_once('.') {
        Some((stem, extension)) if extension.len() + 2 <= MAX_FILENAME_LENGTH => {
            let keep = MAX_FILENAME_LENGTH - extension.len() - 1;
            let stem = stem[..keep.min(stem.len())]
                .trim_end_matches(|c| c == '.' || c == '_');
            format!("{}.{}", stem, extension)
        }
        _ => filename[..MAX_FILENAME_LENGTH].to_string(),
    }
}

/// `prefix/filename`
pub fn storage_key(prefix: &str, filename: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        filename.to_string()
    } else {
        format!("{}/{}", prefix, filename)
    }
}

fn with_unique_token(filename: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();

    match filename.rsplit_once('.') {
        Some((stem, extension)) => format!("{}-{}.{}", stem, token, extension),
        None => format!("{}-{}", filename, token),
    }
}
