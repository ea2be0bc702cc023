use crate::caption_store::{CaptionStore, CaptionStoreError};
use crate::object_store::{ObjectStore, ObjectStoreError};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that prevent the gallery from being listed
#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Database(#[from] CaptionStoreError),

    #[error(transparent)]
    Presign(#[from] ObjectStoreError),
}

/// A caption record with a freshly presigned URL
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresignedView {
    pub key: String,
    pub url: String,
    pub caption: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Builds the gallery listing
pub struct GalleryService {
    objects: Arc<dyn ObjectStore>,
    captions: Arc<dyn CaptionStore>,
    url_expiry: Duration,
}

impl GalleryService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        captions: Arc<dyn CaptionStore>,
        url_expiry: Duration,
    ) -> Self {
        Self {
            objects,
            captions,
            url_expiry,
        }
    }

    /// Every caption record, newest first, each with a presigned URL
    ///
    /// All or nothing: a failed listing or a failed presign yields an error,
    /// never a partial gallery.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<PresignedView>, GalleryError> {
        let records = self.captions.list_captions().await?;

        // try_join_all preserves input order
        let views = try_join_all(records.into_iter().map(|record| async move {
            let presigned = self
                .objects
                .presign_get(&record.image_key, self.url_expiry)
                .await?;

            Ok::<_, GalleryError>(PresignedView {
                key: record.image_key,
                url: presigned.url,
                caption: record.caption,
                expires_at: presigned.expires_at,
            })
        }))
        .await?;

        debug!(count = views.len(), "Gallery listed");
        metrics::counter!("gallery.listings").increment(1);

        Ok(views)
    }
}
