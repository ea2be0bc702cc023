//! Gallery Service
//!
//! Image upload and captioned gallery service. Uploaded images are stored in
//! S3; an external captioning worker notices each new object and writes a
//! caption row to MySQL. The upload endpoint waits a bounded time for that
//! row before answering, and the gallery endpoint lists every captioned image
//! with a presigned URL.
//!
//! ## Features
//!
//! - **Validated uploads**: extension allow-list, sanitized filenames, keys of
//!   the form `uploads/<filename>`
//! - **Bounded caption wait**: timer-driven polling that never blocks a
//!   runtime thread and stops on shutdown
//! - **Pooled database access**: credentials resolved from Secrets Manager,
//!   pool rebuilt after connection failures
//! - **Presigned gallery URLs**: time-limited links, newest upload first
//!
//! ## Architecture
//!
//! ```text
//!  POST /upload                S3 Bucket                 Captioning
//! ┌──────────────┐           ┌──────────────┐           Worker
//! │ Upload       │──────────▶│ uploads/     │──────────▶(external)
//! │ Service      │   put     │   {file}     │                │
//! └──────────────┘           └──────────────┘                │
//!        │                          ▲                        ▼
//!        │ wait_for_caption         │ presign         ┌──────────────┐
//!        ▼                          │                 │ MySQL        │
//! ┌──────────────┐           ┌──────────────┐         │ captions     │
//! │ Caption      │◀──────────│ Gallery      │         └──────────────┘
//! │ Store        │   list    │ Service      │                ▲
//! └──────────────┘           └──────────────┘                │
//!        │                    GET /gallery                   │
//!        └───────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod caption_store;
pub mod caption_wait;
pub mod config;
pub mod gallery;
pub mod object_store;
pub mod secrets;
pub mod upload;

pub use api::{AppState, GalleryResponse, UploadResponse};
pub use caption_store::{CaptionRecord, CaptionStore, CaptionStoreError, MySqlCaptionStore};
pub use caption_wait::{
    wait_for_caption, CaptionOutcome, CaptionWait, PollErrorPolicy, PollPolicy,
};
pub use config::Config;
pub use gallery::{GalleryError, GalleryService, PresignedView};
pub use object_store::{ObjectStore, ObjectStoreError, PresignedUrl, S3ObjectStore};
pub use secrets::{AwsSecretProvider, DbCredentials, SecretError, SecretProvider};
pub use upload::{IncomingFile, UploadError, UploadReceipt, UploadService};
