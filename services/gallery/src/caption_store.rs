use crate::config::DatabaseConfig;
use crate::secrets::{SecretError, SecretProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Errors from the caption store
#[derive(Error, Debug)]
pub enum CaptionStoreError {
    #[error("Database Error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Database Error: {0}")]
    Credentials(#[from] SecretError),

    #[error("Database Error: failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// A caption row written by the captioning worker
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct CaptionRecord {
    /// Storage key of the captioned image
    pub image_key: String,
    /// Caption text; NULL until the worker finishes
    pub caption: Option<String>,
    /// When the image was recorded by the worker
    pub uploaded_at: DateTime<Utc>,
}

/// Read access to caption records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaptionStore: Send + Sync {
    /// Caption for `image_key`, if present and non-empty
    async fn get_caption(&self, image_key: &str) -> Result<Option<String>, CaptionStoreError>;

    /// All caption records, newest upload first
    async fn list_captions(&self) -> Result<Vec<CaptionRecord>, CaptionStoreError>;

    /// Check database connectivity
    async fn ping(&self) -> Result<(), CaptionStoreError>;
}

/// Where connection options come from
enum ConnectSource {
    Url(MySqlConnectOptions),
    Secret(Arc<dyn SecretProvider>),
}

/// MySQL caption store
///
/// The pool is built on first use from freshly resolved credentials and
/// dropped again when a query fails at the connection level, so rotated
/// secrets are picked up on the next request.
pub struct MySqlCaptionStore {
    source: ConnectSource,
    config: DatabaseConfig,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlCaptionStore {
    /// Store connecting with a fixed URL
    pub fn with_url(url: &str, config: &DatabaseConfig) -> Result<Self, CaptionStoreError> {
        let options = MySqlConnectOptions::from_str(url)?;

        Ok(Self::new(ConnectSource::Url(options), config))
    }

    /// Store connecting with credentials from `secrets`
    pub fn with_secrets(secrets: Arc<dyn SecretProvider>, config: &DatabaseConfig) -> Self {
        Self::new(ConnectSource::Secret(secrets), config)
    }

    fn new(source: ConnectSource, config: &DatabaseConfig) -> Self {
        Self {
            source,
            config: config.clone(),
            pool: RwLock::new(None),
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), CaptionStoreError> {
        info!("Running database migrations");

        let pool = self.pool().await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn connect_options(&self) -> Result<MySqlConnectOptions, CaptionStoreError> {
        match &self.source {
            ConnectSource::Url(options) => Ok(options.clone()),
            ConnectSource::Secret(secrets) => {
                let credentials = secrets.database_credentials().await?;
                Ok(credentials.connect_options())
            }
        }
    }

    /// Current pool, building it if needed
    async fn pool(&self) -> Result<MySqlPool, CaptionStoreError> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let options = self.connect_options().await?;
        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(self.config.idle_timeout_secs)))
            .test_before_acquire(true)
            .connect_lazy_with(options);

        info!(max_connections = self.config.max_connections, "MySQL pool created");

        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Drop the pool after a connection-level failure
    async fn invalidate_on(&self, err: &sqlx::Error) {
        if !is_connection_error(err) {
            return;
        }

        let stale = self.pool.write().await.take();
        if let Some(pool) = stale {
            warn!(error = %err, "Discarding MySQL pool after connection failure");
            pool.close().await;
        }
    }

    async fn observe<T>(&self, result: Result<T, sqlx::Error>) -> Result<T, CaptionStoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.invalidate_on(&e).await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl CaptionStore for MySqlCaptionStore {
    #[instrument(skip(self))]
    async fn get_caption(&self, image_key: &str) -> Result<Option<String>, CaptionStoreError> {
        let pool = self.pool().await?;

        let row = self
            .observe(
                sqlx::query_as::<_, (Option<String>,)>(
                    "SELECT caption FROM captions WHERE image_key = ?",
                )
                .bind(image_key)
                .fetch_optional(&pool)
                .await,
            )
            .await?;

        let caption = row.and_then(|(caption,)| caption).filter(|c| !c.is_empty());
        debug!(found = caption.is_some(), "Caption lookup finished");

        Ok(caption)
    }

    #[instrument(skip(self))]
    async fn list_captions(&self) -> Result<Vec<CaptionRecord>, CaptionStoreError> {
        let pool = self.pool().await?;

        let records = self
            .observe(
                sqlx::query_as::<_, CaptionRecord>(
                    r#"
                    SELECT image_key, caption, uploaded_at
                    FROM captions
                    ORDER BY uploaded_at DESC
                    "#,
                )
                .fetch_all(&pool)
                .await,
            )
            .await?;

        debug!(count = records.len(), "Listed caption records");
        Ok(records)
    }

    async fn ping(&self) -> Result<(), CaptionStoreError> {
        let pool = self.pool().await?;

        self.observe(sqlx::query("SELECT 1").execute(&pool).await)
            .await?;

        Ok(())
    }
}

/// Failures that suggest the pool itself (host, credentials) is no longer usable
fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => true,
        // 28000: access denied, typically a rotated password
        sqlx::Error::Database(db) => db.code().as_deref() == Some("28000"),
        _ => false,
    }
}
