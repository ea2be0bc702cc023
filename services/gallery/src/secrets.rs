use async_trait::async_trait;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::Client as SecretsClient;
use aws_types::region::Region;
use aws_types::SdkConfig;
use serde::Deserialize;
use sqlx::mysql::MySqlConnectOptions;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

/// Errors from credential retrieval
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret {secret_id} unavailable: {message}")]
    Unavailable { secret_id: String, message: String },

    #[error("Secret {secret_id} is malformed: {message}")]
    Malformed { secret_id: String, message: String },
}

/// Database credentials as stored in the secret's JSON `SecretString`
#[derive(Clone, Deserialize)]
pub struct DbCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "dbname")]
    pub database: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl DbCredentials {
    /// Parse the JSON document stored in the secret
    pub fn from_secret_string(secret_id: &str, raw: &str) -> Result<Self, SecretError> {
        serde_json::from_str(raw).map_err(|e| SecretError::Malformed {
            secret_id: secret_id.to_string(),
            message: e.to_string(),
        })
    }

    /// MySQL connect options for these credentials
    pub fn connect_options(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database);

        match self.port {
            Some(port) => options.port(port),
            None => options,
        }
    }
}

// Keep the password out of logs.
impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("port", &self.port)
            .finish()
    }
}

/// Source of database credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Resolve the current credentials; never cached by the provider
    async fn database_credentials(&self) -> Result<DbCredentials, SecretError>;
}

/// Secrets Manager backed provider
pub struct AwsSecretProvider {
    client: SecretsClient,
    secret_id: String,
}

impl AwsSecretProvider {
    /// Create a provider for `secret_id` in `region`
    pub fn new(sdk_config: &SdkConfig, secret_id: &str, region: &str) -> Self {
        let config = aws_sdk_secretsmanager::config::Builder::from(sdk_config)
            .region(Region::new(region.to_string()))
            .build();

        Self {
            client: SecretsClient::from_conf(config),
            secret_id: secret_id.to_string(),
        }
    }
}

#[async_trait]
impl SecretProvider for AwsSecretProvider {
    #[instrument(skip(self), fields(secret_id = %self.secret_id))]
    async fn database_credentials(&self) -> Result<DbCredentials, SecretError> {
        let response = self
            .client
            .get_secret_value()
            .secret_id(&self.secret_id)
            .send()
            .await
            .map_err(|e| SecretError::Unavailable {
                secret_id: self.secret_id.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let raw = response.secret_string().ok_or_else(|| SecretError::Malformed {
            secret_id: self.secret_id.clone(),
            message: "secret has no string value".to_string(),
        })?;

        let credentials = DbCredentials::from_secret_string(&self.secret_id, raw)?;

        debug!(
            host = %credentials.host,
            database = %credentials.database,
            "Resolved database credentials"
        );

        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rds_secret() {
        let raw = r#"{
            "username": "admin",
            "password": "hunter2",
            "engine": "mysql",
            "host": "db.example.internal",
            "port": 3306,
            "dbname": "gallery"
        }"#;

        let credentials = DbCredentials::from_secret_string("gallery/db", raw).unwrap();
        assert_eq!(credentials.host, "db.example.internal");
        assert_eq!(credentials.username, "admin");
        assert_eq!(credentials.database, "gallery");
        assert_eq!(credentials.port, Some(3306));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let raw = r#"{"username": "admin", "password": "x", "host": "db"}"#;

        match DbCredentials::from_secret_string("gallery/db", raw) {
            Err(SecretError::Malformed { secret_id, message }) => {
                assert_eq!(secret_id, "gallery/db");
                assert!(message.contains("dbname"));
            }
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_debug_hides_password() {
        let credentials = DbCredentials {
            host: "db".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            database: "gallery".to_string(),
            port: None,
        };

        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("admin"));
    }
}
