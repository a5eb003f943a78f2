use crate::error::ImagingError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the imaging store.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upload/download transfer tuning
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// S3 bucket name for dataset storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; usually filled in from a credentials file
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Transfer tuning shared by the upload and download coordinators
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Concurrent blob writes per upload
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Concurrent blob reads per download
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    /// Initial backoff delay for transient store errors in milliseconds
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Total retry budget per blob write in milliseconds
    #[serde(default = "default_retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,
}

// Default value functions
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_upload_concurrency() -> usize {
    10
}

fn default_download_concurrency() -> usize {
    10
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_retry_max_elapsed_ms() -> u64 {
    60_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: default_upload_concurrency(),
            download_concurrency: default_download_concurrency(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_max_elapsed_ms: default_retry_max_elapsed_ms(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/imaging").required(false))
            .add_source(config::File::with_name("/etc/imaging-db/config").required(false))
            // Override with environment variables
            // IMAGING__STORAGE__BUCKET -> storage.bucket
            .add_source(
                config::Environment::with_prefix("IMAGING")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl TransferConfig {
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.retry_max_elapsed_ms)
    }
}

/// Database login credentials as stored in the JSON credentials file handed
/// to the CLIs.
#[derive(Debug, Clone, Deserialize)]
pub struct DbCredentials {
    pub drivername: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
}

impl DbCredentials {
    /// Read credentials from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ImagingError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ImagingError::Permanent(format!(
                "invalid credentials file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Render the credentials as a connection URI.
    pub fn to_uri(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}",
            self.drivername, self.username, self.password, self.host, self.port, self.dbname
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_upload_concurrency(), 10);
        assert_eq!(default_retry_initial_delay_ms(), 500);
        assert_eq!(default_max_connections(), 10);
        assert!(default_run_migrations());
    }

    #[test]
    fn test_credentials_to_uri() {
        let credentials = DbCredentials {
            drivername: "postgres".to_string(),
            username: "user".to_string(),
            password: "pwd".to_string(),
            host: "db_host".to_string(),
            port: 666,
            dbname: "db_name".to_string(),
        };
        assert_eq!(credentials.to_uri(), "postgres://user:pwd@db_host:666/db_name");
    }
}
