//! Configuration module
//!
//! Environment driven configuration for the upload service: HTTP server,
//! session store, storage backend, transfer protocol limits and the job queue.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{DEFAULT_BLOCKED_EXTENSIONS, MAX_FILENAME_LENGTH};
use crate::storage_types::StorageBackend;
use crate::validation::UploadPolicy;

const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const SERVER_PORT: u16 = 3000;
const HTTP_CONCURRENCY_LIMIT: usize = 10_000;
const DEFAULT_STORAGE_BACKEND: StorageBackend = StorageBackend::S3;
const MIB: u64 = 1024 * 1024;

const UPLOAD_MAX_SIZE_MB: u64 = 5120;
const UPLOAD_MAX_CHUNK_SIZE_MB: u64 = 64;
const UPLOAD_SESSION_TTL_SECS: u64 = 86_400;
const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 3600;
const UPLOAD_LOCK_TTL_SECS: u64 = 300;

const JOB_QUEUE_WORKERS: usize = 4;
const JOB_MAX_ATTEMPTS: i32 = 5;
const JOB_BACKOFF_BASE_MS: u64 = 2000;
const JOB_LEASE_SECS: u64 = 30;
const JOB_MAX_STALLED_COUNT: i32 = 1;
const JOB_STALLED_CHECK_INTERVAL_SECS: u64 = 30;
const JOB_POLL_INTERVAL_MS: u64 = 1000;
const JOB_TIMEOUT_SECS: u64 = 600;
const STORAGE_OPERATION_TIMEOUT_SECS: u64 = 120;
const JOB_COMPLETED_RETENTION_HOURS: i64 = 24;
const JOB_COMPLETED_RETENTION_COUNT: i64 = 1000;
const JOB_FAILED_RETENTION_DAYS: i64 = 7;
const JOB_RETENTION_INTERVAL_SECS: u64 = 3600;
const SIGNED_URL_EXPIRY_SECS: u64 = 7 * 24 * 3600;

/// Where sessions, claims, jobs and submissions are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStore {
    Postgres,
    /// Process-local maps; suitable for a single instance and for tests.
    Memory,
}

impl FromStr for SessionStore {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(SessionStore::Postgres),
            "memory" => Ok(SessionStore::Memory),
            _ => Err(anyhow::anyhow!("Invalid session store: {}", s)),
        }
    }
}

impl fmt::Display for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStore::Postgres => write!(f, "postgres"),
            SessionStore::Memory => write!(f, "memory"),
        }
    }
}

/// Base configuration shared by every binary
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
    /// Requests served concurrently before new ones wait
    pub http_concurrency_limit: usize,
    /// `text` or `json`
    pub log_format: String,
}

#[derive(Clone, Debug)]
pub struct UploadServiceConfig {
    pub base: BaseConfig,
    pub database_url: Option<String>,
    pub session_store: SessionStore,
    // Storage configuration
    pub storage_backend: StorageBackend,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>, // S3-compatible providers (MinIO, R2, ...)
    pub aws_region: Option<String>,
    pub local_storage_path: Option<String>,
    pub local_storage_base_url: Option<String>,
    pub signed_url_expiry_secs: u64,
    pub storage_operation_timeout_secs: u64,
    // Transfer protocol
    pub upload_base_path: String,
    pub upload_max_size_bytes: u64,
    pub upload_max_chunk_size_bytes: u64,
    pub upload_session_ttl_secs: u64,
    pub upload_blocked_extensions: Vec<String>,
    pub upload_sweep_interval_secs: u64,
    pub upload_lock_ttl_secs: u64,
    // Job queue
    pub job_queue_workers: usize,
    pub job_max_attempts: i32,
    pub job_backoff_base_ms: u64,
    pub job_lease_secs: u64,
    pub job_max_stalled_count: i32,
    pub job_stalled_check_interval_secs: u64,
    pub job_poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    pub job_completed_retention_hours: i64,
    pub job_completed_retention_count: i64,
    pub job_failed_retention_days: i64,
    /// Interval between retention pruning runs. 0 = disabled.
    pub job_retention_interval_secs: u64,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// A size given in MiB, as bytes. Overflow is a configuration error.
fn mebibytes(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default_mb: u64,
) -> Result<u64, anyhow::Error> {
    parse_or(lookup, key, default_mb)
        .checked_mul(MIB)
        .ok_or_else(|| anyhow::anyhow!("{} is too large", key))
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|s| !s.trim().is_empty())
}

impl UploadServiceConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, anyhow::Error> {
        let environment = lookup("ENVIRONMENT")
            .or_else(|| lookup("APP_ENV"))
            .unwrap_or_else(|| "development".to_string());

        let cors_origins_str = lookup("CORS_ORIGINS").unwrap_or_else(|| "*".to_string());
        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let server_port = match lookup("SERVER_PORT").or_else(|| lookup("PORT")) {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("SERVER_PORT must be a valid number"))?,
            None => SERVER_PORT,
        };

        let base = BaseConfig {
            server_port,
            cors_origins,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: parse_or(&lookup, "DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            environment,
            http_concurrency_limit: parse_or(&lookup, "HTTP_CONCURRENCY_LIMIT", HTTP_CONCURRENCY_LIMIT)
                .max(1),
            log_format: lookup("LOG_FORMAT")
                .unwrap_or_else(|| "text".to_string())
                .to_lowercase(),
        };

        let session_store = match non_empty(&lookup, "SESSION_STORE") {
            Some(s) => s.parse()?,
            None => SessionStore::Postgres,
        };

        let storage_backend = match non_empty(&lookup, "STORAGE_BACKEND") {
            Some(s) => s.parse()?,
            None => DEFAULT_STORAGE_BACKEND,
        };

        let upload_blocked_extensions = lookup("UPLOAD_BLOCKED_EXTENSIONS")
            .map(|s| {
                s.split(',')
                    .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                DEFAULT_BLOCKED_EXTENSIONS
                    .iter()
                    .map(|e| e.to_string())
                    .collect()
            });

        let upload_base_path = lookup("UPLOAD_BASE_PATH")
            .map(|p| format!("/{}", p.trim().trim_matches('/')))
            .unwrap_or_else(|| "/files".to_string());

        Ok(Self {
            base,
            database_url: non_empty(&lookup, "DATABASE_URL"),
            session_store,
            storage_backend,
            s3_bucket: non_empty(&lookup, "S3_BUCKET"),
            s3_region: non_empty(&lookup, "S3_REGION"),
            s3_endpoint: non_empty(&lookup, "S3_ENDPOINT"),
            aws_region: non_empty(&lookup, "AWS_REGION"),
            local_storage_path: non_empty(&lookup, "LOCAL_STORAGE_PATH"),
            local_storage_base_url: non_empty(&lookup, "LOCAL_STORAGE_BASE_URL"),
            signed_url_expiry_secs: parse_or(&lookup, "SIGNED_URL_EXPIRY_SECS", SIGNED_URL_EXPIRY_SECS),
            storage_operation_timeout_secs: parse_or(
                &lookup,
                "STORAGE_OPERATION_TIMEOUT_SECS",
                STORAGE_OPERATION_TIMEOUT_SECS,
            ),
            upload_base_path,
            upload_max_size_bytes: mebibytes(&lookup, "UPLOAD_MAX_SIZE_MB", UPLOAD_MAX_SIZE_MB)?,
            upload_max_chunk_size_bytes: mebibytes(
                &lookup,
                "UPLOAD_MAX_CHUNK_SIZE_MB",
                UPLOAD_MAX_CHUNK_SIZE_MB,
            )?,
            upload_session_ttl_secs: parse_or(&lookup, "UPLOAD_SESSION_TTL_SECS", UPLOAD_SESSION_TTL_SECS),
            upload_blocked_extensions,
            upload_sweep_interval_secs: parse_or(
                &lookup,
                "UPLOAD_SWEEP_INTERVAL_SECS",
                UPLOAD_SWEEP_INTERVAL_SECS,
            ),
            upload_lock_ttl_secs: parse_or(&lookup, "UPLOAD_LOCK_TTL_SECS", UPLOAD_LOCK_TTL_SECS),
            job_queue_workers: parse_or(&lookup, "JOB_QUEUE_WORKERS", JOB_QUEUE_WORKERS),
            job_max_attempts: parse_or(&lookup, "JOB_MAX_ATTEMPTS", JOB_MAX_ATTEMPTS),
            job_backoff_base_ms: parse_or(&lookup, "JOB_BACKOFF_BASE_MS", JOB_BACKOFF_BASE_MS),
            job_lease_secs: parse_or(&lookup, "JOB_LEASE_SECS", JOB_LEASE_SECS),
            job_max_stalled_count: parse_or(&lookup, "JOB_MAX_STALLED_COUNT", JOB_MAX_STALLED_COUNT),
            job_stalled_check_interval_secs: parse_or(
                &lookup,
                "JOB_STALLED_CHECK_INTERVAL_SECS",
                JOB_STALLED_CHECK_INTERVAL_SECS,
            ),
            job_poll_interval_ms: parse_or(&lookup, "JOB_POLL_INTERVAL_MS", JOB_POLL_INTERVAL_MS),
            job_timeout_secs: parse_or(&lookup, "JOB_TIMEOUT_SECS", JOB_TIMEOUT_SECS),
            job_completed_retention_hours: parse_or(
                &lookup,
                "JOB_COMPLETED_RETENTION_HOURS",
                JOB_COMPLETED_RETENTION_HOURS,
            ),
            job_completed_retention_count: parse_or(
                &lookup,
                "JOB_COMPLETED_RETENTION_COUNT",
                JOB_COMPLETED_RETENTION_COUNT,
            ),
            job_failed_retention_days: parse_or(
                &lookup,
                "JOB_FAILED_RETENTION_DAYS",
                JOB_FAILED_RETENTION_DAYS,
            ),
            job_retention_interval_secs: parse_or(
                &lookup,
                "JOB_RETENTION_INTERVAL_SECS",
                JOB_RETENTION_INTERVAL_SECS,
            ),
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.session_store == SessionStore::Postgres {
            match &self.database_url {
                Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {}
                _ => {
                    return Err(anyhow::anyhow!(
                        "DATABASE_URL must be a valid PostgreSQL connection string when SESSION_STORE=postgres"
                    ))
                }
            }
        }

        match self.storage_backend {
            StorageBackend::S3 => {
                if self.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
                if self.s3_region.is_none() && self.aws_region.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_REGION or AWS_REGION must be set when using S3 storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_storage_path.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
                if self.local_storage_base_url.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_BASE_URL must be set when using local storage backend"
                    ));
                }
            }
            StorageBackend::Memory => {}
        }

        if self.upload_max_size_bytes == 0 {
            return Err(anyhow::anyhow!("UPLOAD_MAX_SIZE_MB must be greater than 0"));
        }
        if self.upload_max_chunk_size_bytes == 0 {
            return Err(anyhow::anyhow!(
                "UPLOAD_MAX_CHUNK_SIZE_MB must be greater than 0"
            ));
        }
        if self.upload_session_ttl_secs == 0 {
            return Err(anyhow::anyhow!(
                "UPLOAD_SESSION_TTL_SECS must be greater than 0"
            ));
        }
        if self.job_queue_workers == 0 {
            return Err(anyhow::anyhow!("JOB_QUEUE_WORKERS must be at least 1"));
        }
        if self.job_max_attempts < 1 {
            return Err(anyhow::anyhow!("JOB_MAX_ATTEMPTS must be at least 1"));
        }
        if self.job_backoff_base_ms == 0 {
            return Err(anyhow::anyhow!("JOB_BACKOFF_BASE_MS must be greater than 0"));
        }
        if self.job_lease_secs == 0 {
            return Err(anyhow::anyhow!("JOB_LEASE_SECS must be greater than 0"));
        }
        if self.job_max_stalled_count < 0 {
            return Err(anyhow::anyhow!("JOB_MAX_STALLED_COUNT cannot be negative"));
        }
        if !matches!(self.base.log_format.as_str(), "text" | "json") {
            return Err(anyhow::anyhow!("LOG_FORMAT must be 'text' or 'json'"));
        }

        Ok(())
    }
}

/// Application configuration for the upload service.
#[derive(Clone, Debug)]
pub struct Config(pub Box<UploadServiceConfig>);

impl Config {
    fn inner(&self) -> &UploadServiceConfig {
        &self.0
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = UploadServiceConfig::from_env()?;
        config.validate()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.inner().validate()
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.inner().base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn server_port(&self) -> u16 {
        self.inner().base.server_port
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.inner().base.cors_origins
    }

    pub fn db_max_connections(&self) -> u32 {
        self.inner().base.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.inner().base.db_timeout_seconds
    }

    pub fn http_concurrency_limit(&self) -> usize {
        self.inner().base.http_concurrency_limit
    }

    pub fn environment(&self) -> &str {
        &self.inner().base.environment
    }

    pub fn log_json(&self) -> bool {
        self.inner().base.log_format == "json"
    }

    pub fn database_url(&self) -> Option<&str> {
        self.inner().database_url.as_deref()
    }

    pub fn session_store(&self) -> SessionStore {
        self.inner().session_store
    }

    pub fn storage_backend(&self) -> StorageBackend {
        self.inner().storage_backend
    }

    pub fn s3_bucket(&self) -> Option<&str> {
        self.inner().s3_bucket.as_deref()
    }

    /// S3 region, falling back to `AWS_REGION`.
    pub fn s3_region(&self) -> Option<&str> {
        self.inner()
            .s3_region
            .as_deref()
            .or(self.inner().aws_region.as_deref())
    }

    pub fn s3_endpoint(&self) -> Option<&str> {
        self.inner().s3_endpoint.as_deref()
    }

    pub fn local_storage_path(&self) -> Option<&str> {
        self.inner().local_storage_path.as_deref()
    }

    pub fn local_storage_base_url(&self) -> Option<&str> {
        self.inner().local_storage_base_url.as_deref()
    }

    pub fn signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.inner().signed_url_expiry_secs)
    }

    pub fn storage_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.inner().storage_operation_timeout_secs)
    }

    pub fn upload_base_path(&self) -> &str {
        &self.inner().upload_base_path
    }

    pub fn upload_max_size_bytes(&self) -> u64 {
        self.inner().upload_max_size_bytes
    }

    pub fn upload_max_chunk_size_bytes(&self) -> u64 {
        self.inner().upload_max_chunk_size_bytes
    }

    pub fn upload_session_ttl(&self) -> Duration {
        Duration::from_secs(self.inner().upload_session_ttl_secs)
    }

    pub fn upload_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.inner().upload_sweep_interval_secs)
    }

    pub fn upload_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.inner().upload_lock_ttl_secs)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_size: self.inner().upload_max_size_bytes,
            blocked_extensions: self.inner().upload_blocked_extensions.clone(),
            max_filename_length: MAX_FILENAME_LENGTH,
        }
    }

    pub fn job_queue_workers(&self) -> usize {
        self.inner().job_queue_workers
    }

    pub fn job_max_attempts(&self) -> i32 {
        self.inner().job_max_attempts
    }

    pub fn job_backoff_base(&self) -> Duration {
        Duration::from_millis(self.inner().job_backoff_base_ms)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.inner().job_lease_secs)
    }

    pub fn job_max_stalled_count(&self) -> i32 {
        self.inner().job_max_stalled_count
    }

    pub fn job_stalled_check_interval(&self) -> Duration {
        Duration::from_secs(self.inner().job_stalled_check_interval_secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.inner().job_poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.inner().job_timeout_secs)
    }

    pub fn job_completed_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.inner().job_completed_retention_hours)
    }

    pub fn job_completed_retention_count(&self) -> i64 {
        self.inner().job_completed_retention_count
    }

    pub fn job_failed_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.inner().job_failed_retention_days)
    }

    pub fn job_retention_interval_secs(&self) -> u64 {
        self.inner().job_retention_interval_secs
    }
}
