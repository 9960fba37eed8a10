//! Configuration management for Identity Service
//!
//! Loads settings from environment variables, with a `.env` file picked up in
//! debug builds for local development.
//!
//! # Example
//!
//! ```no_run
//! use identity_service::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("Access token TTL: {}s", settings.jwt.access_token_ttl_secs);
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use crypto_core::MIN_SECRET_KEY_SIZE;
use db_pool::DbConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const SERVICE_NAME: &str = "identity-service";

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DbConfig,
    pub redis: RedisSettings,
    pub jwt: JwtSettings,
    pub worker: LoginWorkerSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Load and validate settings from the environment.
    pub fn load() -> Result<Self> {
        // Load .env file in development
        if cfg!(debug_assertions) && dotenvy::dotenv().is_ok() {
            info!("Loaded .env file for development");
        }

        let settings = Settings {
            database: DbConfig::from_env(SERVICE_NAME)
                .map_err(anyhow::Error::msg)
                .context("Invalid database configuration")?,
            redis: RedisSettings::from_env()?,
            jwt: JwtSettings::from_env()?,
            worker: LoginWorkerSettings::from_env()?,
            log: LogSettings::from_env(),
        };
        settings.validate()?;

        Ok(settings)
    }

    /// Reject values that would only fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.jwt.secret_key.len() < MIN_SECRET_KEY_SIZE {
            bail!(
                "JWT_SECRET_KEY must be at least {} bytes",
                MIN_SECRET_KEY_SIZE
            );
        }
        if self.jwt.access_token_ttl_secs <= 0 || self.jwt.refresh_token_ttl_secs <= 0 {
            bail!("Token TTLs must be positive");
        }
        if self.worker.batch_size == 0 {
            bail!("LOGIN_WORKER_BATCH_SIZE must be greater than zero");
        }
        if self.worker.interval_ms == 0 {
            bail!("LOGIN_WORKER_INTERVAL_MS must be greater than zero");
        }
        if self.worker.max_attempts <= 0 {
            bail!("LOGIN_WORKER_MAX_ATTEMPTS must be greater than zero");
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", key))
}

/// Task queue broker settings
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub namespace: String,
    pub queue: String,
    pub dedup_ttl_secs: u64,
}

impl RedisSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("REDIS_URL").context("REDIS_URL must be set")?,
            namespace: env::var("TASK_QUEUE_NAMESPACE").unwrap_or_else(|_| "identity".to_string()),
            queue: env::var("TASK_QUEUE_NAME").unwrap_or_else(|_| "default".to_string()),
            dedup_ttl_secs: parse_env("TASK_DEDUP_TTL_SECS", "86400")?,
        })
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

/// Token signing settings
#[derive(Clone)]
pub struct JwtSettings {
    pub secret_key: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
}

impl std::fmt::Debug for JwtSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSettings")
            .field("secret_key", &"<redacted>")
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .finish()
    }
}

impl JwtSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            secret_key: env::var("JWT_SECRET_KEY").context("JWT_SECRET_KEY must be set")?,
            access_token_ttl_secs: parse_env("ACCESS_TOKEN_TTL_SECS", "900")?,
            refresh_token_ttl_secs: parse_env("REFRESH_TOKEN_TTL_SECS", "604800")?,
        })
    }
}

/// Login notification worker settings
#[derive(Debug, Clone)]
pub struct LoginWorkerSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub batch_size: u32,
    pub max_retries: u32,
    pub max_attempts: i32,
    pub shutdown_grace_secs: u64,
}

impl LoginWorkerSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: parse_env("LOGIN_WORKER_ENABLED", "true")?,
            interval_ms: parse_env("LOGIN_WORKER_INTERVAL_MS", "10000")?,
            batch_size: parse_env("LOGIN_WORKER_BATCH_SIZE", "1000")?,
            max_retries: parse_env("LOGIN_WORKER_MAX_RETRIES", "5")?,
            max_attempts: parse_env("LOGIN_WORKER_MAX_ATTEMPTS", "5")?,
            shutdown_grace_secs: parse_env("LOGIN_WORKER_SHUTDOWN_GRACE_SECS", "10")?,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let format = match env::var("LOG_FORMAT").as_deref() {
            Ok("pretty") | Ok("text") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            filter: env::var("RUST_LOG").unwrap_or_else(|_| {
                "identity_service=info,transactional_outbox=info,info".to_string()
            }),
            format,
        }
    }
}
