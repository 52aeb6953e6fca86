//! Environment-driven service configuration.
//!
//! Backend choices are made once at process start. An unknown backend value
//! aborts startup with a descriptive error rather than falling back
//! silently.

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageKind {
    Memory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerKind {
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub storage: StorageKind,
    pub streamer: StreamerKind,
}

impl ServiceConfig {
    /// Read configuration from the environment (`.env` honored).
    ///
    /// * `SIDEKICK_STORAGE` — `memory` (default) or `postgres`
    /// * `DATABASE_URL` — required when storage is `postgres`
    /// * `SIDEKICK_STREAMER` — `memory` (default)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(
            std::env::var("SIDEKICK_STORAGE").ok().as_deref(),
            std::env::var("DATABASE_URL").ok(),
            std::env::var("SIDEKICK_STREAMER").ok().as_deref(),
        )
    }

    fn from_vars(
        storage: Option<&str>,
        database_url: Option<String>,
        streamer: Option<&str>,
    ) -> Result<Self> {
        let storage = match storage.unwrap_or("memory") {
            "memory" => StorageKind::Memory,
            "postgres" => StorageKind::Postgres {
                database_url: database_url
                    .context("DATABASE_URL is required when SIDEKICK_STORAGE=postgres")?,
            },
            other => bail!(
                "unknown SIDEKICK_STORAGE backend {other:?} (expected \"memory\" or \"postgres\")"
            ),
        };

        let streamer = match streamer.unwrap_or("memory") {
            "memory" => StreamerKind::Memory,
            other => bail!("unknown SIDEKICK_STREAMER backend {other:?} (expected \"memory\")"),
        };

        Ok(Self { storage, streamer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_memory() {
        let config = ServiceConfig::from_vars(None, None, None).unwrap();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.streamer, StreamerKind::Memory);
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let err = ServiceConfig::from_vars(Some("postgres"), None, None).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let config = ServiceConfig::from_vars(
            Some("postgres"),
            Some("postgres://localhost/sidekick".to_string()),
            None,
        )
        .unwrap();
        assert!(matches!(config.storage, StorageKind::Postgres { .. }));
    }

    #[test]
    fn test_unknown_backend_is_fatal() {
        let err = ServiceConfig::from_vars(Some("redis"), None, None).unwrap_err();
        assert!(err.to_string().contains("unknown SIDEKICK_STORAGE"));

        let err = ServiceConfig::from_vars(None, None, Some("kafka")).unwrap_err();
        assert!(err.to_string().contains("unknown SIDEKICK_STREAMER"));
    }
}
