//! Configuration loading from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `STOCKLEDGER_RETRY_MAX_ATTEMPTS` | 3 |
//! | `STOCKLEDGER_RETRY_BASE_DELAY_MS` | 50 |
//! | `STOCKLEDGER_RETRY_MAX_DELAY_MS` | 1000 |
//! | `STOCKLEDGER_DEFAULT_REORDER_LEVEL` | 10 |
//! | `USE_PERSISTENT_STORES` | false |
//! | `DATABASE_URL` | required when `USE_PERSISTENT_STORES=true` |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// Which document store to run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub retry: RetryPolicy,
    /// Reorder level for products that do not set one.
    pub default_reorder_level: i64,
    pub store: StoreBackend,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(50),
                Duration::from_millis(1000),
            ),
            default_reorder_level: 10,
            store: StoreBackend::InMemory,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_attempts: u32 = parse_or(
            &lookup,
            "STOCKLEDGER_RETRY_MAX_ATTEMPTS",
            defaults.retry.max_attempts,
        )?;
        let base_ms: u64 = parse_or(&lookup, "STOCKLEDGER_RETRY_BASE_DELAY_MS", 50)?;
        let max_ms: u64 = parse_or(&lookup, "STOCKLEDGER_RETRY_MAX_DELAY_MS", 1000)?;
        if max_ms < base_ms {
            return Err(ConfigError::Invalid {
                name: "STOCKLEDGER_RETRY_MAX_DELAY_MS",
                value: max_ms.to_string(),
                reason: format!("must be at least STOCKLEDGER_RETRY_BASE_DELAY_MS ({base_ms})"),
            });
        }

        let default_reorder_level: i64 = parse_or(
            &lookup,
            "STOCKLEDGER_DEFAULT_REORDER_LEVEL",
            defaults.default_reorder_level,
        )?;
        if default_reorder_level < 0 {
            return Err(ConfigError::Invalid {
                name: "STOCKLEDGER_DEFAULT_REORDER_LEVEL",
                value: default_reorder_level.to_string(),
                reason: "cannot be negative".to_string(),
            });
        }

        let persistent: bool = parse_or(&lookup, "USE_PERSISTENT_STORES", false)?;
        let store = if persistent {
            let database_url = lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            StoreBackend::Postgres { database_url }
        } else {
            StoreBackend::InMemory
        };

        Ok(Self {
            retry: RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            ),
            default_reorder_level,
            store,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Open the configured store. Postgres stores get their schema created.
pub async fn build_store(config: &LedgerConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match &config.store {
        StoreBackend::InMemory => {
            tracing::info!("using in-memory document store");
            Ok(Arc::new(InMemoryDocumentStore::new()))
        }
        StoreBackend::Postgres { database_url } => {
            let store = PostgresDocumentStore::connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to create stock ledger schema")?;
            tracing::info!("using Postgres document store");
            Ok(Arc::new(store))
        }
    }
}
