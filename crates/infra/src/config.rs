//! Configuration loading.
//!
//! Read once at startup from the environment. `from_lookup` takes any key
//! lookup so tests never touch process-wide state.

use thiserror::Error;

pub const USE_PERSISTENT_STORES: &str = "USE_PERSISTENT_STORES";
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DATABASE_MAX_CONNECTIONS: &str = "DATABASE_MAX_CONNECTIONS";

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process-local stores (dev/test). Seat state is lost on restart.
    InMemory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationConfig {
    pub storage: StorageBackend,
}

impl ReservationConfig {
    pub fn in_memory() -> Self {
        Self {
            storage: StorageBackend::InMemory,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let persistent = match lookup(USE_PERSISTENT_STORES) {
            None => false,
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::Invalid {
                key: USE_PERSISTENT_STORES,
                value: raw,
            })?,
        };

        if !persistent {
            return Ok(Self::in_memory());
        }

        let database_url = lookup(DATABASE_URL)
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing(DATABASE_URL))?;

        let max_connections = match lookup(DATABASE_MAX_CONNECTIONS) {
            None => DEFAULT_MAX_CONNECTIONS,
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    key: DATABASE_MAX_CONNECTIONS,
                    value: raw,
                })?,
        };

        Ok(Self {
            storage: StorageBackend::Postgres {
                database_url,
                max_connections,
            },
        })
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.storage, StorageBackend::Postgres { .. })
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}
