//! Configuration loading from the process environment.

use std::time::Duration;

/// Which store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required when STOCKROOM_STORE=postgres")]
    Missing { var: &'static str },
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the propagation outbox worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// How long a claimed job stays invisible to other workers.
    pub lease: Duration,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            lease: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub propagation: PropagationSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            database_url: None,
            db_max_connections: 10,
            propagation: PropagationSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let store = match lookup("STOCKROOM_STORE").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => StoreKind::Memory,
            Some("postgres") => StoreKind::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "STOCKROOM_STORE",
                    value: other.to_string(),
                    reason: "expected memory or postgres".to_string(),
                });
            }
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if store == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing { var: "DATABASE_URL" });
        }

        let db_max_connections = parse_number(
            &lookup,
            "STOCKROOM_DB_MAX_CONNECTIONS",
            u64::from(defaults.db_max_connections),
        )?;
        let poll_ms = parse_number(
            &lookup,
            "STOCKROOM_PROPAGATION_POLL_MS",
            defaults.propagation.poll_interval.as_millis() as u64,
        )?;
        let max_attempts = parse_number(
            &lookup,
            "STOCKROOM_PROPAGATION_MAX_ATTEMPTS",
            u64::from(defaults.propagation.max_attempts),
        )?;
        let lease_secs = parse_number(
            &lookup,
            "STOCKROOM_PROPAGATION_LEASE_SECS",
            defaults.propagation.lease.as_secs(),
        )?;

        Ok(Self {
            store,
            database_url,
            db_max_connections: to_u32("STOCKROOM_DB_MAX_CONNECTIONS", db_max_connections)?,
            propagation: PropagationSettings {
                poll_interval: Duration::from_millis(poll_ms),
                max_attempts: to_u32("STOCKROOM_PROPAGATION_MAX_ATTEMPTS", max_attempts)?,
                lease: Duration::from_secs(lease_secs),
            },
        })
    }
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn to_u32(var: &'static str, value: u64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: "out of range".to_string(),
    })
}
