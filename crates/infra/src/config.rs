//! Environment-driven configuration.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATABASE_URL` | unset | Postgres connection string; unset selects the in-memory store |
//! | `EVENTLINE_DB_MAX_CONNECTIONS` | `5` | Pool size |
//! | `EVENTLINE_JOB_POLL_INTERVAL_MS` | `100` | Executor idle poll interval |
//! | `EVENTLINE_JOB_QUEUE` | unset | Restrict the executor to one queue |

use std::time::Duration;

use thiserror::Error;

use crate::jobs::JobExecutorConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct InfraConfig {
    /// `None` means run against in-memory stores.
    pub postgres: Option<PostgresConfig>,
    pub executor: JobExecutorConfig,
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_connections = parse_positive(&lookup, "EVENTLINE_DB_MAX_CONNECTIONS", 5)?;
        let poll_ms = parse_positive(&lookup, "EVENTLINE_JOB_POLL_INTERVAL_MS", 100)?;

        let postgres = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|database_url| PostgresConfig {
                database_url,
                max_connections: max_connections as u32,
            });

        let mut executor = JobExecutorConfig::default().with_poll_interval(Duration::from_millis(poll_ms));
        if let Some(queue) = lookup("EVENTLINE_JOB_QUEUE").filter(|q| !q.trim().is_empty()) {
            executor = executor.with_queue(queue);
        }

        Ok(Self { postgres, executor })
    }
}

fn parse_positive<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(n) if n > 0 && n <= u64::from(u32::MAX) => Ok(n),
            _ => Err(ConfigError::InvalidNumber { var, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_in_memory() {
        let config = InfraConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.postgres.is_none());
        assert_eq!(config.executor.poll_interval, Duration::from_millis(100));
        assert_eq!(config.executor.queue, None);
    }

    #[test]
    fn reads_postgres_and_executor_settings() {
        let config = InfraConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/eventline"),
            ("EVENTLINE_DB_MAX_CONNECTIONS", "12"),
            ("EVENTLINE_JOB_POLL_INTERVAL_MS", "250"),
            ("EVENTLINE_JOB_QUEUE", "projections"),
        ]))
        .unwrap();

        assert_eq!(
            config.postgres,
            Some(PostgresConfig {
                database_url: "postgres://localhost/eventline".to_string(),
                max_connections: 12,
            })
        );
        assert_eq!(config.executor.poll_interval, Duration::from_millis(250));
        assert_eq!(config.executor.queue.as_deref(), Some("projections"));
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = InfraConfig::from_lookup(lookup(&[("EVENTLINE_DB_MAX_CONNECTIONS", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: "EVENTLINE_DB_MAX_CONNECTIONS",
                value: "lots".to_string()
            }
        );
    }
}
