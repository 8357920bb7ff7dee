use log::info;
use std::{env, str::FromStr, time::Duration};

use crate::error::ConfigError;

const DEFAULT_DATABASE_URL: &str = "sqlite:trusty_tally.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub admin_ids: Vec<String>,
    pub subscriber_queue_capacity: usize,
    pub actor_mailbox_capacity: usize,
    pub tick_interval: Duration,
    pub audit_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: 5,
            admin_ids: Vec::new(),
            subscriber_queue_capacity: 64,
            actor_mailbox_capacity: 256,
            tick_interval: Duration::from_secs(60),
            audit_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let admin_ids = lookup("ADMIN_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: try_load(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            admin_ids,
            subscriber_queue_capacity: positive(
                &lookup,
                "SUBSCRIBER_QUEUE_CAPACITY",
                defaults.subscriber_queue_capacity,
            )?,
            actor_mailbox_capacity: positive(
                &lookup,
                "ACTOR_MAILBOX_CAPACITY",
                defaults.actor_mailbox_capacity,
            )?,
            tick_interval: Duration::from_secs(positive(
                &lookup,
                "TICK_INTERVAL_SECONDS",
                defaults.tick_interval.as_secs(),
            )?),
            audit_interval: Duration::from_secs(positive(
                &lookup,
                "AUDIT_INTERVAL_SECONDS",
                defaults.audit_interval.as_secs(),
            )?),
        })
    }
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        None => {
            info!("{key} not set, using default");
            Ok(default)
        }
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + ToString,
{
    let value = try_load(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.subscriber_queue_capacity, 64);
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert!(config.admin_ids.is_empty());
    }

    #[test]
    fn parses_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("ADMIN_IDS", "alice, bob,,"),
            ("SUBSCRIBER_QUEUE_CAPACITY", "8"),
            ("TICK_INTERVAL_SECONDS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.admin_ids, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(config.subscriber_queue_capacity, 8);
        assert_eq!(config.tick_interval, Duration::from_secs(5));
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let garbage = Config::from_lookup(lookup(&[("DB_MAX_CONNECTIONS", "many")]));
        assert_eq!(
            garbage.unwrap_err(),
            ConfigError::Invalid {
                key: "DB_MAX_CONNECTIONS".to_string(),
                value: "many".to_string()
            }
        );

        let zero = Config::from_lookup(lookup(&[("SUBSCRIBER_QUEUE_CAPACITY", "0")]));
        assert!(zero.is_err());
    }
}
