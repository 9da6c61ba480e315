use std::time::Duration;

use crate::error::{RelayError, RelayResult};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DATABASE_URL: &str = "sqlite://dm_relay.db";
const DEFAULT_EXCHANGE: &str = "dm_relay";
const DEFAULT_PERSIST_TIMEOUT_SECS: u64 = 120;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub database_url: String,
    /// When unset the relay runs with the in-process broker.
    pub rabbitmq_url: Option<String>,
    pub exchange: String,
    pub persist_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_ADDR.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            rabbitmq_url: None,
            exchange: DEFAULT_EXCHANGE.to_string(),
            persist_timeout: Duration::from_secs(DEFAULT_PERSIST_TIMEOUT_SECS),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RelayResult<Self> {
        let defaults = Self::default();

        let persist_timeout = match lookup("PERSIST_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    RelayError::Config(format!("PERSIST_TIMEOUT_SECS is not a number: {raw}"))
                })?;
                if secs == 0 {
                    return Err(RelayError::Config(
                        "PERSIST_TIMEOUT_SECS must be greater than zero".into(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => defaults.persist_timeout,
        };

        Ok(Self {
            listen_addr: lookup("RELAY_SERVICE_ADDR").unwrap_or(defaults.listen_addr),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            rabbitmq_url: lookup("RABBITMQ_URL").filter(|url| !url.is_empty()),
            exchange: lookup("RELAY_EXCHANGE").unwrap_or(defaults.exchange),
            persist_timeout,
        })
    }
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
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.persist_timeout, Duration::from_secs(120));
        assert!(config.rabbitmq_url.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("PERSIST_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.rabbitmq_url.as_deref(), Some("amqp://localhost:5672"));
        assert_eq!(config.persist_timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_timeout() {
        assert!(RelayConfig::from_lookup(lookup(&[("PERSIST_TIMEOUT_SECS", "soon")])).is_err());
        assert!(RelayConfig::from_lookup(lookup(&[("PERSIST_TIMEOUT_SECS", "0")])).is_err());
    }
}
