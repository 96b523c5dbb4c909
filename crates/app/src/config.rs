//! Binary configuration, assembled from the environment.
//!
//! `.env` files are honoured through `dotenvy` by the binaries before these
//! loaders run; a missing file is not an error.

use std::time::Duration;

use txevents_infra::config::{ConfigError, parse_or, required, var_or};
use txevents_infra::{DbConfig, OutboxConfig};
use txevents_observability::LogFormat;

fn log_format(lookup: &impl Fn(&str) -> Option<String>) -> Result<LogFormat, ConfigError> {
    parse_or(lookup, "LOG_FORMAT", LogFormat::Json)
}

/// Settings of the `lottery` binary: store, outbox relay and draw pace.
#[derive(Debug, Clone)]
pub struct LotteryAppConfig {
    pub db: DbConfig,
    pub outbox: OutboxConfig,
    pub lottery_interval: Duration,
    pub log_format: LogFormat,
}

impl LotteryAppConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secs: u64 = parse_or(lookup, "LOTTERY_INTERVAL_SECS", 5)?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                key: "LOTTERY_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            db: DbConfig::from_lookup(lookup)?,
            outbox: OutboxConfig::from_lookup(lookup)?,
            lottery_interval: Duration::from_secs(secs),
            log_format: log_format(lookup)?,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }
}

/// Settings of the `prizer` binary.
#[derive(Debug, Clone)]
pub struct PrizerAppConfig {
    pub event_topic: String,
    pub bus_url: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub log_format: LogFormat,
}

impl PrizerAppConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let consumer_group = var_or(lookup, "PRIZER_CONSUMER_GROUP", "prizer");
        Ok(Self {
            event_topic: required(lookup, "EVENT_TOPIC")?,
            bus_url: var_or(lookup, "BUS_URL", OutboxConfig::DEFAULT_BUS_URL),
            consumer_name: var_or(lookup, "PRIZER_CONSUMER_NAME", &format!("{consumer_group}-1")),
            consumer_group,
            log_format: log_format(lookup)?,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
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
        move |k| map.get(k).cloned()
    }

    #[test]
    fn lottery_defaults() {
        let cfg = LotteryAppConfig::from_lookup(&lookup(&[
            ("FORWARDER_SQL_TOPIC", "lottery"),
            ("EVENT_TOPIC", "lottery_events"),
        ]))
        .unwrap();

        assert_eq!(cfg.lottery_interval, Duration::from_secs(5));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.db.port, 5432);
        assert_eq!(cfg.outbox.forwarder_topic, "lottery");
        assert_eq!(cfg.outbox.relay.consumer_group, "lottery-relay");
    }

    #[test]
    fn lottery_needs_the_forwarder_topic() {
        let err = LotteryAppConfig::from_lookup(&lookup(&[("EVENT_TOPIC", "e")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("FORWARDER_SQL_TOPIC"));
    }

    #[test]
    fn lottery_interval_must_be_positive() {
        let err = LotteryAppConfig::from_lookup(&lookup(&[
            ("FORWARDER_SQL_TOPIC", "lottery"),
            ("EVENT_TOPIC", "e"),
            ("LOTTERY_INTERVAL_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LOTTERY_INTERVAL_SECS", .. }));
    }

    #[test]
    fn prizer_settings() {
        let cfg = PrizerAppConfig::from_lookup(&lookup(&[
            ("EVENT_TOPIC", "lottery_events"),
            ("BUS_URL", "redis://bus:6379"),
            ("LOG_FORMAT", "pretty"),
        ]))
        .unwrap();

        assert_eq!(cfg.consumer_group, "prizer");
        assert_eq!(cfg.consumer_name, "prizer-1");
        assert_eq!(cfg.bus_url, "redis://bus:6379");
        assert_eq!(cfg.log_format, LogFormat::Pretty);

        let err = PrizerAppConfig::from_lookup(&lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("EVENT_TOPIC"));
    }
}
