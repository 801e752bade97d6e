use config::{Config, ConfigError, Environment, File};
use outboxer::RelayConfig;
use outboxer_nats::NatsSinkConfig;
use outboxer_postgres::PgStoreConfig;
use serde::Deserialize;

/// Environment overrides look like `OUTBOXER__SOURCE__URL`.
const ENV_PREFIX: &str = "OUTBOXER";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub source: PgStoreConfig,
    pub sink: NatsSinkConfig,
    pub relay: RelayConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ServiceConfig {
    /// Load `path` if it exists, then apply environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        Self::from_builder(
            Config::builder().add_source(File::with_name(path).required(false)),
        )
    }

    #[cfg(test)]
    fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Self::from_builder(Config::builder().add_source(File::from_str(yaml, config::FileFormat::Yaml)))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    // Tests touching OUTBOXER__* variables must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_file_yields_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();

        let config = ServiceConfig::load("does-not-exist.yaml").unwrap();
        assert_eq!(config.source.table, "outbox");
        assert_eq!(config.sink.url, "nats://localhost:4222");
        assert_eq!(config.relay, RelayConfig::default());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn yaml_sections_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();

        let config = ServiceConfig::from_yaml(
            r#"
source:
  url: postgres://relay@db/app
  claim_limit: 500
sink:
  subject: orders.events
  stream: ORDERS
relay:
  poll_interval_ms: 1000
  stale_lock_after_ms: 60000
log:
  json: true
"#,
        )
        .unwrap();

        assert_eq!(config.source.url, "postgres://relay@db/app");
        assert_eq!(config.source.claim_limit, Some(500));
        assert_eq!(config.source.max_connections, 4);
        assert_eq!(config.sink.subject, "orders.events");
        assert_eq!(config.sink.stream.as_deref(), Some("ORDERS"));
        assert_eq!(config.relay.poll_interval, Duration::from_secs(1));
        assert_eq!(config.relay.stale_lock_after, Some(Duration::from_secs(60)));
        assert_eq!(config.relay.queue_capacity, 256);
        assert!(config.log.json);
    }

    #[test]
    fn environment_wins_over_file() {
        let _lock = ENV_LOCK.lock().unwrap();

        std::env::set_var("OUTBOXER__SINK__SUBJECT", "from.env");
        std::env::set_var("OUTBOXER__RELAY__POLL_INTERVAL_MS", "750");
        let config = ServiceConfig::from_yaml("sink:\n  subject: from.file\n");
        std::env::remove_var("OUTBOXER__SINK__SUBJECT");
        std::env::remove_var("OUTBOXER__RELAY__POLL_INTERVAL_MS");

        let config = config.unwrap();
        assert_eq!(config.sink.subject, "from.env");
        assert_eq!(config.relay.poll_interval, Duration::from_millis(750));
    }
}
