//! Server configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use narwhal_broker::{BrokerSettings, ConsumerGroupConfig};

use crate::error::AppError;

/// Where transcoded output is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Base directory of the local backend.
    pub root: PathBuf,
    /// Public URL prefix for stored keys.
    pub base_url: Option<String>,
}

/// Everything the server needs to boot.
#[derive(Debug, Clone, PartialEq)]
pub struct NarwhalConfig {
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,
    /// `PostgreSQL` URL; in-memory persistence when unset.
    pub database_url: Option<String>,
    /// Event backbone connection.
    pub broker: BrokerSettings,
    /// Durable consumer group name.
    pub consumer_name: String,
    /// Handler attempts within one delivery.
    pub consumer_max_retries: u32,
    /// Broker ack-wait.
    pub consumer_ack_wait: Duration,
    /// Broker delivery budget.
    pub consumer_max_deliver: u32,
    /// Output storage.
    pub storage: StorageConfig,
    /// `ffmpeg` executable.
    pub ffmpeg_path: PathBuf,
    /// `ffprobe` executable.
    pub ffprobe_path: PathBuf,
    /// Default retry budget of transcode jobs.
    pub transcode_max_retries: u32,
    /// OTLP collector endpoint; span export is off when unset.
    pub otlp_endpoint: Option<String>,
}

impl NarwhalConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for malformed or unsupported values.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of
    /// a variable or `None` when it is unset.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for malformed or unsupported values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let broker_url = var("BROKER_URL").unwrap_or_else(|| "memory://".to_owned());
        if !broker_url.starts_with("memory://") {
            return Err(AppError::Config(format!(
                "BROKER_URL {broker_url} is not supported: only memory:// is available"
            )));
        }

        let storage_type = var("STORAGE_TYPE").unwrap_or_else(|| "local".to_owned());
        match storage_type.as_str() {
            "local" => {}
            "s3" => return Err(AppError::Config("STORAGE_TYPE s3 is not supported by this build".to_owned())),
            other => return Err(AppError::Config(format!("STORAGE_TYPE must be local or s3, got {other}"))),
        }

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: parse(&var, "PORT", 3000)?,
            database_url: var("DATABASE_URL"),
            broker: BrokerSettings {
                url: broker_url,
                client_id: var("BROKER_CLIENT_ID").unwrap_or_else(|| "narwhal".to_owned()),
                reconnect_max: parse(&var, "BROKER_RECONNECT_MAX", 10)?,
                reconnect_wait: Duration::from_millis(parse(&var, "BROKER_RECONNECT_WAIT_MS", 2000)?),
            },
            consumer_name: var("CONSUMER_NAME").unwrap_or_else(|| "narwhal-processing".to_owned()),
            consumer_max_retries: parse(&var, "CONSUMER_MAX_RETRIES", 3)?,
            consumer_ack_wait: Duration::from_secs(parse(&var, "CONSUMER_ACK_WAIT_SECS", 30)?),
            consumer_max_deliver: parse(&var, "CONSUMER_MAX_DELIVER", 5)?,
            storage: StorageConfig {
                root: var("STORAGE_ROOT").map_or_else(|| PathBuf::from("/var/lib/narwhal/media"), PathBuf::from),
                base_url: var("STORAGE_BASE_URL"),
            },
            ffmpeg_path: var("FFMPEG_PATH").map_or_else(|| PathBuf::from("ffmpeg"), PathBuf::from),
            ffprobe_path: var("FFPROBE_PATH").map_or_else(|| PathBuf::from("ffprobe"), PathBuf::from),
            transcode_max_retries: parse(&var, "TRANSCODE_MAX_RETRIES", 3)?,
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    /// `host:port` to bind.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The processing consumer group settings.
    #[must_use]
    pub fn consumer_group(&self) -> ConsumerGroupConfig {
        ConsumerGroupConfig {
            max_retries: self.consumer_max_retries,
            ack_wait: self.consumer_ack_wait,
            max_deliver: self.consumer_max_deliver,
            ..ConsumerGroupConfig::new(self.consumer_name.clone())
        }
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key} must be a valid {}: {e}", std::any::type_name::<T>()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<NarwhalConfig, AppError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        NarwhalConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_apply_when_nothing_is_set() {
        // Act
        let config = config_from(&[]).unwrap();

        // Assert
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
        assert_eq!(config.database_url, None);
        assert_eq!(config.broker, BrokerSettings::default());
        assert_eq!(config.consumer_name, "narwhal-processing");
        assert_eq!(config.consumer_ack_wait, Duration::from_secs(30));
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/narwhal/media"));
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.transcode_max_retries, 3);
        assert_eq!(config.otlp_endpoint, None);
    }

    #[test]
    fn test_overrides_are_parsed() {
        // Act
        let config = config_from(&[
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/narwhal"),
            ("BROKER_RECONNECT_WAIT_MS", "250"),
            ("CONSUMER_NAME", "workers"),
            ("CONSUMER_MAX_DELIVER", "9"),
            ("STORAGE_BASE_URL", "https://cdn.example"),
            ("FFPROBE_PATH", "/opt/ffmpeg/ffprobe"),
        ])
        .unwrap();

        // Assert
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/narwhal"));
        assert_eq!(config.broker.reconnect_wait, Duration::from_millis(250));
        assert_eq!(config.storage.base_url.as_deref(), Some("https://cdn.example"));
        assert_eq!(config.ffprobe_path, PathBuf::from("/opt/ffmpeg/ffprobe"));
        let group = config.consumer_group();
        assert_eq!(group.name, "workers");
        assert_eq!(group.max_deliver, 9);
    }

    #[test]
    fn test_invalid_port_is_a_config_error() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();

        assert!(matches!(err, AppError::Config(message) if message.contains("PORT")));
    }

    #[test]
    fn test_s3_storage_is_rejected() {
        let err = config_from(&[("STORAGE_TYPE", "s3")]).unwrap_err();

        assert!(matches!(err, AppError::Config(message) if message.contains("s3")));
    }

    #[test]
    fn test_network_broker_url_is_rejected() {
        assert!(config_from(&[("BROKER_URL", "nats://localhost:4222")]).is_err());
    }
}
