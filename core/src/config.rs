use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::broker::BrokerSettings;
use crate::errors::{ConfigError, Result, SerializationError};

pub const CONFIG_ENV_VAR: &str = "JOIN_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinConfig {
    pub version: u32,
    pub kafka: KafkaOptions,
    /// Topic per stream name; streams left out keep their default topic.
    #[serde(default)]
    pub streams: HashMap<String, StreamConfig>,
    pub join: JoinTreeConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub consumer_group: String,
    /// Every stream is read from this single partition.
    #[serde(default)]
    pub partition: i32,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinTreeConfig {
    /// Leading stream, read without a comparator.
    pub root: String,
    #[serde(default)]
    pub pairs: Vec<JoinPairConfig>,
    /// Stream receiving the processor's output records, if any.
    pub output: Option<String>,
    /// Groups consecutive root records into one processor call.
    #[serde(default)]
    pub window: Option<WindowConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowConfig {
    /// Root field holding the window key, or the epoch-millis timestamp when `size_ms` is set.
    pub field: String,
    /// Tumbling window width; without it roots sharing a field value form a window.
    pub size_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinPairConfig {
    pub left: String,
    pub right: String,
    pub left_key: String,
    pub right_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Silence after which a stream counts as ended.
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: u64,
    /// Longest single poll; defaults to `data_timeout_ms`.
    pub poll_timeout_ms: Option<u64>,
    /// Consecutive out-of-order records tolerated before failing; `null` disables the bound.
    #[serde(default = "default_max_skipped_records")]
    pub max_skipped_records: Option<usize>,
}

fn default_data_timeout_ms() -> u64 {
    30000
}

fn default_max_skipped_records() -> Option<usize> {
    Some(10000)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            data_timeout_ms: default_data_timeout_ms(),
            poll_timeout_ms: None,
            max_skipped_records: default_max_skipped_records(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<JoinConfig> {
    match config_path {
        Some(path) => JoinConfig::from_file(path),
        None => JoinConfig::from_env(),
    }
}

impl JoinConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> Result<Self> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::Invalid {
            message: format!("{} environment variable not set", CONFIG_ENV_VAR),
        })?;
        Self::from_yaml(&config_str)
    }

    fn from_yaml(content: &str) -> Result<Self> {
        let config = serde_yaml::from_str(content).map_err(SerializationError::from)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(invalid("Kafka bootstrap servers cannot be empty"));
        }
        if self.kafka.consumer_group.is_empty() {
            return Err(invalid("Kafka consumer group cannot be empty"));
        }
        if self.timeouts.data_timeout_ms == 0 {
            return Err(invalid("Data timeout must be greater than zero"));
        }
        if let Some(poll) = self.timeouts.poll_timeout_ms {
            if poll == 0 {
                return Err(invalid("Poll timeout must be greater than zero"));
            }
            if poll > self.timeouts.data_timeout_ms {
                warn!(
                    "Poll timeout {}ms exceeds data timeout {}ms; every empty poll will end the stream",
                    poll, self.timeouts.data_timeout_ms
                );
            }
        }
        for (name, stream) in &self.streams {
            if stream.topic.is_empty() {
                return Err(ConfigError::MissingField {
                    field: format!("streams.{}.topic", name),
                });
            }
        }
        if self.join.root.is_empty() {
            return Err(invalid("Join root stream cannot be empty"));
        }
        for pair in &self.join.pairs {
            if pair.left.is_empty() || pair.right.is_empty() {
                return Err(invalid("Join pair streams cannot be empty"));
            }
        }
        if let Some(window) = &self.join.window {
            if window.field.is_empty() {
                return Err(invalid("Window field cannot be empty"));
            }
            if window.size_ms == Some(0) {
                return Err(invalid("Window size must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn topic_overrides(&self) -> HashMap<String, String> {
        self.streams
            .iter()
            .map(|(name, stream)| (name.clone(), stream.topic.clone()))
            .collect()
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            group_id: self.kafka.consumer_group.clone(),
            poll_timeout: self.timeouts.poll_timeout_ms.map(Duration::from_millis),
            data_timeout: Duration::from_millis(self.timeouts.data_timeout_ms),
        }
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.to_string(),
    }
}
