use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::backend::{Backend, ConsumerHandle, RawMessage};
use crate::config::KafkaOptions;
use crate::errors::BrokerError;
use crate::ledger::Position;

/// Kafka backend: one `BaseConsumer` per stream, one shared `BaseProducer`.
pub struct KafkaBackend {
    client_config: ClientConfig,
    producer: BaseProducer,
    partition: i32,
}

impl KafkaBackend {
    pub fn connect(config: &KafkaOptions) -> Result<Self, BrokerError> {
        let client_config = build_client_config(config);

        let producer: BaseProducer = client_config
            .create()
            .map_err(|e| BrokerError::ProducerCreation {
                reason: e.to_string(),
            })?;

        info!(
            "Connected Kafka backend to {} (partition {})",
            config.bootstrap_servers, config.partition
        );

        Ok(Self {
            client_config,
            producer,
            partition: config.partition,
        })
    }
}

fn build_client_config(config: &KafkaOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set(
            "auto.offset.reset",
            config.auto_offset_reset.as_deref().unwrap_or("earliest"),
        );

    if let Some(timeout) = config.session_timeout_ms {
        client_config.set("session.timeout.ms", timeout.to_string());
    }

    if let Some(heartbeat) = config.heartbeat_interval_ms {
        client_config.set("heartbeat.interval.ms", heartbeat.to_string());
    }

    if let Some(security_protocol) = &config.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &config.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &config.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &config.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config
}

impl Backend for KafkaBackend {
    type Consumer = KafkaConsumer;

    fn create_consumer(&self, topic: &str, group_id: &str) -> Result<Self::Consumer, BrokerError> {
        let mut config = self.client_config.clone();
        config.set("group.id", group_id);

        let consumer: BaseConsumer = config.create().map_err(|e| BrokerError::ConsumerCreation {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        // Start from the group's committed offset, falling back to auto.offset.reset.
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, self.partition, Offset::Stored)
            .map_err(|e| BrokerError::Assignment {
                topic: topic.to_string(),
                partition: self.partition,
                reason: e.to_string(),
            })?;
        consumer.assign(&tpl).map_err(|e| BrokerError::Assignment {
            topic: topic.to_string(),
            partition: self.partition,
            reason: e.to_string(),
        })?;

        info!(
            "Assigned Kafka consumer to {}[{}] for group {}",
            topic, self.partition, group_id
        );

        Ok(KafkaConsumer {
            consumer,
            topic: topic.to_string(),
            partition: self.partition,
        })
    }

    fn produce(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.producer
            .send(BaseRecord::<(), [u8]>::to(topic).payload(payload))
            .map_err(|(e, _)| BrokerError::Produce {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        // Serve delivery callbacks without blocking.
        self.producer.poll(Duration::ZERO);
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer.flush(timeout).map_err(|e| BrokerError::Flush {
            reason: e.to_string(),
        })
    }
}

pub struct KafkaConsumer {
    consumer: BaseConsumer,
    topic: String,
    partition: i32,
}

impl ConsumerHandle for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError> {
        match self.consumer.poll(timeout) {
            None => Ok(None),
            Some(Ok(message)) => {
                debug!(
                    "Received message from {}[{}] offset {}",
                    message.topic(),
                    message.partition(),
                    message.offset()
                );
                Ok(Some(RawMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                }))
            }
            Some(Err(e)) => {
                warn!("Error receiving message from {}: {}", self.topic, e);
                Err(BrokerError::Consumption {
                    topic: self.topic.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn seek(&mut self, position: Position) -> Result<(), BrokerError> {
        self.consumer
            .seek(
                &self.topic,
                self.partition,
                Offset::Offset(position.offset()),
                Duration::from_secs(10),
            )
            .map_err(|e| BrokerError::Seek {
                topic: self.topic.clone(),
                offset: position.offset(),
                reason: e.to_string(),
            })?;

        debug!("Seeked {}[{}] to offset {}", self.topic, self.partition, position);
        Ok(())
    }

    fn commit(&mut self, position: Position) -> Result<(), BrokerError> {
        let commit_error = |reason: String| BrokerError::OffsetCommit {
            topic: self.topic.clone(),
            offset: position.offset(),
            reason,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(position.offset()))
            .map_err(|e| commit_error(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| commit_error(e.to_string()))?;

        debug!(
            "Committed offset {} for {}[{}]",
            position, self.topic, self.partition
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, RecordCodec};
    use crate::record::Record;

    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    fn test_options(group: &str) -> KafkaOptions {
        KafkaOptions {
            bootstrap_servers: KAFKA_BOOTSTRAP_SERVERS.to_string(),
            consumer_group: group.to_string(),
            partition: 0,
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            auto_offset_reset: Some("earliest".to_string()),
            session_timeout_ms: None,
            heartbeat_interval_ms: None,
        }
    }

    #[test]
    fn test_client_config_maps_security_options() {
        let mut options = test_options("g");
        options.security_protocol = Some("SASL_SSL".to_string());
        options.sasl_username = Some("user".to_string());
        options.session_timeout_ms = Some(30000);

        let config = build_client_config(&options);
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.username"), Some("user"));
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("sasl.password"), None);
    }

    #[test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    fn test_produce_poll_seek_commit() {
        let topic = format!("join-core-test-{}", std::process::id());
        let backend = KafkaBackend::connect(&test_options("join-core-test")).unwrap();

        for k in 0..3 {
            let payload = JsonCodec.encode(&Record::new().with("k", k)).unwrap();
            backend.produce(&topic, &payload).unwrap();
        }
        backend.flush(Duration::from_secs(5)).unwrap();

        let mut consumer = backend.create_consumer(&topic, "join-core-test").unwrap();
        let mut first = None;
        for _ in 0..20 {
            if let Some(message) = consumer.poll(Duration::from_secs(1)).unwrap() {
                first = Some(message);
                break;
            }
        }
        let first = first.expect("no message within 20s");
        let record = JsonCodec.decode(&first.payload).unwrap();
        assert_eq!(record.get("k"), Some(&serde_json::json!(0)));

        consumer.seek(Position::new(first.offset)).unwrap();
        let replayed = consumer.poll(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(replayed.offset, first.offset);

        consumer.commit(Position::new(first.offset + 1)).unwrap();
    }
}
