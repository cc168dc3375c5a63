use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::backend::{Backend, ConsumerHandle, RawMessage};
use crate::errors::BrokerError;
use crate::ledger::Position;

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<u8>>>,
    committed: HashMap<(String, String), i64>,
}

/// In-process broker with one single-partition log per topic.
///
/// Clones share the same logs and committed offsets, so a fresh consumer
/// created after a simulated restart resumes from the group's committed offset.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::Consumption {
            topic: String::new(),
            reason: "in-memory broker state is poisoned".to_string(),
        })
    }

    /// Appends bytes as-is, bypassing any codec.
    pub fn publish_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<i64, BrokerError> {
        let mut state = self.state()?;
        let log = state.topics.entry(topic.to_string()).or_default();
        log.push(payload.into());
        Ok(log.len() as i64 - 1)
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        self.state()
            .map(|state| state.topics.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str) -> Option<Position> {
        let state = self.state().ok()?;
        state
            .committed
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
            .map(Position::new)
    }
}

impl Backend for InMemoryBroker {
    type Consumer = InMemoryConsumer;

    fn create_consumer(&self, topic: &str, group_id: &str) -> Result<Self::Consumer, BrokerError> {
        let cursor = self
            .committed_offset(group_id, topic)
            .map_or(0, Position::offset);
        debug!("Created in-memory consumer for {} at offset {}", topic, cursor);

        Ok(InMemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            cursor,
        })
    }

    fn produce(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.publish_raw(topic, payload).map(|_| ())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    cursor: i64,
}

impl ConsumerHandle for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError> {
        let payload = {
            let state = self.broker.state()?;
            state
                .topics
                .get(&self.topic)
                .and_then(|log| log.get(self.cursor as usize))
                .cloned()
        };

        match payload {
            Some(payload) => {
                let message = RawMessage {
                    topic: self.topic.clone(),
                    partition: 0,
                    offset: self.cursor,
                    payload,
                };
                self.cursor += 1;
                Ok(Some(message))
            }
            None => {
                // An idle broker holds the poll open for the whole window.
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn seek(&mut self, position: Position) -> Result<(), BrokerError> {
        if position.offset() < 0 {
            return Err(BrokerError::Seek {
                topic: self.topic.clone(),
                offset: position.offset(),
                reason: "offset out of range".to_string(),
            });
        }
        self.cursor = position.offset();
        Ok(())
    }

    fn commit(&mut self, position: Position) -> Result<(), BrokerError> {
        let mut state = self.broker.state()?;
        state
            .committed
            .insert((self.group_id.clone(), self.topic.clone()), position.offset());
        Ok(())
    }
}
