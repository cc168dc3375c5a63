pub mod kafka;
pub mod memory;

use std::time::Duration;

use crate::errors::BrokerError;
use crate::ledger::Position;

/// A message received from the broker regardless of whether it's Kafka or the in-memory log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Topic this message was read from
    pub topic: String,
    pub partition: i32,
    /// Offset of this message within its partition
    pub offset: i64,
    /// raw payload of message e.g. kafka message body
    pub payload: Vec<u8>,
}

/// A consumer assigned to one partition of one topic.
///
/// Owned exclusively by a single stream endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait ConsumerHandle {
    fn topic(&self) -> &str;

    /// Waits at most `timeout` for one message. `None` means nothing arrived in time.
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError>;

    /// Moves the read cursor so the next poll returns the message at `position`.
    fn seek(&mut self, position: Position) -> Result<(), BrokerError>;

    /// Durably records `position` as the next offset this consumer group should read.
    fn commit(&mut self, position: Position) -> Result<(), BrokerError>;
}

/// The physical broker the join engine programs against.
pub trait Backend {
    type Consumer: ConsumerHandle;

    fn create_consumer(&self, topic: &str, group_id: &str) -> Result<Self::Consumer, BrokerError>;

    fn produce(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Blocks until produced messages are delivered or `timeout` passes.
    fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}
