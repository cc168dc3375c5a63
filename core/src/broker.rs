use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::codec::{JsonCodec, RecordCodec};
use crate::endpoint::{Fetch, StreamEndpoint};
use crate::errors::StreamError;
use crate::ledger::{DataKey, LedgerEntry, Position};
use crate::record::Record;
use crate::stream_type::{StreamType, TopicMap};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub group_id: String,
    /// Longest single poll. Falls back to `data_timeout` when unset.
    pub poll_timeout: Option<Duration>,
    /// Silence after which a stream is considered ended.
    pub data_timeout: Duration,
}

impl BrokerSettings {
    pub fn new(group_id: impl Into<String>, data_timeout: Duration) -> Self {
        Self {
            group_id: group_id.into(),
            poll_timeout: None,
            data_timeout,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = Some(poll_timeout);
        self
    }

    pub fn effective_poll_timeout(&self) -> Duration {
        self.poll_timeout.unwrap_or(self.data_timeout)
    }
}

/// Logical stream operations on top of a concrete [`Backend`].
///
/// Endpoints are created on first use of a stream and kept for the lifetime
/// of the broker; each owns its own backend consumer.
pub struct MessageBroker<S, B: Backend, C = JsonCodec> {
    backend: B,
    codec: C,
    topics: TopicMap<S>,
    settings: BrokerSettings,
    endpoints: HashMap<S, StreamEndpoint<B::Consumer, C>>,
    next_key_id: u64,
}

impl<S: StreamType, B: Backend> MessageBroker<S, B, JsonCodec> {
    pub fn new(backend: B, topics: TopicMap<S>, settings: BrokerSettings) -> Self {
        Self::with_codec(backend, JsonCodec, topics, settings)
    }
}

impl<S, B, C> MessageBroker<S, B, C>
where
    S: StreamType,
    B: Backend,
    C: RecordCodec + Clone,
{
    pub fn with_codec(backend: B, codec: C, topics: TopicMap<S>, settings: BrokerSettings) -> Self {
        Self {
            backend,
            codec,
            topics,
            settings,
            endpoints: HashMap::new(),
            next_key_id: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn topic(&self, stream: S) -> &str {
        self.topics.topic(stream)
    }

    fn endpoint(&mut self, stream: S) -> Result<&mut StreamEndpoint<B::Consumer, C>, StreamError> {
        match self.endpoints.entry(stream) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let topic = self.topics.topic(stream);
                let consumer = self
                    .backend
                    .create_consumer(topic, &self.settings.group_id)
                    .map_err(|source| StreamError::Broker {
                        stream: stream.name(),
                        source,
                    })?;
                info!("Opened stream {} on topic {}", stream.name(), topic);

                Ok(entry.insert(StreamEndpoint::new(
                    stream.name(),
                    consumer,
                    self.codec.clone(),
                    self.settings.effective_poll_timeout(),
                    self.settings.data_timeout,
                )))
            }
        }
    }

    pub fn try_next(&mut self, stream: S) -> Result<Fetch, StreamError> {
        self.endpoint(stream)?.try_next()
    }

    pub fn next(&mut self, stream: S) -> Result<Record, StreamError> {
        self.endpoint(stream)?.next()
    }

    pub fn step_back(&mut self, stream: S) -> Result<(), StreamError> {
        self.endpoint(stream)?.step_back()
    }

    /// Keeps a just-read end-of-stream sentinel visible to later reads.
    pub fn retain_end_of_stream(&mut self, stream: S) -> Result<bool, StreamError> {
        self.endpoint(stream)?.retain_end_of_stream()
    }

    /// Record stepped back on `stream` and not yet replayed.
    pub fn pending(&self, stream: S) -> Option<&Record> {
        self.endpoints.get(&stream).and_then(StreamEndpoint::pending)
    }

    pub fn position(&self, stream: S) -> Option<Position> {
        self.endpoints.get(&stream).and_then(StreamEndpoint::position)
    }

    pub fn send(&mut self, stream: S, record: &Record) -> Result<(), StreamError> {
        let payload = self.codec.encode(record).map_err(|source| StreamError::Encode {
            stream: stream.name(),
            source,
        })?;
        let topic = self.topics.topic(stream);
        self.backend
            .produce(topic, &payload)
            .map_err(|source| StreamError::Broker {
                stream: stream.name(),
                source,
            })?;
        debug!("Sent {} bytes to {}", payload.len(), topic);
        Ok(())
    }

    pub fn send_eos(&mut self, stream: S) -> Result<(), StreamError> {
        info!("Sending end of stream to {}", stream.name());
        self.send(stream, &Record::end_of_stream())
    }

    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.backend
            .flush(FLUSH_TIMEOUT)
            .map_err(|source| StreamError::Broker {
                stream: "producer",
                source,
            })
    }

    /// With a key, commits exactly the positions it recorded; without one,
    /// commits every open stream at its current position.
    pub fn commit(&mut self, data_key: Option<DataKey>) -> Result<(), StreamError> {
        match data_key {
            None => {
                for endpoint in self.endpoints.values_mut() {
                    endpoint.commit(None)?;
                }
            }
            Some(data_key) => {
                for entry in data_key.entries() {
                    let stream = S::from_name(&entry.stream).ok_or_else(|| {
                        StreamError::UnknownLedgerStream {
                            name: entry.stream.clone(),
                        }
                    })?;
                    self.endpoint(stream)?.commit(Some(entry.position))?;
                }
                debug!("Committed data key {}", data_key.id());
            }
        }
        Ok(())
    }

    /// Moves every stream back to the positions recorded in `data_key`.
    ///
    /// Streams the key does not name are closed and reopen from the group's
    /// committed offset on their next read. Without a key, all of them are.
    pub fn rewind(&mut self, data_key: Option<&DataKey>) -> Result<(), StreamError> {
        let mut targets = HashMap::new();
        for entry in data_key.map(DataKey::entries).unwrap_or_default() {
            let stream = S::from_name(&entry.stream).ok_or_else(|| {
                StreamError::UnknownLedgerStream {
                    name: entry.stream.clone(),
                }
            })?;
            targets.insert(stream, entry.position);
        }

        self.endpoints.retain(|stream, _| targets.contains_key(stream));
        for (stream, position) in targets {
            self.endpoint(stream)?.rewind(position)?;
        }
        info!(
            "Rewound to data key {}",
            data_key.map_or_else(|| "none".to_string(), |key| key.id().to_string())
        );
        Ok(())
    }

    /// Snapshot of the current position of every stream that has consumed something.
    pub fn get_data_key(&mut self) -> DataKey {
        let entries = S::ALL
            .iter()
            .filter_map(|&stream| {
                let endpoint = self.endpoints.get(&stream)?;
                Some(LedgerEntry {
                    stream: stream.name().to_string(),
                    topic: endpoint.topic().to_string(),
                    position: endpoint.position()?,
                })
            })
            .collect();

        let id = self.next_key_id;
        self.next_key_id += 1;
        DataKey::new(id, entries)
    }
}
