use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::backend::ConsumerHandle;
use crate::codec::RecordCodec;
use crate::errors::StreamError;
use crate::ledger::Position;
use crate::record::Record;

/// Outcome of one read attempt on a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    Record(Record),
    /// Nothing arrived within the poll window; the stream may still produce.
    Timeout,
    /// Sentinel received, or silence for longer than the data timeout.
    EndOfStream,
}

#[derive(Debug, Clone)]
struct Delivered {
    record: Record,
    offset: Position,
    end_of_stream: bool,
}

/// Reader for one logical stream.
///
/// Holds at most one stepped-back record, replayed by the next read before
/// the broker is polled again.
pub struct StreamEndpoint<H, C> {
    stream: &'static str,
    consumer: H,
    codec: C,
    poll_timeout: Duration,
    data_timeout: Duration,
    /// Next offset to consume, known once a message has been read.
    position: Option<Position>,
    last: Option<Delivered>,
    stepped_back: Option<Delivered>,
    idle_since: Option<Instant>,
}

impl<H: ConsumerHandle, C: RecordCodec> StreamEndpoint<H, C> {
    pub fn new(
        stream: &'static str,
        consumer: H,
        codec: C,
        poll_timeout: Duration,
        data_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            consumer,
            codec,
            poll_timeout,
            data_timeout,
            position: None,
            last: None,
            stepped_back: None,
            idle_since: None,
        }
    }

    pub fn stream(&self) -> &'static str {
        self.stream
    }

    pub fn topic(&self) -> &str {
        self.consumer.topic()
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    /// The stepped-back data record waiting to be replayed, if any.
    pub fn pending(&self) -> Option<&Record> {
        self.stepped_back
            .as_ref()
            .filter(|delivered| !delivered.end_of_stream)
            .map(|delivered| &delivered.record)
    }

    pub fn try_next(&mut self) -> Result<Fetch, StreamError> {
        if let Some(delivered) = self.stepped_back.take() {
            if delivered.end_of_stream {
                // A stepped-back sentinel keeps reporting the end.
                self.stepped_back = Some(delivered);
                return Ok(Fetch::EndOfStream);
            }
            debug!("Replaying {} offset {}", self.stream, delivered.offset);
            self.position = Some(delivered.offset.next());
            let record = delivered.record.clone();
            self.last = Some(delivered);
            return Ok(Fetch::Record(record));
        }

        let started = Instant::now();
        loop {
            let message = self
                .consumer
                .poll(self.poll_timeout)
                .map_err(|source| StreamError::Broker {
                    stream: self.stream,
                    source,
                })?;

            let Some(message) = message else {
                let idle_since = *self.idle_since.get_or_insert(started);
                if idle_since.elapsed() >= self.data_timeout {
                    debug!("{} idle for {:?}, treating as ended", self.stream, idle_since.elapsed());
                    return Ok(Fetch::EndOfStream);
                }
                return Ok(Fetch::Timeout);
            };

            let offset = Position::new(message.offset);
            if self.position.is_some_and(|position| offset < position) {
                // Redelivery after a step-back seek; the record was already replayed.
                debug!("Dropping redelivered {} offset {}", self.stream, offset);
                continue;
            }

            self.idle_since = None;
            self.position = Some(offset.next());

            let record = match self.codec.decode(&message.payload) {
                Ok(record) => record,
                Err(source) => {
                    error!(
                        "Failed to decode {} message at offset {}: {}",
                        self.stream, offset, source
                    );
                    self.last = None;
                    return Err(StreamError::Decode {
                        stream: self.stream,
                        offset: offset.offset(),
                        source,
                    });
                }
            };

            let end_of_stream = record.is_end_of_stream();
            self.last = Some(Delivered {
                record: record.clone(),
                offset,
                end_of_stream,
            });

            return Ok(if end_of_stream {
                Fetch::EndOfStream
            } else {
                Fetch::Record(record)
            });
        }
    }

    pub fn next(&mut self) -> Result<Record, StreamError> {
        match self.try_next()? {
            Fetch::Record(record) => Ok(record),
            Fetch::Timeout => Err(StreamError::Timeout {
                stream: self.stream,
            }),
            Fetch::EndOfStream => Err(StreamError::EndOfStream {
                stream: self.stream,
            }),
        }
    }

    /// Rewinds by exactly one record so the next read replays it.
    pub fn step_back(&mut self) -> Result<(), StreamError> {
        if self.stepped_back.is_some() {
            return Err(StreamError::AlreadySteppedBack {
                stream: self.stream,
            });
        }
        let Some(offset) = self.last.as_ref().map(|delivered| delivered.offset) else {
            return Err(StreamError::NothingToStepBack {
                stream: self.stream,
            });
        };

        self.consumer
            .seek(offset)
            .map_err(|source| StreamError::Broker {
                stream: self.stream,
                source,
            })?;

        self.stepped_back = self.last.take();
        self.position = Some(offset);
        debug!("Stepped {} back to offset {}", self.stream, offset);
        Ok(())
    }

    /// Steps back over the sentinel just read, so later reads still see the end.
    pub fn retain_end_of_stream(&mut self) -> Result<bool, StreamError> {
        let sentinel_last = self
            .last
            .as_ref()
            .is_some_and(|delivered| delivered.end_of_stream);
        if !sentinel_last || self.stepped_back.is_some() {
            return Ok(false);
        }
        self.step_back()?;
        Ok(true)
    }

    /// Moves the read position to `position`, discarding any stepped-back record.
    pub fn rewind(&mut self, position: Position) -> Result<(), StreamError> {
        self.consumer
            .seek(position)
            .map_err(|source| StreamError::Broker {
                stream: self.stream,
                source,
            })?;

        self.position = Some(position);
        self.last = None;
        self.stepped_back = None;
        self.idle_since = None;
        debug!("Rewound {} to offset {}", self.stream, position);
        Ok(())
    }

    /// Commits `position`, or the current position when `None`.
    pub fn commit(&mut self, position: Option<Position>) -> Result<Option<Position>, StreamError> {
        let Some(mut target) = position.or(self.position) else {
            debug!("Nothing consumed on {} yet, skipping commit", self.stream);
            return Ok(None);
        };

        if let Some(buffered) = &self.stepped_back {
            if target > buffered.offset {
                warn!(
                    "Commit of {} at {} would skip stepped-back offset {}, committing {} instead",
                    self.stream, target, buffered.offset, buffered.offset
                );
                target = buffered.offset;
            }
        }

        self.consumer
            .commit(target)
            .map_err(|source| StreamError::Broker {
                stream: self.stream,
                source,
            })?;
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockConsumerHandle, RawMessage};
    use crate::codec::JsonCodec;
    use crate::errors::BrokerError;
    use mockall::Sequence;
    use mockall::predicate::eq;

    fn message(offset: i64, payload: &str) -> RawMessage {
        RawMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn endpoint(consumer: MockConsumerHandle) -> StreamEndpoint<MockConsumerHandle, JsonCodec> {
        StreamEndpoint::new(
            "orders",
            consumer,
            JsonCodec,
            Duration::from_millis(1),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_step_back_seeks_to_last_offset_and_replays_without_polling() {
        let mut consumer = MockConsumerHandle::new();
        let mut seq = Sequence::new();
        consumer
            .expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(message(7, r#"{"k": 1}"#))));
        consumer
            .expect_seek()
            .with(eq(Position::new(7)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut endpoint = endpoint(consumer);
        let first = endpoint.next().unwrap();
        assert_eq!(endpoint.position(), Some(Position::new(8)));

        endpoint.step_back().unwrap();
        assert_eq!(endpoint.position(), Some(Position::new(7)));
        assert_eq!(endpoint.pending(), Some(&first));

        let replayed = endpoint.next().unwrap();
        assert_eq!(replayed, first);
        assert_eq!(endpoint.position(), Some(Position::new(8)));
        assert_eq!(endpoint.pending(), None);
    }

    #[test]
    fn test_redelivered_offset_is_dropped_after_replay() {
        let mut consumer = MockConsumerHandle::new();
        let mut seq = Sequence::new();
        consumer
            .expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(message(3, r#"{"k": 1}"#))));
        consumer.expect_seek().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        consumer
            .expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(message(3, r#"{"k": 1}"#))));
        consumer
            .expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(message(4, r#"{"k": 2}"#))));

        let mut endpoint = endpoint(consumer);
        endpoint.next().unwrap();
        endpoint.step_back().unwrap();
        endpoint.next().unwrap();

        let next = endpoint.next().unwrap();
        assert_eq!(next.get("k"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_second_step_back_is_rejected() {
        let mut consumer = MockConsumerHandle::new();
        consumer
            .expect_poll()
            .returning(|_| Ok(Some(message(0, r#"{"k": 1}"#))));
        consumer.expect_seek().times(1).returning(|_| Ok(()));

        let mut endpoint = endpoint(consumer);
        assert!(matches!(
            endpoint.step_back(),
            Err(StreamError::NothingToStepBack { stream: "orders" })
        ));

        let record = endpoint.next().unwrap();
        endpoint.step_back().unwrap();
        assert!(matches!(
            endpoint.step_back(),
            Err(StreamError::AlreadySteppedBack { stream: "orders" })
        ));
        assert_eq!(endpoint.pending(), Some(&record));
    }

    #[test]
    fn test_commit_is_clamped_to_stepped_back_record() {
        let mut consumer = MockConsumerHandle::new();
        consumer
            .expect_poll()
            .returning(|_| Ok(Some(message(10, r#"{"k": 1}"#))));
        consumer.expect_seek().returning(|_| Ok(()));
        consumer
            .expect_commit()
            .with(eq(Position::new(10)))
            .times(2)
            .returning(|_| Ok(()));

        let mut endpoint = endpoint(consumer);
        endpoint.next().unwrap();
        endpoint.step_back().unwrap();

        assert_eq!(endpoint.commit(None).unwrap(), Some(Position::new(10)));
        assert_eq!(
            endpoint.commit(Some(Position::new(11))).unwrap(),
            Some(Position::new(10))
        );
    }

    #[test]
    fn test_commit_before_any_read_is_noop() {
        let consumer = MockConsumerHandle::new();
        let mut endpoint = endpoint(consumer);
        assert_eq!(endpoint.commit(None).unwrap(), None);
    }

    #[test]
    fn test_explicit_commit_writes_exact_position() {
        let mut consumer = MockConsumerHandle::new();
        consumer
            .expect_poll()
            .returning(|_| Ok(Some(message(20, r#"{"k": 1}"#))));
        consumer
            .expect_commit()
            .with(eq(Position::new(15)))
            .times(1)
            .returning(|_| Ok(()));

        let mut endpoint = endpoint(consumer);
        endpoint.next().unwrap();
        assert_eq!(
            endpoint.commit(Some(Position::new(15))).unwrap(),
            Some(Position::new(15))
        );
    }

    #[test]
    fn test_decode_error_is_fatal_and_carries_offset() {
        let mut consumer = MockConsumerHandle::new();
        consumer
            .expect_poll()
            .times(1)
            .returning(|_| Ok(Some(message(5, "not json"))));

        let mut endpoint = endpoint(consumer);
        match endpoint.next() {
            Err(StreamError::Decode { stream, offset, .. }) => {
                assert_eq!(stream, "orders");
                assert_eq!(offset, 5);
            }
            other => panic!("expected decode error, got {:?}", other),
        }
        assert!(matches!(
            endpoint.step_back(),
            Err(StreamError::NothingToStepBack { .. })
        ));
    }

    #[test]
    fn test_sentinel_reports_end_of_stream_and_stays_sticky() {
        let mut consumer = MockConsumerHandle::new();
        consumer
            .expect_poll()
            .times(1)
            .returning(|_| Ok(Some(message(2, r#"{"eos__": true}"#))));
        consumer
            .expect_seek()
            .with(eq(Position::new(2)))
            .times(1)
            .returning(|_| Ok(()));

        let mut endpoint = endpoint(consumer);
        assert_eq!(endpoint.try_next().unwrap(), Fetch::EndOfStream);
        assert!(endpoint.retain_end_of_stream().unwrap());
        assert!(!endpoint.retain_end_of_stream().unwrap());
        assert_eq!(endpoint.pending(), None);

        assert!(matches!(
            endpoint.next(),
            Err(StreamError::EndOfStream { stream: "orders" })
        ));
        assert_eq!(endpoint.try_next().unwrap(), Fetch::EndOfStream);
        assert_eq!(endpoint.position(), Some(Position::new(2)));
    }

    #[test]
    fn test_empty_poll_is_timeout_until_data_timeout() {
        let mut consumer = MockConsumerHandle::new();
        consumer.expect_poll().returning(|_| Ok(None));

        let mut endpoint = StreamEndpoint::new(
            "orders",
            consumer,
            JsonCodec,
            Duration::from_millis(1),
            Duration::from_millis(30),
        );
        assert_eq!(endpoint.try_next().unwrap(), Fetch::Timeout);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(endpoint.try_next().unwrap(), Fetch::EndOfStream);
    }

    #[test]
    fn test_broker_failure_is_wrapped_with_stream() {
        let mut consumer = MockConsumerHandle::new();
        consumer.expect_poll().returning(|_| {
            Err(BrokerError::Consumption {
                topic: "orders".to_string(),
                reason: "Broker: Not coordinator".to_string(),
            })
        });

        let mut endpoint = endpoint(consumer);
        let err = endpoint.next().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.stream(), Some("orders"));
    }

    #[test]
    fn test_rewind_drops_buffered_record_and_rereads_from_position() {
        let mut consumer = MockConsumerHandle::new();
        let mut seq = Sequence::new();
        consumer
            .expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(message(4, r#"{"k": 4}"#))));
        consumer
            .expect_seek()
            .with(eq(Position::new(4)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        consumer
            .expect_seek()
            .with(eq(Position::new(2)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        consumer
            .expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(message(2, r#"{"k": 2}"#))));

        let mut endpoint = endpoint(consumer);
        endpoint.next().unwrap();
        endpoint.step_back().unwrap();

        endpoint.rewind(Position::new(2)).unwrap();
        assert_eq!(endpoint.pending(), None);
        assert_eq!(endpoint.position(), Some(Position::new(2)));
        assert!(matches!(
            endpoint.step_back(),
            Err(StreamError::NothingToStepBack { .. })
        ));

        let record = endpoint.next().unwrap();
        assert_eq!(record.get("k"), Some(&serde_json::json!(2)));
        assert_eq!(endpoint.position(), Some(Position::new(3)));
    }
}
