//! Comparator-driven reads across several streams.
//!
//! A comparator classifies a candidate record against a reference the caller
//! holds (typically the key of the record it is joining on):
//! - `Less`: the candidate is behind the reference and is skipped,
//! - `Equal`: the candidate joins and is yielded,
//! - `Greater`: the candidate is ahead; it is stepped back so the partner
//!   stream can catch up, and the read reports `RanAhead`.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::broker::MessageBroker;
use crate::codec::{JsonCodec, RecordCodec};
use crate::endpoint::Fetch;
use crate::errors::StreamError;
use crate::ledger::DataKey;
use crate::record::Record;
use crate::stream_type::StreamType;
use crate::telemetry::JoinMetrics;

pub const DEFAULT_SKIP_LIMIT: usize = 10000;

/// Outcome of one comparator-driven read.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinStep {
    Matched(Record),
    RanAhead,
    EndOfStream,
    Timeout,
}

/// Comparator type of a plain pull, which never holds a comparator.
pub type PlainPull = fn(&Record) -> Ordering;

pub struct JoinEngine<S, B: Backend, C = JsonCodec> {
    broker: MessageBroker<S, B, C>,
    skip_limit: Option<usize>,
    metrics: JoinMetrics,
}

impl<S, B, C> JoinEngine<S, B, C>
where
    S: StreamType,
    B: Backend,
    C: RecordCodec + Clone,
{
    pub fn new(broker: MessageBroker<S, B, C>) -> Self {
        Self {
            broker,
            skip_limit: Some(DEFAULT_SKIP_LIMIT),
            metrics: JoinMetrics::default(),
        }
    }

    /// Caps consecutive skipped records per read; `None` skips without bound.
    pub fn with_skip_limit(mut self, skip_limit: Option<usize>) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn broker(&self) -> &MessageBroker<S, B, C> {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut MessageBroker<S, B, C> {
        &mut self.broker
    }

    pub fn metrics(&self) -> &JoinMetrics {
        &self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut JoinMetrics {
        &mut self.metrics
    }

    /// Non-failing form of a join read: everything except decode and broker
    /// faults comes back as a [`JoinStep`].
    pub fn try_step<F>(
        &mut self,
        stream: S,
        comparator: Option<&mut F>,
    ) -> Result<JoinStep, StreamError>
    where
        F: FnMut(&Record) -> Ordering,
    {
        let Some(comparator) = comparator else {
            return match self.broker.try_next(stream)? {
                Fetch::Record(record) => Ok(JoinStep::Matched(record)),
                Fetch::Timeout => Ok(self.timed_out()),
                Fetch::EndOfStream => self.ended(stream),
            };
        };

        // A record left over from an earlier ran-ahead is re-checked before
        // anything new is read, so it is never skipped over.
        if let Some(pending) = self.broker.pending(stream) {
            if comparator(pending) == Ordering::Greater {
                debug!("Pending {} record is still ahead", stream.name());
                self.metrics.ran_ahead += 1;
                return Ok(JoinStep::RanAhead);
            }
        }

        let mut skipped = 0;
        loop {
            let record = match self.broker.try_next(stream)? {
                Fetch::Record(record) => record,
                Fetch::Timeout => return Ok(self.timed_out()),
                Fetch::EndOfStream => return self.ended(stream),
            };

            match comparator(&record) {
                Ordering::Equal => return Ok(JoinStep::Matched(record)),
                Ordering::Greater => {
                    self.broker.step_back(stream)?;
                    self.metrics.ran_ahead += 1;
                    return Ok(JoinStep::RanAhead);
                }
                Ordering::Less => {
                    warn!("Skipped stream element on {}: {:?}", stream.name(), record);
                    self.metrics.records_skipped += 1;
                    skipped += 1;
                    if self.skip_limit.is_some_and(|limit| skipped > limit) {
                        return Err(StreamError::SkipLimitExceeded {
                            stream: stream.name(),
                            skipped,
                        });
                    }
                }
            }
        }
    }

    fn timed_out(&mut self) -> JoinStep {
        self.metrics.timeouts += 1;
        JoinStep::Timeout
    }

    /// Only the sentinel is stepped back here. Replaying a record that was
    /// already yielded would deliver it twice.
    fn ended(&mut self, stream: S) -> Result<JoinStep, StreamError> {
        self.broker.retain_end_of_stream(stream)?;
        Ok(JoinStep::EndOfStream)
    }

    /// Every record of `stream`, in order, until it times out or ends.
    pub fn get_elements(&mut self, stream: S) -> Elements<'_, S, B, C, PlainPull> {
        Elements {
            engine: self,
            stream,
            comparator: None,
            finished: false,
        }
    }

    /// The run of records of `stream` the comparator classifies as `Equal`.
    ///
    /// The last item is always an `Err` saying why the run stopped:
    /// `RanAhead` when the next record belongs to a later join point,
    /// `EndOfStream` or `Timeout` otherwise.
    pub fn get_joined_elements<F>(&mut self, stream: S, comparator: F) -> Elements<'_, S, B, C, F>
    where
        F: FnMut(&Record) -> Ordering,
    {
        Elements {
            engine: self,
            stream,
            comparator: Some(comparator),
            finished: false,
        }
    }

    pub fn send(&mut self, stream: S, record: &Record) -> Result<(), StreamError> {
        self.broker.send(stream, record)
    }

    pub fn send_eos(&mut self, stream: S) -> Result<(), StreamError> {
        self.broker.send_eos(stream)
    }

    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.broker.flush()
    }

    pub fn commit(&mut self, data_key: Option<DataKey>) -> Result<(), StreamError> {
        self.broker.commit(data_key)?;
        self.metrics.commits += 1;
        Ok(())
    }

    pub fn get_data_key(&mut self) -> DataKey {
        self.broker.get_data_key()
    }

    /// Returns every stream to the positions of `data_key`, dropping buffered records.
    pub fn rewind(&mut self, data_key: Option<&DataKey>) -> Result<(), StreamError> {
        self.broker.rewind(data_key)
    }
}

/// Lazy sequence returned by [`JoinEngine::get_elements`] and
/// [`JoinEngine::get_joined_elements`]. Ends after yielding its first error.
pub struct Elements<'a, S, B: Backend, C, F> {
    engine: &'a mut JoinEngine<S, B, C>,
    stream: S,
    comparator: Option<F>,
    finished: bool,
}

impl<S, B, C, F> Iterator for Elements<'_, S, B, C, F>
where
    S: StreamType,
    B: Backend,
    C: RecordCodec + Clone,
    F: FnMut(&Record) -> Ordering,
{
    type Item = Result<Record, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let stream = self.stream.name();
        let outcome = match self.engine.try_step(self.stream, self.comparator.as_mut()) {
            Ok(JoinStep::Matched(record)) => {
                self.engine.metrics.records_yielded += 1;
                return Some(Ok(record));
            }
            Ok(JoinStep::RanAhead) => StreamError::RanAhead { stream },
            Ok(JoinStep::EndOfStream) => StreamError::EndOfStream { stream },
            Ok(JoinStep::Timeout) => StreamError::Timeout { stream },
            Err(err) => err,
        };

        self.finished = true;
        Some(Err(outcome))
    }
}
