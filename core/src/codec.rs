use serde_json::Value;

use crate::errors::{DecodeError, SerializationError};
use crate::record::Record;

/// Converts records to and from the bytes carried by the broker.
///
/// The end-of-stream sentinel is an ordinary record at this layer; readers
/// check [`Record::is_end_of_stream`] after decoding.
pub trait RecordCodec {
    fn encode(&self, record: &Record) -> Result<Vec<u8>, SerializationError>;

    fn decode(&self, bytes: &[u8]) -> Result<Record, DecodeError>;
}

/// UTF-8 JSON object per message, no extra framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    fn encode(&self, record: &Record) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(record)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record, DecodeError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson {
            reason: e.to_string(),
        })?;
        Record::try_from(value)
    }
}
