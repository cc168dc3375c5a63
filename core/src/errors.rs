use thiserror::Error;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Everything a read, step-back, send or commit on a stream can report.
///
/// `Timeout` and `RanAhead` are control-flow signals rather than faults: the
/// caller retries (or advances the partner stream first) and state is kept.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("No data on stream {stream} within the poll window")]
    Timeout { stream: &'static str },

    #[error("Stream {stream} reached end of stream")]
    EndOfStream { stream: &'static str },

    #[error("Stream {stream} ran ahead of its join partner")]
    RanAhead { stream: &'static str },

    #[error("Stream {stream} skipped {skipped} out-of-order records without a match")]
    SkipLimitExceeded { stream: &'static str, skipped: usize },

    #[error("Stream {stream} already holds a stepped-back record")]
    AlreadySteppedBack { stream: &'static str },

    #[error("Stream {stream} has no delivered record to step back to")]
    NothingToStepBack { stream: &'static str },

    #[error("Data key references unknown stream {name}")]
    UnknownLedgerStream { name: String },

    #[error("Failed to decode record from stream {stream} at offset {offset}: {source}")]
    Decode {
        stream: &'static str,
        offset: i64,
        #[source]
        source: DecodeError,
    },

    #[error("Failed to encode record for stream {stream}: {source}")]
    Encode {
        stream: &'static str,
        #[source]
        source: SerializationError,
    },

    #[error("Broker failure on stream {stream}: {source}")]
    Broker {
        stream: &'static str,
        #[source]
        source: BrokerError,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("Payload must be a JSON object, found {found}")]
    NotAnObject { found: &'static str },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Unknown stream: {name}")]
    UnknownStream { name: String },

    #[error("Topic {topic} is mapped to more than one stream")]
    DuplicateTopic { topic: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to create consumer for topic {topic}: {reason}")]
    ConsumerCreation { topic: String, reason: String },

    #[error("Failed to create producer: {reason}")]
    ProducerCreation { reason: String },

    #[error("Failed to assign partition {partition} of topic {topic}: {reason}")]
    Assignment {
        topic: String,
        partition: i32,
        reason: String,
    },

    #[error("Failed to consume messages from topic {topic}: {reason}")]
    Consumption { topic: String, reason: String },

    #[error("Failed to seek topic {topic} to offset {offset}: {reason}")]
    Seek {
        topic: String,
        offset: i64,
        reason: String,
    },

    #[error("Failed to commit offset {offset} for topic {topic}: {reason}")]
    OffsetCommit {
        topic: String,
        offset: i64,
        reason: String,
    },

    #[error("Failed to produce to topic {topic}: {reason}")]
    Produce { topic: String, reason: String },

    #[error("Failed to flush producer: {reason}")]
    Flush { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, JoinError>;

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::Json {
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for SerializationError {
    fn from(err: serde_yaml::Error) -> Self {
        SerializationError::Yaml {
            reason: err.to_string(),
        }
    }
}

impl StreamError {
    /// The stream this error is about, when it is about a single stream.
    pub fn stream(&self) -> Option<&'static str> {
        match self {
            StreamError::Timeout { stream }
            | StreamError::EndOfStream { stream }
            | StreamError::RanAhead { stream }
            | StreamError::SkipLimitExceeded { stream, .. }
            | StreamError::AlreadySteppedBack { stream }
            | StreamError::NothingToStepBack { stream }
            | StreamError::Decode { stream, .. }
            | StreamError::Encode { stream, .. }
            | StreamError::Broker { stream, .. } => Some(*stream),
            StreamError::UnknownLedgerStream { .. } => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, StreamError::EndOfStream { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Timeout { .. } | StreamError::RanAhead { .. } => true,
            StreamError::Broker { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Consumption { .. }
                | BrokerError::OffsetCommit { .. }
                | BrokerError::Produce { .. }
                | BrokerError::Flush { .. }
        )
    }
}

impl JoinError {
    pub fn is_retryable(&self) -> bool {
        match self {
            JoinError::Stream(err) => err.is_retryable(),
            JoinError::Broker(err) => err.is_retryable(),
            JoinError::Config(_) => false,
            JoinError::Serialization(_) => false,
            JoinError::Generic(_) => false,
        }
    }

    pub fn get_retry_delay_ms(&self, base_delay_ms: u64) -> u64 {
        match self {
            JoinError::Broker(BrokerError::OffsetCommit { .. }) => base_delay_ms * 2,
            _ => base_delay_ms,
        }
    }
}
