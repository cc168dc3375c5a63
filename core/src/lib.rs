pub mod backend;
pub mod broker;
pub mod codec;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod errors;
pub mod join;
pub mod ledger;
pub mod record;
pub mod stream_type;
pub mod telemetry;
pub mod window;

pub use broker::{BrokerSettings, MessageBroker};
pub use codec::{JsonCodec, RecordCodec};
pub use config::JoinConfig;
pub use driver::{DriverStep, JoinDriver, JoinTree, JoinedGroup};
pub use endpoint::Fetch;
pub use errors::{BrokerError, ConfigError, DecodeError, JoinError, Result, StreamError};
pub use join::{JoinEngine, JoinStep};
pub use ledger::{DataKey, Position};
pub use record::Record;
pub use stream_type::{StreamType, TopicMap};
pub use window::{FieldWindow, TumblingWindow, WindowKey};
