use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use crate::errors::ConfigError;

/// A logical stream of records backed by exactly one topic.
///
/// Implementations are normally generated with [`stream_types!`](crate::stream_types),
/// which makes the stream-to-topic mapping total by construction.
pub trait StreamType: Copy + Eq + Hash + Debug + Send + 'static {
    /// Every variant, in declaration order.
    const ALL: &'static [Self];

    fn name(self) -> &'static str;

    /// Topic used when configuration does not override it.
    fn default_topic(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|stream| stream.name() == name)
    }
}

/// Declares a stream enum together with its `StreamType` impl.
///
/// ```
/// join_core::stream_types! {
///     pub enum Market {
///         Orders => ("orders", "market.orders"),
///         Fills => ("fills", "market.fills"),
///     }
/// }
///
/// use join_core::StreamType;
/// assert_eq!(Market::Fills.default_topic(), "market.fills");
/// assert_eq!(Market::from_name("orders"), Some(Market::Orders));
/// ```
#[macro_export]
macro_rules! stream_types {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => ($stream:literal, $topic:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::stream_type::StreamType for $name {
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $stream),+
                }
            }

            fn default_topic(self) -> &'static str {
                match self {
                    $($name::$variant => $topic),+
                }
            }
        }
    };
}

/// Resolved topic for every stream type, validated when built.
#[derive(Debug, Clone)]
pub struct TopicMap<S> {
    topics: HashMap<S, String>,
}

impl<S: StreamType> TopicMap<S> {
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_overrides(&HashMap::new())
    }

    /// `overrides` maps stream names to topic names.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Result<Self, ConfigError> {
        for name in overrides.keys() {
            if S::from_name(name).is_none() {
                return Err(ConfigError::UnknownStream { name: name.clone() });
            }
        }

        let mut names = HashSet::new();
        let mut seen_topics = HashSet::new();
        let mut topics = HashMap::with_capacity(S::ALL.len());

        for &stream in S::ALL {
            if !names.insert(stream.name()) {
                return Err(ConfigError::Invalid {
                    message: format!("stream name {} is declared twice", stream.name()),
                });
            }

            let topic = overrides
                .get(stream.name())
                .map(String::as_str)
                .unwrap_or(stream.default_topic());
            if topic.is_empty() {
                return Err(ConfigError::MissingField {
                    field: format!("streams.{}.topic", stream.name()),
                });
            }
            if !seen_topics.insert(topic.to_string()) {
                return Err(ConfigError::DuplicateTopic {
                    topic: topic.to_string(),
                });
            }

            topics.insert(stream, topic.to_string());
        }

        Ok(Self { topics })
    }

    pub fn topic(&self, stream: S) -> &str {
        self.topics
            .get(&stream)
            .map(String::as_str)
            .unwrap_or(stream.default_topic())
    }
}
