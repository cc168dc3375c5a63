//! Windows group consecutive root records into a single processor call.
//!
//! A window closes when a root record with a different key arrives, when the
//! root stream goes quiet and the current time belongs to a later window, or
//! when the root stream ends.

use chrono::Utc;
use serde_json::Value;

use crate::config::WindowConfig;
use crate::record::Record;

/// Assigns root records to windows.
pub trait WindowKey {
    /// Window `record` belongs to. With `None`, the window current at this
    /// moment, if the key depends on time at all.
    fn window_of(&mut self, record: Option<&Record>) -> Option<Value>;
}

impl<F> WindowKey for F
where
    F: FnMut(Option<&Record>) -> Option<Value>,
{
    fn window_of(&mut self, record: Option<&Record>) -> Option<Value> {
        self(record)
    }
}

/// Roots sharing the value of `field` form one window.
#[derive(Debug, Clone)]
pub struct FieldWindow {
    field: String,
}

impl FieldWindow {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl WindowKey for FieldWindow {
    fn window_of(&mut self, record: Option<&Record>) -> Option<Value> {
        record?.get(&self.field).filter(|value| !value.is_null()).cloned()
    }
}

/// Fixed-size, non-overlapping windows over an epoch-millis timestamp field.
///
/// The key is the window start, so a quiet root stream closes the open
/// window as soon as the wall clock passes its end.
#[derive(Debug, Clone)]
pub struct TumblingWindow {
    field: String,
    size_ms: i64,
}

impl TumblingWindow {
    pub fn new(field: impl Into<String>, size_ms: u64) -> Self {
        Self {
            field: field.into(),
            size_ms: i64::try_from(size_ms).unwrap_or(i64::MAX).max(1),
        }
    }

    fn start_of(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.size_ms) * self.size_ms
    }
}

impl WindowKey for TumblingWindow {
    fn window_of(&mut self, record: Option<&Record>) -> Option<Value> {
        let timestamp_ms = match record {
            Some(record) => record.get(&self.field)?.as_i64()?,
            None => Utc::now().timestamp_millis(),
        };
        Some(Value::from(self.start_of(timestamp_ms)))
    }
}

pub fn from_config(config: &WindowConfig) -> Box<dyn WindowKey> {
    match config.size_ms {
        Some(size_ms) => Box::new(TumblingWindow::new(&config.field, size_ms)),
        None => Box::new(FieldWindow::new(&config.field)),
    }
}
