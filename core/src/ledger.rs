use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SerializationError;

/// Offset of the next record to consume from a stream's topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(i64);

impl Position {
    pub const fn new(offset: i64) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> i64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub stream: String,
    pub topic: String,
    pub position: Position,
}

/// Snapshot of how far every active stream had been consumed at one point of
/// a join. Committing it writes exactly these positions, whatever has been
/// read since.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKey {
    id: u64,
    captured_at: DateTime<Utc>,
    entries: Vec<LedgerEntry>,
}

impl DataKey {
    pub(crate) fn new(id: u64, entries: Vec<LedgerEntry>) -> Self {
        Self {
            id,
            captured_at: Utc::now(),
            entries,
        }
    }

    /// Sequence number, unique per broker instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position_of(&self, stream: &str) -> Option<Position> {
        self.entries
            .iter()
            .find(|entry| entry.stream == stream)
            .map(|entry| entry.position)
    }

    /// Opaque handle for persisting the snapshot outside the process.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
