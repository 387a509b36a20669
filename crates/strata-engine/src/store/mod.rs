//! Per-message-set storage backends.
//!
//! A message set owns exactly one [`MsgSetStore`]; the memory and file
//! backends sit behind the same method surface so retention, accounting,
//! and delivery never care which one is in play.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fixed per-message overhead charged on top of subject and payload.
pub const MSG_OVERHEAD: u64 = 16;

/// Accounted size of one stored message.
pub fn msg_size(subject: &str, payload: &Bytes) -> u64 {
    subject.len() as u64 + payload.len() as u64 + MSG_OVERHEAD
}

/// A message held in a store.
#[derive(Debug, Clone)]
pub struct StoredMsg {
    /// Store sequence, assigned at append, never reused.
    pub seq: u64,
    /// Subject the message was published on.
    pub subject: String,
    /// Payload.
    pub payload: Bytes,
    /// Arrival timestamp.
    pub ts: SystemTime,
}

impl StoredMsg {
    /// Accounted size of this message.
    pub fn size(&self) -> u64 {
        msg_size(&self.subject, &self.payload)
    }
}

/// Store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of messages currently stored.
    pub msgs: u64,
    /// Accounted bytes currently stored.
    pub bytes: u64,
    /// Lowest stored sequence; `last_seq + 1` when empty.
    pub first_seq: u64,
    /// Highest sequence ever assigned.
    pub last_seq: u64,
}

/// Size and age limits enforced by a store, oldest evicted first.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreLimits {
    /// Maximum message count; `<= 0` unbounded.
    pub max_msgs: i64,
    /// Maximum accounted bytes; `<= 0` unbounded.
    pub max_bytes: i64,
    /// Maximum message age; zero unbounded.
    pub max_age: Duration,
}

/// Outcome of an append, including any limit-driven evictions.
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// Sequence assigned to the new message.
    pub seq: u64,
    /// Arrival timestamp recorded for the message.
    pub ts: SystemTime,
    /// Sequences evicted to stay within limits.
    pub evicted: Vec<u64>,
    /// Accounted bytes released by those evictions.
    pub evicted_bytes: u64,
}

/// Durable snapshot of an observable's cursor, journaled by the file
/// backend so durables survive restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservableJournal {
    /// Next store sequence to deliver.
    pub next_store_seq: u64,
    /// Next deliver sequence to assign.
    pub next_deliver_seq: u64,
    /// Outstanding deliveries as `(store_seq, deliver_count)`; they are
    /// redelivered after recovery.
    pub pending: Vec<(u64, u64)>,
}

/// Storage backend for a single message set.
pub enum MsgSetStore {
    /// In-memory log.
    Memory(MemoryStore),
    /// Append-only log files plus observable journals.
    File(FileStore),
}

impl MsgSetStore {
    /// Append a message, evicting oldest entries as needed to stay
    /// within limits.
    pub async fn store(&mut self, subject: &str, payload: Bytes) -> Result<AppendResult> {
        match self {
            Self::Memory(s) => Ok(s.store(subject, payload)),
            Self::File(s) => s.store(subject, payload).await,
        }
    }

    /// Fetch a message by sequence.
    pub fn lookup(&self, seq: u64) -> Option<StoredMsg> {
        match self {
            Self::Memory(s) => s.lookup(seq),
            Self::File(s) => s.lookup(seq),
        }
    }

    /// Remove one message, returning its accounted size if present.
    pub async fn remove(&mut self, seq: u64) -> Result<Option<u64>> {
        match self {
            Self::Memory(s) => Ok(s.remove(seq)),
            Self::File(s) => s.remove(seq).await,
        }
    }

    /// Remove every stored message. Sequence assignment continues from
    /// `last_seq`. Returns `(messages, bytes)` removed.
    pub async fn purge(&mut self) -> Result<(u64, u64)> {
        match self {
            Self::Memory(s) => Ok(s.purge()),
            Self::File(s) => s.purge().await,
        }
    }

    /// Remove messages older than the configured `max_age`. Returns the
    /// removed sequences and their accounted bytes.
    pub async fn expire_aged(&mut self, now: SystemTime) -> Result<(Vec<u64>, u64)> {
        match self {
            Self::Memory(s) => Ok(s.expire_aged(now)),
            Self::File(s) => s.expire_aged(now).await,
        }
    }

    /// Deadline at which the oldest message exceeds `max_age`, if age
    /// limits apply and the store is non-empty.
    pub fn next_age_deadline(&self) -> Option<SystemTime> {
        match self {
            Self::Memory(s) => s.next_age_deadline(),
            Self::File(s) => s.next_age_deadline(),
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> StoreStats {
        match self {
            Self::Memory(s) => s.stats(),
            Self::File(s) => s.stats(),
        }
    }

    /// First sequence whose timestamp is at or after `t`, or
    /// `last_seq + 1` when no stored message qualifies.
    pub fn seq_for_time(&self, t: SystemTime) -> u64 {
        match self {
            Self::Memory(s) => s.seq_for_time(t),
            Self::File(s) => s.seq_for_time(t),
        }
    }

    /// Persist an observable's cursor. No-op for memory storage.
    pub async fn save_observable(&self, name: &str, journal: &ObservableJournal) -> Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::File(s) => s.save_observable(name, journal).await,
        }
    }

    /// Load a journaled observable cursor, if one was persisted.
    pub async fn load_observable(&self, name: &str) -> Result<Option<ObservableJournal>> {
        match self {
            Self::Memory(_) => Ok(None),
            Self::File(s) => s.load_observable(name).await,
        }
    }

    /// Drop an observable's journal.
    pub async fn remove_observable(&self, name: &str) -> Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::File(s) => s.remove_observable(name).await,
        }
    }
}
