//! In-memory message log.

use std::collections::BTreeMap;
use std::time::SystemTime;

use bytes::Bytes;

use super::{AppendResult, StoreLimits, StoreStats, StoredMsg};

/// Ordered in-memory log with byte accounting and oldest-first eviction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    msgs: BTreeMap<u64, StoredMsg>,
    limits: StoreLimits,
    bytes: u64,
    last_seq: u64,
}

impl MemoryStore {
    /// Create an empty store with the given limits.
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub(super) fn store(&mut self, subject: &str, payload: Bytes) -> AppendResult {
        let seq = self.last_seq + 1;
        let ts = SystemTime::now();
        let msg = StoredMsg {
            seq,
            subject: subject.to_string(),
            payload,
            ts,
        };

        self.last_seq = seq;
        self.bytes += msg.size();
        self.msgs.insert(seq, msg);

        let (evicted, evicted_bytes) = self.enforce_limits();
        AppendResult {
            seq,
            ts,
            evicted,
            evicted_bytes,
        }
    }

    fn enforce_limits(&mut self) -> (Vec<u64>, u64) {
        let mut evicted = Vec::new();
        let mut freed = 0;

        let over = |msgs: &BTreeMap<u64, StoredMsg>, bytes: u64, limits: &StoreLimits| {
            (limits.max_msgs > 0 && msgs.len() as i64 > limits.max_msgs)
                || (limits.max_bytes > 0 && bytes as i64 > limits.max_bytes)
        };

        while over(&self.msgs, self.bytes, &self.limits) {
            let Some((&seq, _)) = self.msgs.iter().next() else {
                break;
            };
            let msg = self.msgs.remove(&seq).unwrap();
            self.bytes -= msg.size();
            freed += msg.size();
            evicted.push(seq);
        }
        (evicted, freed)
    }

    pub(super) fn lookup(&self, seq: u64) -> Option<StoredMsg> {
        self.msgs.get(&seq).cloned()
    }

    pub(super) fn remove(&mut self, seq: u64) -> Option<u64> {
        let msg = self.msgs.remove(&seq)?;
        let size = msg.size();
        self.bytes -= size;
        Some(size)
    }

    pub(super) fn purge(&mut self) -> (u64, u64) {
        let removed = self.msgs.len() as u64;
        let bytes = self.bytes;
        self.msgs.clear();
        self.bytes = 0;
        (removed, bytes)
    }

    pub(super) fn expire_aged(&mut self, now: SystemTime) -> (Vec<u64>, u64) {
        if self.limits.max_age.is_zero() {
            return (Vec::new(), 0);
        }
        let mut expired = Vec::new();
        let mut freed = 0;
        while let Some((&seq, msg)) = self.msgs.iter().next() {
            let aged_out = msg
                .ts
                .checked_add(self.limits.max_age)
                .is_some_and(|deadline| deadline <= now);
            if !aged_out {
                break;
            }
            let msg = self.msgs.remove(&seq).unwrap();
            self.bytes -= msg.size();
            freed += msg.size();
            expired.push(seq);
        }
        (expired, freed)
    }

    pub(super) fn next_age_deadline(&self) -> Option<SystemTime> {
        if self.limits.max_age.is_zero() {
            return None;
        }
        let (_, oldest) = self.msgs.iter().next()?;
        oldest.ts.checked_add(self.limits.max_age)
    }

    pub(super) fn stats(&self) -> StoreStats {
        StoreStats {
            msgs: self.msgs.len() as u64,
            bytes: self.bytes,
            first_seq: self
                .msgs
                .keys()
                .next()
                .copied()
                .unwrap_or(self.last_seq + 1),
            last_seq: self.last_seq,
        }
    }

    pub(super) fn seq_for_time(&self, t: SystemTime) -> u64 {
        self.msgs
            .values()
            .find(|m| m.ts >= t)
            .map_or(self.last_seq + 1, |m| m.seq)
    }
}
