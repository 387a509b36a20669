//! File-backed message log.
//!
//! One directory per message set: `msgs.log` holds length-prefixed CBOR
//! records (appends, removals, purges) and `obs/<name>.state` journals
//! durable observable cursors. The full log is replayed into memory on
//! open; the in-memory index serves lookups while the log provides
//! durability.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::{AppendResult, ObservableJournal, StoreLimits, StoreStats, StoredMsg};
use crate::error::{Error, Result};

const LOG_FILE: &str = "msgs.log";
const OBS_DIR: &str = "obs";

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Append {
        seq: u64,
        ts_nanos: u64,
        subject: String,
        payload: Vec<u8>,
    },
    Remove {
        seq: u64,
    },
    Purge,
}

/// Append-only file log with an in-memory index.
pub struct FileStore {
    dir: PathBuf,
    log: fs::File,
    msgs: BTreeMap<u64, StoredMsg>,
    limits: StoreLimits,
    bytes: u64,
    last_seq: u64,
}

impl FileStore {
    /// Open or create the store under `dir`, replaying any existing log.
    pub async fn open(dir: PathBuf, limits: StoreLimits) -> Result<Self> {
        fs::create_dir_all(dir.join(OBS_DIR)).await?;

        let path = dir.join(LOG_FILE);
        let mut msgs = BTreeMap::new();
        let mut bytes = 0u64;
        let mut last_seq = 0u64;

        if let Ok(data) = fs::read(&path).await {
            for record in decode_records(&data) {
                match record {
                    LogRecord::Append {
                        seq,
                        ts_nanos,
                        subject,
                        payload,
                    } => {
                        let msg = StoredMsg {
                            seq,
                            subject,
                            payload: Bytes::from(payload),
                            ts: SystemTime::UNIX_EPOCH + Duration::from_nanos(ts_nanos),
                        };
                        bytes += msg.size();
                        last_seq = last_seq.max(seq);
                        msgs.insert(seq, msg);
                    }
                    LogRecord::Remove { seq } => {
                        if let Some(msg) = msgs.remove(&seq) {
                            bytes -= msg.size();
                        }
                    }
                    LogRecord::Purge => {
                        msgs.clear();
                        bytes = 0;
                    }
                }
            }
        }

        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            dir,
            log,
            msgs,
            limits,
            bytes,
            last_seq,
        })
    }

    async fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(record, &mut buf)
            .map_err(|e| Error::storage(format!("encoding log record: {e}")))?;
        let mut frame = Vec::with_capacity(buf.len() + 4);
        frame.extend_from_slice(&(buf.len() as u32).to_le_bytes());
        frame.extend_from_slice(&buf);
        self.log.write_all(&frame).await?;
        self.log.flush().await?;
        Ok(())
    }

    pub(super) async fn store(&mut self, subject: &str, payload: Bytes) -> Result<AppendResult> {
        let seq = self.last_seq + 1;
        let ts = SystemTime::now();
        let ts_nanos = ts
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        self.write_record(&LogRecord::Append {
            seq,
            ts_nanos,
            subject: subject.to_string(),
            payload: payload.to_vec(),
        })
        .await?;

        let msg = StoredMsg {
            seq,
            subject: subject.to_string(),
            payload,
            ts,
        };
        self.last_seq = seq;
        self.bytes += msg.size();
        self.msgs.insert(seq, msg);

        let mut evicted = Vec::new();
        let mut evicted_bytes = 0;
        while self.over_limits() {
            let Some((&oldest, _)) = self.msgs.iter().next() else {
                break;
            };
            if let Some(freed) = self.remove(oldest).await? {
                evicted.push(oldest);
                evicted_bytes += freed;
            }
        }

        Ok(AppendResult {
            seq,
            ts,
            evicted,
            evicted_bytes,
        })
    }

    fn over_limits(&self) -> bool {
        (self.limits.max_msgs > 0 && self.msgs.len() as i64 > self.limits.max_msgs)
            || (self.limits.max_bytes > 0 && self.bytes as i64 > self.limits.max_bytes)
    }

    pub(super) fn lookup(&self, seq: u64) -> Option<StoredMsg> {
        self.msgs.get(&seq).cloned()
    }

    pub(super) async fn remove(&mut self, seq: u64) -> Result<Option<u64>> {
        let Some(msg) = self.msgs.remove(&seq) else {
            return Ok(None);
        };
        let size = msg.size();
        self.bytes -= size;
        self.write_record(&LogRecord::Remove { seq }).await?;
        Ok(Some(size))
    }

    pub(super) async fn purge(&mut self) -> Result<(u64, u64)> {
        let removed = self.msgs.len() as u64;
        let bytes = self.bytes;
        self.msgs.clear();
        self.bytes = 0;
        self.write_record(&LogRecord::Purge).await?;
        Ok((removed, bytes))
    }

    pub(super) async fn expire_aged(&mut self, now: SystemTime) -> Result<(Vec<u64>, u64)> {
        if self.limits.max_age.is_zero() {
            return Ok((Vec::new(), 0));
        }
        let mut expired = Vec::new();
        let mut freed = 0;
        loop {
            let Some((&seq, msg)) = self.msgs.iter().next() else {
                break;
            };
            let aged_out = msg
                .ts
                .checked_add(self.limits.max_age)
                .is_some_and(|deadline| deadline <= now);
            if !aged_out {
                break;
            }
            if let Some(size) = self.remove(seq).await? {
                expired.push(seq);
                freed += size;
            }
        }
        Ok((expired, freed))
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

    fn obs_path(&self, name: &str) -> PathBuf {
        self.dir.join(OBS_DIR).join(format!("{name}.state"))
    }

    pub(super) async fn save_observable(
        &self,
        name: &str,
        journal: &ObservableJournal,
    ) -> Result<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(journal, &mut buf)
            .map_err(|e| Error::storage(format!("encoding observable journal: {e}")))?;
        fs::write(self.obs_path(name), buf).await?;
        Ok(())
    }

    pub(super) async fn load_observable(&self, name: &str) -> Result<Option<ObservableJournal>> {
        let data = match fs::read(self.obs_path(name)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match ciborium::from_reader(&data[..]) {
            Ok(journal) => Ok(Some(journal)),
            Err(e) => {
                warn!(name, "dropping unreadable observable journal: {e}");
                Ok(None)
            }
        }
    }

    pub(super) async fn remove_observable(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.obs_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn decode_records(data: &[u8]) -> Vec<LogRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > data.len() {
            // Torn tail from an interrupted write; everything before it
            // is intact.
            warn!("truncated record at log offset {pos}, ignoring tail");
            break;
        }
        match ciborium::from_reader(&data[pos..pos + len]) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("unreadable record at log offset {pos}: {e}");
                break;
            }
        }
        pos += len;
    }
    records
}
