//! Engine, message set, and observable configuration.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Default directory name for the engine's backing store, created under
/// the system temp directory when no `store_dir` is configured.
pub const STORE_DIR_NAME: &str = "strata";

/// Server-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap on memory reservable by accounts. `0` resolves to roughly
    /// 75% of host RAM at enable time.
    pub max_memory: i64,

    /// Cap on file-backed storage reservable by accounts.
    pub max_storage: i64,

    /// Directory backing file storage.
    pub store_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_memory: 0,
            max_storage: 1024 * 1024 * 1024,
            store_dir: std::env::temp_dir().join(STORE_DIR_NAME),
        }
    }
}

/// Per-account resource limits. `-1` means unbounded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountLimits {
    /// Memory the account may consume across memory-backed sets.
    pub max_memory: i64,
    /// Storage the account may consume across file-backed sets.
    pub max_storage: i64,
    /// Number of message sets the account may own.
    pub max_msg_sets: i64,
    /// Number of observables the account may own.
    pub max_observables: i64,
}

impl AccountLimits {
    /// Limits with every dimension unbounded.
    pub fn unbounded() -> Self {
        Self {
            max_memory: -1,
            max_storage: -1,
            max_msg_sets: -1,
            max_observables: -1,
        }
    }
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Message retention policy for a message set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Messages live until trimmed by age or size limits.
    #[default]
    Stream,
    /// A message is deleted once every observable with a matching
    /// partition has acked past it.
    Interest,
    /// A message is deleted on the first ack; observers must not
    /// overlap.
    WorkQueue,
}

/// Backing storage for a message set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageType {
    /// In-memory log.
    #[default]
    Memory,
    /// Append-only log files under the engine's store directory.
    File,
}

/// Configuration for a message set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgSetConfig {
    /// Unique name within the owning account. Must be a literal subject
    /// token (no wildcards or dots).
    pub name: String,

    /// Subject filters the set ingests. Defaults to `[name]` when empty.
    pub subjects: Vec<String>,

    /// Retention policy.
    pub retention: RetentionPolicy,

    /// Backing storage.
    pub storage: StorageType,

    /// Maximum number of messages retained; `<= 0` is unbounded.
    /// Oldest messages are evicted first.
    pub max_msgs: i64,

    /// Maximum stored bytes; `<= 0` is unbounded.
    pub max_bytes: i64,

    /// Maximum message age; zero is unbounded.
    pub max_age: Duration,

    /// Replication factor. Only `1` is supported.
    pub replicas: usize,

    /// Suppress positive pub-acks even when a reply subject is present.
    pub no_ack: bool,
}

impl MsgSetConfig {
    /// Config with the given name and defaults for everything else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            storage: StorageType::default(),
            max_msgs: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            replicas: 1,
            no_ack: false,
        }
    }
}

/// Acknowledgement policy for an observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AckPolicy {
    /// No acks; the delivery cursor is the ack floor.
    #[default]
    None,
    /// Acking a delivery acks everything delivered before it.
    All,
    /// Every delivery must be acked individually.
    Explicit,
}

/// Replay pacing for an observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplayPolicy {
    /// Deliver as fast as the transport accepts.
    #[default]
    Instant,
    /// Reproduce the original inter-arrival spacing.
    Original,
}

/// Where an observable starts in the message set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartPosition {
    /// Only messages appended after creation.
    #[default]
    New,
    /// Every currently stored message.
    All,
    /// The last stored message, then everything after it.
    Last,
    /// A specific store sequence, clamped to the first available.
    BySeq(u64),
    /// The first message at or after a point in time.
    ByTime(SystemTime),
}

/// Default ack wait before a pending delivery is scheduled again.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Configuration for an observable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableConfig {
    /// Push delivery subject. `None` makes the observable pull-based.
    pub delivery_subject: Option<String>,

    /// Durable name. Durable observables survive loss of interest.
    pub durable: Option<String>,

    /// Start position.
    pub start: StartPosition,

    /// Ack policy. Pull observables require [`AckPolicy::Explicit`].
    pub ack_policy: AckPolicy,

    /// How long a delivery may stay unacked before redelivery.
    pub ack_wait: Duration,

    /// Subject filter restricting which messages this observable sees.
    pub partition: Option<String>,

    /// Replay pacing.
    pub replay: ReplayPolicy,
}

impl Default for ObservableConfig {
    fn default() -> Self {
        Self {
            delivery_subject: None,
            durable: None,
            start: StartPosition::default(),
            ack_policy: AckPolicy::default(),
            ack_wait: DEFAULT_ACK_WAIT,
            partition: None,
            replay: ReplayPolicy::default(),
        }
    }
}

impl ObservableConfig {
    /// Pull worker configuration: durable, explicit ack, start at the
    /// beginning of the set.
    pub fn worker(durable: impl Into<String>) -> Self {
        Self {
            durable: Some(durable.into()),
            start: StartPosition::All,
            ack_policy: AckPolicy::Explicit,
            ..Self::default()
        }
    }

    /// Push configuration delivering to `subject` from the start of the set.
    pub fn push_all(subject: impl Into<String>) -> Self {
        Self {
            delivery_subject: Some(subject.into()),
            start: StartPosition::All,
            ..Self::default()
        }
    }
}
