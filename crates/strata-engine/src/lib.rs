//! Persistence and delivery engine for a subject-addressed pub/sub bus.
//!
//! The engine layers two entities over an injected [`transport::Transport`]:
//! message sets (durable, ordered logs of messages received on a set of
//! subject filters) and observables (stateful delivery cursors with
//! independent ack state, push or pull). Around them sit storage
//! backends, per-account resource accounting, and the ack/reply wire
//! protocol.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Accounts and per-account resource accounting.
pub mod account;

/// Engine, message set, and observable configuration.
pub mod config;

/// Error types.
pub mod error;

/// Reservation pool and usage tracking.
pub mod limits;

/// Message sets.
pub mod msgset;

/// Observables.
pub mod observable;

/// Ack/reply subject protocol.
pub mod reply;

/// Server-level orchestration.
pub mod server;

/// Per-message-set storage backends.
pub mod store;

/// Subject validation and matching.
pub mod subject;

/// The injected transport interface.
pub mod transport;

pub use {
    account::Account,
    config::{
        AccountLimits, AckPolicy, EngineConfig, MsgSetConfig, ObservableConfig, ReplayPolicy,
        RetentionPolicy, StartPosition, StorageType,
    },
    error::{Error, ErrorKind, Result},
    limits::AccountUsage,
    msgset::MsgSet,
    observable::{Observable, ObservableInfo, ObservableStatus},
    server::Server,
    store::{StoreStats, StoredMsg},
    transport::{Delivery, SharedTransport, SubscriptionId, Transport},
};
