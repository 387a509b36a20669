//! The injected transport interface.
//!
//! The engine does not own client connections or subject routing; it is
//! handed a [`Transport`] and uses it to ingest published messages, send
//! deliveries and pub-acks, and observe subscriber interest.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Identifier for a transport subscription.
pub type SubscriptionId = u64;

/// An inbound message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The subject the message was published on. For engine deliveries
    /// this is the original ingest subject, not the routed target.
    pub subject: String,
    /// Optional reply subject.
    pub reply: Option<String>,
    /// Message payload.
    pub payload: Bytes,
}

/// The pub/sub bus capabilities the engine depends on.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to a subject pattern. Messages matching the pattern are
    /// sent on the returned channel until [`Transport::unsubscribe`].
    async fn subscribe(&self, pattern: &str) -> Result<(SubscriptionId, mpsc::Receiver<Delivery>)>;

    /// Drop a subscription.
    async fn unsubscribe(&self, sid: SubscriptionId);

    /// Publish a message, routed by `subject`.
    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()>;

    /// Deliver a stored message to `target`, preserving the message's
    /// original `subject` as seen by the receiver.
    async fn deliver(
        &self,
        target: &str,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<()>;

    /// Whether any subscriber would currently receive `subject`.
    async fn has_interest(&self, subject: &str) -> bool;
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;
