//! In-memory implementation of the engine's transport interface.
//!
//! Routes published messages to every subscription whose pattern matches,
//! tracks interest, and offers a request/reply helper for clients. Each
//! bus instance is isolated; tests create one per server.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::trace;

use strata_engine::error::{Error, Result};
use strata_engine::subject::{is_valid_subject, subject_matches};
use strata_engine::transport::{Delivery, SubscriptionId, Transport};

const SUBSCRIPTION_BUFFER: usize = 8192;

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct BusState {
    subs: HashMap<SubscriptionId, Subscription>,
    next_sid: SubscriptionId,
}

/// An in-memory subject bus.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<BusState>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn route(&self, route_subject: &str, delivery: Delivery) {
        let mut state = self.state.lock().await;
        // Prune subscriptions whose receivers are gone so interest
        // reflects live listeners.
        state.subs.retain(|_, sub| !sub.tx.is_closed());
        for sub in state.subs.values() {
            if subject_matches(route_subject, &sub.pattern) {
                // Fire and forget; a full subscriber drops the message
                // like any slow consumer would.
                if sub.tx.try_send(delivery.clone()).is_err() {
                    trace!(subject = route_subject, "dropping message for slow subscriber");
                }
            }
        }
    }

    /// Publish and wait for a single reply on a private inbox.
    pub async fn request(&self, subject: &str, payload: Bytes, wait: Duration) -> Result<Delivery> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let (sid, mut rx) = self.subscribe(&inbox).await?;
        self.publish(subject, Some(&inbox), payload).await?;
        let reply = timeout(wait, rx.recv()).await;
        self.unsubscribe(sid).await;
        match reply {
            Ok(Some(delivery)) => Ok(delivery),
            Ok(None) => Err(Error::transient("inbox closed")),
            Err(_) => Err(Error::transient("request timed out")),
        }
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn subscribe(&self, pattern: &str) -> Result<(SubscriptionId, mpsc::Receiver<Delivery>)> {
        if !is_valid_subject(pattern) {
            return Err(Error::config(format!("invalid subject pattern {pattern}")));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut state = self.state.lock().await;
        state.next_sid += 1;
        let sid = state.next_sid;
        state.subs.insert(
            sid,
            Subscription {
                pattern: pattern.to_string(),
                tx,
            },
        );
        Ok((sid, rx))
    }

    async fn unsubscribe(&self, sid: SubscriptionId) {
        self.state.lock().await.subs.remove(&sid);
    }

    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        if !is_valid_subject(subject) {
            return Err(Error::config(format!("invalid subject {subject}")));
        }
        let delivery = Delivery {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };
        self.route(subject, delivery).await;
        Ok(())
    }

    async fn deliver(
        &self,
        target: &str,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<()> {
        let delivery = Delivery {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };
        self.route(target, delivery).await;
        Ok(())
    }

    async fn has_interest(&self, subject: &str) -> bool {
        let mut state = self.state.lock().await;
        state.subs.retain(|_, sub| !sub.tx.is_closed());
        state
            .subs
            .values()
            .any(|sub| subject_matches(subject, &sub.pattern))
    }
}
