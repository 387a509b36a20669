//! Message sets: durable, ordered logs of messages received on a set of
//! subject filters.
//!
//! Each set owns a serialized ingest lane: one task drains every subject
//! subscription, appends in arrival order, answers pub-acks, and signals
//! attached observables through a watch channel carrying the latest
//! stored sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::stream::{select_all, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::account::Account;
use crate::config::{
    AckPolicy, MsgSetConfig, ObservableConfig, RetentionPolicy, StartPosition, StorageType,
};
use crate::error::{Error, Result};
use crate::observable::Observable;
use crate::reply::OK_ACK;
use crate::store::{msg_size, FileStore, MemoryStore, MsgSetStore, StoreLimits, StoreStats, StoredMsg};
use crate::subject::{is_literal_subject, is_valid_subject, subject_matches, subjects_overlap};
use crate::transport::{Delivery, SharedTransport, SubscriptionId};

/// A durable, ordered log of messages with attached observables.
pub struct MsgSet {
    name: String,
    config: MsgSetConfig,
    weak_self: Weak<MsgSet>,
    account: Weak<Account>,
    transport: SharedTransport,
    store: Arc<Mutex<MsgSetStore>>,
    state: Mutex<MsgSetState>,
    notify: watch::Sender<u64>,
    deleted: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for MsgSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgSet")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct MsgSetState {
    observables: HashMap<String, Arc<Observable>>,
    sids: Vec<SubscriptionId>,
}

impl MsgSet {
    pub(crate) async fn create(
        account: &Arc<Account>,
        config: MsgSetConfig,
        store_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let transport = account.transport().clone();

        let limits = StoreLimits {
            max_msgs: config.max_msgs,
            max_bytes: config.max_bytes,
            max_age: config.max_age,
        };
        let store = match config.storage {
            StorageType::Memory => MsgSetStore::Memory(MemoryStore::new(limits)),
            StorageType::File => MsgSetStore::File(FileStore::open(store_dir, limits).await?),
        };
        let last_seq = store.stats().last_seq;

        let mut sids = Vec::with_capacity(config.subjects.len());
        let mut receivers = Vec::with_capacity(config.subjects.len());
        for subject in &config.subjects {
            match transport.subscribe(subject).await {
                Ok((sid, rx)) => {
                    sids.push(sid);
                    receivers.push(ReceiverStream::new(rx));
                }
                Err(e) => {
                    for sid in sids {
                        transport.unsubscribe(sid).await;
                    }
                    return Err(e);
                }
            }
        }

        let (notify, _) = watch::channel(last_seq);
        let mset = Arc::new_cyclic(|weak| Self {
            name: config.name.clone(),
            config,
            weak_self: weak.clone(),
            account: Arc::downgrade(account),
            transport,
            store: Arc::new(Mutex::new(store)),
            state: Mutex::new(MsgSetState {
                observables: HashMap::new(),
                sids,
            }),
            notify,
            deleted: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });

        Self::spawn_ingest(mset.clone(), receivers);
        if !mset.config.max_age.is_zero() {
            Self::spawn_age_trimmer(mset.clone());
        }

        Ok(mset)
    }

    fn spawn_ingest(mset: Arc<Self>, receivers: Vec<ReceiverStream<Delivery>>) {
        let cancel = mset.cancel.clone();
        mset.tracker.clone().spawn(async move {
            let mut inbound = select_all(receivers);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    msg = inbound.next() => {
                        let Some(msg) = msg else { break };
                        mset.process_inbound(msg).await;
                    }
                }
            }
        });
    }

    /// Re-arms against the oldest message's age deadline rather than
    /// polling on a fixed interval.
    fn spawn_age_trimmer(mset: Arc<Self>) {
        let cancel = mset.cancel.clone();
        let mut notify = mset.notify.subscribe();
        mset.tracker.clone().spawn(async move {
            loop {
                let deadline = mset.store.lock().await.next_age_deadline();
                match deadline {
                    Some(deadline) => {
                        let wait = deadline
                            .duration_since(std::time::SystemTime::now())
                            .unwrap_or_default();
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(wait) => {
                                mset.expire_aged().await;
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            res = notify.changed() => {
                                if res.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    async fn expire_aged(&self) {
        let (expired, freed) = {
            let mut store = self.store.lock().await;
            match store.expire_aged(std::time::SystemTime::now()).await {
                Ok(res) => res,
                Err(e) => {
                    warn!(msg_set = %self.name, "age expiry failed: {e}");
                    return;
                }
            }
        };
        if freed > 0 {
            if let Some(account) = self.account.upgrade() {
                account.release_stored(self.config.storage, freed).await;
            }
            debug!(msg_set = %self.name, count = expired.len(), "expired aged messages");
        }
    }

    async fn process_inbound(&self, msg: Delivery) {
        let size = msg_size(&msg.subject, &msg.payload);
        let respond = msg.reply.as_deref().filter(|_| !self.config.no_ack);

        let Some(account) = self.account.upgrade() else {
            return;
        };
        if let Err(e) = account.try_store(self.config.storage, size).await {
            trace!(msg_set = %self.name, "append rejected: {e}");
            if let Some(reply) = respond {
                let _ = self
                    .transport
                    .publish(reply, None, error_payload(&e))
                    .await;
            }
            return;
        }

        let appended = {
            let mut store = self.store.lock().await;
            store.store(&msg.subject, msg.payload).await
        };
        match appended {
            Ok(res) => {
                if res.evicted_bytes > 0 {
                    account
                        .release_stored(self.config.storage, res.evicted_bytes)
                        .await;
                }
                self.notify.send_replace(res.seq);
                if let Some(reply) = respond {
                    let _ = self
                        .transport
                        .publish(reply, None, Bytes::from_static(OK_ACK.as_bytes()))
                        .await;
                }
            }
            Err(e) => {
                account.release_stored(self.config.storage, size).await;
                warn!(msg_set = %self.name, "append failed: {e}");
                if let Some(reply) = respond {
                    let _ = self
                        .transport
                        .publish(reply, None, error_payload(&e))
                        .await;
                }
            }
        }
    }

    /// The set's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The set's configuration.
    pub fn config(&self) -> &MsgSetConfig {
        &self.config
    }

    /// Current store statistics.
    pub async fn stats(&self) -> StoreStats {
        self.store.lock().await.stats()
    }

    /// Fetch a stored message by sequence.
    pub async fn get_msg(&self, seq: u64) -> Option<StoredMsg> {
        self.store.lock().await.lookup(seq)
    }

    pub(crate) fn store_handle(&self) -> Arc<Mutex<MsgSetStore>> {
        self.store.clone()
    }

    pub(crate) fn transport_handle(&self) -> SharedTransport {
        self.transport.clone()
    }

    pub(crate) fn is_file_backed(&self) -> bool {
        self.config.storage == StorageType::File
    }

    pub(crate) fn watch_appends(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    pub(crate) fn retention(&self) -> RetentionPolicy {
        self.config.retention
    }

    /// Remove every stored message. Sequence assignment continues where
    /// it left off; observables below the new first sequence advance.
    pub async fn purge(&self) -> Result<u64> {
        let (removed, bytes) = {
            let mut store = self.store.lock().await;
            store.purge().await?
        };
        if let Some(account) = self.account.upgrade() {
            account.release_stored(self.config.storage, bytes).await;
        }

        let new_first = self.store.lock().await.stats().first_seq;
        let state = self.state.lock().await;
        for obs in state.observables.values() {
            obs.clamp_below(new_first).await;
        }
        Ok(removed)
    }

    /// Attach an observable to this set.
    pub async fn add_observable(&self, config: ObservableConfig) -> Result<Arc<Observable>> {
        self.validate_observable_config(&config)?;

        let name = match &config.durable {
            Some(durable) => durable.clone(),
            None => uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
        };

        {
            let state = self.state.lock().await;

            // A durable that already exists either collides or, when it
            // has gone inactive, is re-bound to the new delivery subject.
            if let Some(existing) = state.observables.get(&name) {
                if config.durable.is_none() || existing.is_active() {
                    return Err(Error::already_exists(format!(
                        "observable {name} already active"
                    )));
                }
                if existing.config().ack_policy != config.ack_policy
                    || existing.config().partition != config.partition
                {
                    return Err(Error::already_exists(format!(
                        "observable {name} exists with a different configuration"
                    )));
                }
                let Some(delivery) = config.delivery_subject.clone() else {
                    return Err(Error::already_exists(format!(
                        "observable {name} already exists"
                    )));
                };
                existing.rebind(delivery).await?;
                return Ok(existing.clone());
            }

            if self.config.retention == RetentionPolicy::WorkQueue {
                for other in state.observables.values() {
                    let overlap = match (&config.partition, other.config().partition.as_deref()) {
                        (Some(a), Some(b)) => subjects_overlap(a, b),
                        _ => true,
                    };
                    if overlap {
                        return Err(Error::config(
                            "work queue observables must not overlap",
                        ));
                    }
                }
            }
        }

        // Ephemeral push delivery requires a listener at creation time.
        if config.durable.is_none() {
            if let Some(delivery) = &config.delivery_subject {
                if !self.transport.has_interest(delivery).await {
                    return Err(Error::config(format!(
                        "no interest in delivery subject {delivery}"
                    )));
                }
            }
        }

        let account = self
            .account
            .upgrade()
            .ok_or_else(|| Error::invalid_state("account has shut down"))?;
        account.try_add_observable().await?;

        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::invalid_state("message set has shut down"))?;
        let obs = match Observable::spawn(&this, name.clone(), config).await {
            Ok(obs) => obs,
            Err(e) => {
                account.release_observable().await;
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        state.observables.insert(name, obs.clone());
        Ok(obs)
    }

    fn validate_observable_config(&self, config: &ObservableConfig) -> Result<()> {
        if let Some(durable) = &config.durable {
            if durable.is_empty()
                || durable
                    .chars()
                    .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
            {
                return Err(Error::config("durable name must be a literal token"));
            }
        }

        match &config.delivery_subject {
            Some(delivery) => {
                if !is_valid_subject(delivery) || !is_literal_subject(delivery) {
                    return Err(Error::config("delivery subject must be a literal subject"));
                }
                // Delivering into the set's own filter would self-ingest.
                if self
                    .config
                    .subjects
                    .iter()
                    .any(|s| subject_matches(delivery, s))
                {
                    return Err(Error::config(
                        "delivery subject overlaps message set subjects",
                    ));
                }
                if self.config.retention == RetentionPolicy::WorkQueue {
                    return Err(Error::config(
                        "work queue message sets only support pull observables",
                    ));
                }
            }
            None => {
                if config.ack_policy != AckPolicy::Explicit {
                    return Err(Error::config("pull observables require explicit ack"));
                }
            }
        }

        if self.config.retention == RetentionPolicy::WorkQueue
            && config.start != StartPosition::All
        {
            return Err(Error::config(
                "work queue observables must start at the beginning",
            ));
        }

        if let Some(partition) = &config.partition {
            if !is_valid_subject(partition) {
                return Err(Error::config(format!("invalid partition {partition}")));
            }
            if !self
                .config
                .subjects
                .iter()
                .any(|s| subjects_overlap(partition, s))
            {
                return Err(Error::config(
                    "partition does not overlap message set subjects",
                ));
            }
            if config.ack_policy == AckPolicy::All {
                return Err(Error::config(
                    "partitioned observables may not use cumulative ack",
                ));
            }
        }

        Ok(())
    }

    /// Detach and destroy an observable.
    pub async fn delete_observable(&self, name: &str) -> Result<()> {
        let obs = {
            let mut state = self.state.lock().await;
            state
                .observables
                .remove(name)
                .ok_or_else(|| Error::not_found(format!("observable {name}")))?
        };
        obs.shutdown().await;
        self.store.lock().await.remove_observable(name).await?;
        if let Some(account) = self.account.upgrade() {
            account.release_observable().await;
        }
        Ok(())
    }

    /// Look up an observable by name.
    pub async fn lookup_observable(&self, name: &str) -> Option<Arc<Observable>> {
        self.state.lock().await.observables.get(name).cloned()
    }

    /// Number of attached observables.
    pub async fn num_observables(&self) -> usize {
        self.state.lock().await.observables.len()
    }

    /// Names of the attached observables.
    pub async fn observable_names(&self) -> Vec<String> {
        self.state.lock().await.observables.keys().cloned().collect()
    }

    /// Retention hook: an observable acked `seq`.
    pub(crate) async fn msg_acked(&self, seq: u64) {
        match self.config.retention {
            RetentionPolicy::Stream => {}
            RetentionPolicy::WorkQueue => {
                self.remove_msg(seq).await;
            }
            RetentionPolicy::Interest => {
                let Some(msg) = self.store.lock().await.lookup(seq) else {
                    return;
                };
                let state = self.state.lock().await;
                for obs in state.observables.values() {
                    if !obs.partition_matches(&msg.subject) {
                        continue;
                    }
                    if obs.needs_ack(seq).await {
                        return;
                    }
                }
                drop(state);
                self.remove_msg(seq).await;
            }
        }
    }

    async fn remove_msg(&self, seq: u64) {
        let removed = {
            let mut store = self.store.lock().await;
            store.remove(seq).await
        };
        match removed {
            Ok(Some(size)) => {
                if let Some(account) = self.account.upgrade() {
                    account.release_stored(self.config.storage, size).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(msg_set = %self.name, seq, "remove failed: {e}"),
        }
    }

    /// Delete the set: observables first, then the log and its usage.
    pub async fn delete(&self) -> Result<()> {
        if let Some(account) = self.account.upgrade() {
            account.forget_msg_set(&self.name).await;
        }
        self.teardown().await
    }

    pub(crate) async fn teardown(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return Err(Error::not_found(format!("message set {}", self.name)));
        }

        let (observables, sids) = {
            let mut state = self.state.lock().await;
            let observables: Vec<_> = state.observables.drain().map(|(_, o)| o).collect();
            let sids = std::mem::take(&mut state.sids);
            (observables, sids)
        };

        for sid in sids {
            self.transport.unsubscribe(sid).await;
        }

        let account = self.account.upgrade();
        for obs in observables {
            obs.shutdown().await;
            if let Some(account) = &account {
                account.release_observable().await;
            }
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let (_, bytes) = {
            let mut store = self.store.lock().await;
            store.purge().await?
        };
        if let Some(account) = &account {
            if bytes > 0 {
                account.release_stored(self.config.storage, bytes).await;
            }
        }

        debug!(msg_set = %self.name, "message set deleted");
        Ok(())
    }
}

fn error_payload(e: &Error) -> Bytes {
    Bytes::from(format!("-ERR '{e}'"))
}
