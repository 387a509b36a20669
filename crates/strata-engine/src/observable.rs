//! Observables: stateful delivery cursors over a message set.
//!
//! Each observable runs one delivery/ack event loop and, for push
//! delivery, one activity checker. Every blocking wait selects on the
//! observable's cancellation token so deletion leaves no worker behind.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::config::{AckPolicy, ObservableConfig, ReplayPolicy, RetentionPolicy, StartPosition};
use crate::error::{Error, Result};
use crate::msgset::MsgSet;
use crate::reply;
use crate::reply::AckKind;
use crate::store::{MsgSetStore, ObservableJournal, StoredMsg};
use crate::subject::subject_matches;
use crate::transport::{Delivery, SharedTransport, SubscriptionId};

/// Default interval between interest checks for push observables.
pub const DEFAULT_ACTIVE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Default number of interest-less checks before an observable is
/// considered inactive.
pub const DEFAULT_ACTIVE_CHECK_THRESHOLD: u32 = 2;

/// Lifecycle state of an observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservableStatus {
    /// Delivering, or ready to deliver.
    Active,
    /// Push subject has lost interest; durables park here.
    Inactive,
    /// Terminal.
    Deleted,
}

/// A snapshot of the observable's cursor for introspection.
#[derive(Debug, Clone, Copy)]
pub struct ObservableInfo {
    /// Next store sequence the cursor will consider.
    pub next_store_seq: u64,
    /// Next deliver sequence to be assigned.
    pub next_deliver_seq: u64,
    /// Highest store sequence with everything at or below it settled.
    pub ack_floor_store_seq: u64,
    /// Outstanding unacked deliveries.
    pub num_pending: usize,
    /// Messages queued for redelivery.
    pub num_redelivered: usize,
}

struct PendingDelivery {
    deliver_seq: u64,
    deliver_count: u64,
    since: Instant,
}

struct Waiter {
    reply: String,
    remaining: u64,
}

struct ObsState {
    delivery: Option<String>,
    /// Next store sequence to consider for forward delivery.
    sseq: u64,
    /// Next deliver sequence to assign; never reused.
    dseq: u64,
    /// Outstanding deliveries keyed by store sequence.
    pending: HashMap<u64, PendingDelivery>,
    /// Store sequences due for redelivery, drained before the cursor.
    rdq: VecDeque<u64>,
    /// Delivery counts for messages parked in the redelivery queue.
    rdc: HashMap<u64, u64>,
    /// Parked pull requests, FIFO.
    waiting: VecDeque<Waiter>,
    /// Cumulative ack floor, only meaningful for [`AckPolicy::All`].
    all_floor: u64,
    /// Timestamp of the last delivered message, for replay pacing.
    last_delivered_ts: Option<SystemTime>,
    /// Bumped by purge/rebind so in-flight delivery decisions restart.
    generation: u64,
}

/// A delivery cursor attached to a message set.
pub struct Observable {
    name: String,
    mset_name: String,
    config: ObservableConfig,
    msgset: Weak<MsgSet>,
    store: Arc<Mutex<MsgSetStore>>,
    transport: SharedTransport,
    retention: RetentionPolicy,
    journaled: bool,
    state: Mutex<ObsState>,
    active: AtomicBool,
    deleted: AtomicBool,
    check_params: watch::Sender<(Duration, u32)>,
    kick: tokio::sync::Notify,
    sids: Mutex<Vec<SubscriptionId>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("mset_name", &self.mset_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Observable {
    pub(crate) async fn spawn(
        mset: &Arc<MsgSet>,
        name: String,
        config: ObservableConfig,
    ) -> Result<Arc<Self>> {
        let transport = mset.transport_handle();
        let store = mset.store_handle();
        let is_push = config.delivery_subject.is_some();
        let journaled = config.durable.is_some() && mset.is_file_backed();

        let (mut sseq, mut dseq) = {
            let stats = store.lock().await.stats();
            let sseq = match config.start {
                StartPosition::New => stats.last_seq + 1,
                StartPosition::All => stats.first_seq,
                StartPosition::Last => {
                    if stats.msgs == 0 {
                        stats.last_seq + 1
                    } else {
                        stats.last_seq
                    }
                }
                StartPosition::BySeq(seq) => seq.max(stats.first_seq),
                StartPosition::ByTime(t) => store.lock().await.seq_for_time(t),
            };
            (sseq, 1)
        };

        // Durables on file storage resume from their journal; anything
        // outstanding goes back through the redelivery queue.
        let mut rdq = VecDeque::new();
        let mut rdc = HashMap::new();
        if journaled {
            if let Some(journal) = store.lock().await.load_observable(&name).await? {
                sseq = journal.next_store_seq;
                dseq = journal.next_deliver_seq;
                let mut pending = journal.pending;
                pending.sort_unstable();
                for (seq, count) in pending {
                    rdq.push_back(seq);
                    rdc.insert(seq, count);
                }
            }
        }

        let ack_pattern = reply::ack_reply_pattern(mset.name(), &name);
        let (ack_sid, ack_rx) = transport.subscribe(&ack_pattern).await?;

        let mut sids = vec![ack_sid];
        let pull_rx = if is_push {
            None
        } else {
            let subject = reply::request_next_subject(mset.name(), &name);
            match transport.subscribe(&subject).await {
                Ok((sid, rx)) => {
                    sids.push(sid);
                    Some(rx)
                }
                Err(e) => {
                    transport.unsubscribe(ack_sid).await;
                    return Err(e);
                }
            }
        };

        let (check_params, _) = watch::channel((
            DEFAULT_ACTIVE_CHECK_INTERVAL,
            DEFAULT_ACTIVE_CHECK_THRESHOLD,
        ));

        let obs = Arc::new(Self {
            name,
            mset_name: mset.name().to_string(),
            msgset: Arc::downgrade(mset),
            store,
            transport,
            retention: mset.retention(),
            journaled,
            state: Mutex::new(ObsState {
                delivery: config.delivery_subject.clone(),
                sseq,
                dseq,
                pending: HashMap::new(),
                rdq,
                rdc,
                waiting: VecDeque::new(),
                all_floor: sseq.saturating_sub(1),
                last_delivered_ts: None,
                generation: 0,
            }),
            config,
            active: AtomicBool::new(true),
            deleted: AtomicBool::new(false),
            check_params,
            kick: tokio::sync::Notify::new(),
            sids: Mutex::new(sids),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });

        Self::spawn_event_loop(obs.clone(), mset.watch_appends(), ack_rx, pull_rx);
        if is_push {
            Self::spawn_activity_checker(obs.clone());
        }

        debug!(msg_set = %obs.mset_name, observable = %obs.name, "observable created");
        Ok(obs)
    }

    /// The observable's name; the durable name when one was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The observable's configuration.
    pub fn config(&self) -> &ObservableConfig {
        &self.config
    }

    /// Whether a subscriber is believed to be listening.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.deleted.load(Ordering::SeqCst)
    }

    /// Lifecycle state.
    pub fn status(&self) -> ObservableStatus {
        if self.deleted.load(Ordering::SeqCst) {
            ObservableStatus::Deleted
        } else if self.active.load(Ordering::SeqCst) {
            ObservableStatus::Active
        } else {
            ObservableStatus::Inactive
        }
    }

    /// The subject pull requests are sent to.
    pub fn request_next_msg_subject(&self) -> String {
        reply::request_next_subject(&self.mset_name, &self.name)
    }

    /// Next store sequence the cursor will consider.
    pub async fn next_seq(&self) -> u64 {
        self.state.lock().await.sseq
    }

    /// Cursor snapshot.
    pub async fn info(&self) -> ObservableInfo {
        let state = self.state.lock().await;
        ObservableInfo {
            next_store_seq: state.sseq,
            next_deliver_seq: state.dseq,
            ack_floor_store_seq: ack_floor(&state),
            num_pending: state.pending.len(),
            num_redelivered: state.rdq.len(),
        }
    }

    /// Decode the deliver sequence from an ack reply subject.
    pub fn seq_from_reply(&self, subject: &str) -> Option<u64> {
        reply::seq_from_reply(subject)
    }

    /// Decode all reply fields from an ack reply subject.
    pub fn reply_info(&self, subject: &str) -> Option<reply::ReplyInfo> {
        reply::reply_info(subject)
    }

    /// Override the activity check cadence. Intended for tests; the
    /// production defaults tolerate short reconnects.
    pub fn set_active_check_params(&self, interval: Duration, threshold: u32) {
        let _ = self.check_params.send((interval.max(Duration::from_millis(1)), threshold.max(1)));
    }

    /// Whether this observable's partition admits `subject`.
    pub fn partition_matches(&self, subject: &str) -> bool {
        match &self.config.partition {
            Some(partition) => subject_matches(subject, partition),
            None => true,
        }
    }

    /// Whether `seq` still awaits an ack from this observable.
    pub(crate) async fn needs_ack(&self, seq: u64) -> bool {
        let state = self.state.lock().await;
        match self.config.ack_policy {
            AckPolicy::None => seq >= state.sseq,
            AckPolicy::All => seq > state.all_floor,
            AckPolicy::Explicit => {
                seq >= state.sseq
                    || state.pending.contains_key(&seq)
                    || state.rdq.contains(&seq)
            }
        }
    }

    /// Advance the cursor past messages removed by a purge.
    pub(crate) async fn clamp_below(&self, first_seq: u64) {
        let mut state = self.state.lock().await;
        if state.sseq < first_seq {
            state.sseq = first_seq;
        }
        state.pending.retain(|&seq, _| seq >= first_seq);
        state.rdq.retain(|&seq| seq >= first_seq);
        state.rdc.retain(|&seq, _| seq >= first_seq);
        state.generation += 1;
        self.kick.notify_one();
    }

    /// Point an inactive durable at a new delivery subject. Anything
    /// unacked is redelivered with a fresh deliver sequence.
    pub(crate) async fn rebind(&self, delivery: String) -> Result<()> {
        if self.is_active() {
            return Err(Error::invalid_state("observable still active"));
        }
        let mut state = self.state.lock().await;
        state.delivery = Some(delivery);

        let mut outstanding: Vec<(u64, u64)> = state
            .pending
            .drain()
            .map(|(seq, p)| (seq, p.deliver_count))
            .collect();
        outstanding.sort_unstable();
        for (seq, count) in outstanding.into_iter().rev() {
            if !state.rdq.contains(&seq) {
                state.rdq.push_front(seq);
                state.rdc.insert(seq, count);
            }
        }
        state.generation += 1;
        drop(state);

        self.active.store(true, Ordering::SeqCst);
        self.kick.notify_one();
        debug!(msg_set = %self.mset_name, observable = %self.name, "observable re-bound");
        Ok(())
    }

    /// Delete this observable through its parent set.
    pub async fn delete(&self) -> Result<()> {
        let mset = self
            .msgset
            .upgrade()
            .ok_or_else(|| Error::not_found("message set gone"))?;
        mset.delete_observable(&self.name).await
    }

    /// Cancel every worker and wait for them to finish.
    pub(crate) async fn shutdown(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let sids = std::mem::take(&mut *self.sids.lock().await);
        for sid in sids {
            self.transport.unsubscribe(sid).await;
        }

        self.tracker.close();
        self.tracker.wait().await;

        let mut state = self.state.lock().await;
        state.waiting.clear();
        state.pending.clear();
        state.rdq.clear();
        debug!(msg_set = %self.mset_name, observable = %self.name, "observable deleted");
    }

    fn spawn_event_loop(
        obs: Arc<Self>,
        mut appends: watch::Receiver<u64>,
        mut ack_rx: mpsc::Receiver<Delivery>,
        mut pull_rx: Option<mpsc::Receiver<Delivery>>,
    ) {
        let cancel = obs.cancel.clone();
        obs.tracker.clone().spawn(async move {
            let tick = redelivery_tick(obs.config.ack_wait);
            let mut redelivery = tokio::time::interval(tick);
            redelivery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                if obs.try_deliver().await.is_break() {
                    break;
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    res = appends.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    msg = ack_rx.recv() => {
                        let Some(msg) = msg else { break };
                        obs.handle_ack(msg).await;
                    }
                    msg = recv_pull(&mut pull_rx) => {
                        let Some(msg) = msg else { break };
                        obs.handle_pull_request(msg).await;
                    }
                    _ = redelivery.tick() => {
                        if obs.config.ack_policy != AckPolicy::None {
                            obs.check_redelivery().await;
                        }
                    }
                    () = obs.kick.notified() => {}
                }
            }
        });
    }

    /// Interest watcher for push observables. Ephemerals that stay
    /// interest-less past the threshold are destroyed on the following
    /// check; durables only toggle between active and inactive.
    fn spawn_activity_checker(obs: Arc<Self>) {
        let cancel = obs.cancel.clone();
        let mut params = obs.check_params.subscribe();
        let durable = obs.config.durable.is_some();
        obs.tracker.clone().spawn(async move {
            let mut interest_less = 0u32;
            loop {
                let (interval, threshold) = *params.borrow();
                tokio::select! {
                    () = cancel.cancelled() => break,
                    res = params.changed() => {
                        if res.is_err() {
                            break;
                        }
                        interest_less = 0;
                        continue;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                let delivery = obs.state.lock().await.delivery.clone();
                let Some(delivery) = delivery else { continue };

                if obs.transport.has_interest(&delivery).await {
                    interest_less = 0;
                    if !obs.active.swap(true, Ordering::SeqCst) {
                        obs.kick.notify_one();
                    }
                    continue;
                }

                interest_less += 1;
                if interest_less < threshold {
                    continue;
                }
                if obs.active.swap(false, Ordering::SeqCst) {
                    debug!(observable = %obs.name, "observable went inactive");
                    continue;
                }
                if !durable {
                    // Grace period elapsed with no reconnect.
                    let Some(mset) = obs.msgset.upgrade() else { break };
                    let name = obs.name.clone();
                    tokio::spawn(async move {
                        let _ = mset.delete_observable(&name).await;
                    });
                    break;
                }
            }
        });
    }

    async fn handle_ack(&self, msg: Delivery) {
        let Some(info) = reply::reply_info(&msg.subject) else {
            trace!(observable = %self.name, subject = %msg.subject, "malformed ack subject");
            return;
        };
        let Some(kind) = AckKind::from_payload(&msg.payload) else {
            trace!(observable = %self.name, "unknown ack payload dropped");
            return;
        };

        let mut acked = Vec::new();
        {
            let mut state = self.state.lock().await;
            match kind {
                AckKind::Ack => acked = apply_ack(&mut state, self.config.ack_policy, &info),
                AckKind::Next => {
                    // Like nak and progress, ack-and-next on something no
                    // longer pending is a no-op; a stale request must not
                    // drain a message nobody asked for.
                    acked = apply_ack(&mut state, self.config.ack_policy, &info);
                    if !acked.is_empty() {
                        if let Some(reply) = msg.reply {
                            state.waiting.push_back(Waiter {
                                reply,
                                remaining: 1,
                            });
                        }
                    }
                }
                AckKind::Nak => {
                    // Cannot nak what was already acked.
                    if let Some(entry) = state.pending.remove(&info.store_seq) {
                        state.rdc.insert(info.store_seq, entry.deliver_count);
                        state.rdq.push_front(info.store_seq);
                    }
                }
                AckKind::Progress => {
                    if let Some(entry) = state.pending.get_mut(&info.store_seq) {
                        entry.since = Instant::now();
                    }
                }
            }
        }

        if !acked.is_empty() {
            if self.retention != RetentionPolicy::Stream {
                if let Some(mset) = self.msgset.upgrade() {
                    for seq in &acked {
                        mset.msg_acked(*seq).await;
                    }
                }
            }
            self.save_journal().await;
        }
    }

    async fn handle_pull_request(&self, msg: Delivery) {
        let Some(reply) = msg.reply else { return };
        let batch = std::str::from_utf8(&msg.payload)
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(1)
            .max(1);
        let mut state = self.state.lock().await;
        state.waiting.push_back(Waiter {
            reply,
            remaining: batch,
        });
    }

    async fn check_redelivery(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut expired: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.since) >= self.config.ack_wait)
            .map(|(&seq, _)| seq)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable();
        for &seq in expired.iter().rev() {
            if let Some(entry) = state.pending.remove(&seq) {
                state.rdc.insert(seq, entry.deliver_count);
                state.rdq.push_front(seq);
            }
        }
        trace!(observable = %self.name, count = expired.len(), "scheduling redeliveries");
    }

    /// Deliver every currently eligible message, pacing per the replay
    /// policy. Returns `Break` when the observable is shutting down.
    async fn try_deliver(&self) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        loop {
            if self.deleted.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }

            let mut state = self.state.lock().await;
            let generation = state.generation;

            // Resolve the delivery target first; without one there is
            // nothing to advance.
            let target = match &state.delivery {
                Some(subject) => {
                    if !self.transport.has_interest(subject).await {
                        if self.active.swap(false, Ordering::SeqCst) {
                            debug!(observable = %self.name, "no interest, pausing delivery");
                        }
                        return ControlFlow::Continue(());
                    }
                    self.active.store(true, Ordering::SeqCst);
                    subject.clone()
                }
                None => loop {
                    let Some(waiter) = state.waiting.front() else {
                        return ControlFlow::Continue(());
                    };
                    // Parked requests whose requester is gone can no
                    // longer be answered; drop them silently.
                    if self.transport.has_interest(&waiter.reply).await {
                        break waiter.reply.clone();
                    }
                    state.waiting.pop_front();
                },
            };

            let Some((msg, deliver_count, from_rdq)) = self.next_msg(&mut state).await else {
                return ControlFlow::Continue(());
            };

            // Replay pacing reproduces the recorded inter-arrival gap
            // with a cancellable sleep.
            if self.config.replay == ReplayPolicy::Original {
                if let Some(prev) = state.last_delivered_ts {
                    if let Ok(gap) = msg.ts.duration_since(prev) {
                        if !gap.is_zero() {
                            drop(state);
                            tokio::select! {
                                () = self.cancel.cancelled() => return ControlFlow::Break(()),
                                () = tokio::time::sleep(gap) => {}
                            }
                            state = self.state.lock().await;
                            if state.generation != generation {
                                continue;
                            }
                        }
                    }
                }
            }

            // Commit the delivery.
            if from_rdq {
                state.rdq.pop_front();
                state.rdc.remove(&msg.seq);
            } else {
                state.sseq = msg.seq + 1;
            }
            let deliver_seq = state.dseq;
            state.dseq += 1;
            if self.config.ack_policy != AckPolicy::None {
                state.pending.insert(
                    msg.seq,
                    PendingDelivery {
                        deliver_seq,
                        deliver_count,
                        since: Instant::now(),
                    },
                );
            }
            if state.delivery.is_none() {
                if let Some(waiter) = state.waiting.front_mut() {
                    waiter.remaining -= 1;
                    if waiter.remaining == 0 {
                        state.waiting.pop_front();
                    }
                }
            }
            state.last_delivered_ts = Some(msg.ts);
            drop(state);

            let ack_reply = reply::ack_reply_subject(
                &self.mset_name,
                &self.name,
                deliver_count,
                msg.seq,
                deliver_seq,
            );
            if let Err(e) = self
                .transport
                .deliver(&target, &msg.subject, Some(&ack_reply), msg.payload.clone())
                .await
            {
                // The pending entry stays; the ack-wait timer retries.
                warn!(observable = %self.name, "delivery failed: {e}");
            }

            self.save_journal().await;
        }
    }

    /// Pick the next message: redeliveries first, then the cursor,
    /// skipping messages outside the partition without consuming a
    /// deliver sequence.
    async fn next_msg(&self, state: &mut ObsState) -> Option<(StoredMsg, u64, bool)> {
        loop {
            let Some(&seq) = state.rdq.front() else { break };
            match self.store.lock().await.lookup(seq) {
                Some(msg) => {
                    let count = state.rdc.get(&seq).copied().unwrap_or(0) + 1;
                    return Some((msg, count, true));
                }
                None => {
                    // Evicted while parked.
                    state.rdq.pop_front();
                    state.rdc.remove(&seq);
                }
            }
        }

        loop {
            let store = self.store.lock().await;
            let stats = store.stats();
            if state.sseq > stats.last_seq {
                return None;
            }
            let seq = state.sseq;
            match store.lookup(seq) {
                Some(msg) if self.partition_matches(&msg.subject) => {
                    return Some((msg, 1, false));
                }
                _ => {
                    // Missing (trimmed) or filtered out: advance the
                    // store cursor without minting a deliver sequence.
                    drop(store);
                    state.sseq = seq + 1;
                }
            }
        }
    }

    async fn save_journal(&self) {
        if !self.journaled {
            return;
        }
        let journal = {
            let state = self.state.lock().await;
            let mut pending: Vec<(u64, u64)> = state
                .pending
                .iter()
                .map(|(&seq, p)| (seq, p.deliver_count))
                .collect();
            pending.extend(
                state
                    .rdq
                    .iter()
                    .map(|&seq| (seq, state.rdc.get(&seq).copied().unwrap_or(1))),
            );
            ObservableJournal {
                next_store_seq: state.sseq,
                next_deliver_seq: state.dseq,
                pending,
            }
        };
        if let Err(e) = self
            .store
            .lock()
            .await
            .save_observable(&self.name, &journal)
            .await
        {
            warn!(observable = %self.name, "journal write failed: {e}");
        }
    }
}

fn ack_floor(state: &ObsState) -> u64 {
    state
        .pending
        .keys()
        .copied()
        .chain(state.rdq.iter().copied())
        .min()
        .map_or_else(|| state.sseq.saturating_sub(1), |low| low.saturating_sub(1))
}

fn apply_ack(state: &mut ObsState, policy: AckPolicy, info: &reply::ReplyInfo) -> Vec<u64> {
    match policy {
        AckPolicy::None => Vec::new(),
        AckPolicy::Explicit => {
            if let Some(_entry) = state.pending.remove(&info.store_seq) {
                state.rdc.remove(&info.store_seq);
                vec![info.store_seq]
            } else {
                Vec::new()
            }
        }
        AckPolicy::All => {
            // Cumulative: everything delivered up to this deliver
            // sequence is settled.
            let mut acked: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deliver_seq <= info.deliver_seq)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in &acked {
                state.pending.remove(seq);
                state.rdc.remove(seq);
            }
            let floor = acked.iter().copied().max().unwrap_or(0);
            state.all_floor = state.all_floor.max(floor).max(info.store_seq);
            acked.sort_unstable();
            acked
        }
    }
}

fn redelivery_tick(ack_wait: Duration) -> Duration {
    (ack_wait / 4).max(Duration::from_millis(5))
}

async fn recv_pull(rx: &mut Option<mpsc::Receiver<Delivery>>) -> Option<Delivery> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
