//! Accounts own message sets and carry the resource accounting that
//! bounds them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{AccountLimits, MsgSetConfig, StorageType};
use crate::error::{Error, Result};
use crate::limits::AccountUsage;
use crate::msgset::MsgSet;
use crate::reply::{ENABLED_SUBJECT, OK_ACK};
use crate::server::Server;
use crate::subject::{is_valid_subject, subjects_overlap};
use crate::transport::{SharedTransport, SubscriptionId};

/// A named account with optional engine state.
pub struct Account {
    name: String,
    weak_self: Weak<Account>,
    server: Weak<Server>,
    transport: SharedTransport,
    state: Mutex<AccountState>,
}

#[derive(Default)]
struct AccountState {
    engine: Option<EngineState>,
}

struct EngineState {
    limits: AccountLimits,
    memory_used: u64,
    storage_used: u64,
    observables: usize,
    msg_sets: HashMap<String, Arc<MsgSet>>,
    store_dir: PathBuf,
    probe_sid: SubscriptionId,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Account {
    pub(crate) fn new(name: String, server: Weak<Server>, transport: SharedTransport) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            weak_self: weak.clone(),
            server,
            transport,
            state: Mutex::new(AccountState::default()),
        })
    }

    /// The account's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn server(&self) -> Result<Arc<Server>> {
        self.server
            .upgrade()
            .ok_or_else(|| Error::invalid_state("server has shut down"))
    }

    /// Enable the engine for this account, reserving the given limits
    /// against the server-wide pool. `None` admits the account with
    /// unbounded limits and no reservation.
    pub async fn enable_jetstream(&self, limits: Option<AccountLimits>) -> Result<()> {
        let server = self.server()?;
        let limits = limits.unwrap_or_default();

        let mut state = self.state.lock().await;
        if state.engine.is_some() {
            return Err(Error::already_exists("jetstream already enabled for account"));
        }

        server.reserve_resources(&limits).await?;

        let store_dir = match server.store_dir().await {
            Ok(dir) => dir.join(&self.name),
            Err(e) => {
                server.release_resources(&limits).await;
                return Err(e);
            }
        };

        // Answer the well-known enabled probe for this account.
        let (probe_sid, mut probe_rx) = match self.transport.subscribe(ENABLED_SUBJECT).await {
            Ok(sub) => sub,
            Err(e) => {
                server.release_resources(&limits).await;
                return Err(e);
            }
        };
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let transport = self.transport.clone();
        let probe_cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = probe_cancel.cancelled() => break,
                    msg = probe_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Some(reply) = msg.reply {
                            let _ = transport
                                .publish(&reply, None, bytes::Bytes::from_static(OK_ACK.as_bytes()))
                                .await;
                        }
                    }
                }
            }
        });

        state.engine = Some(EngineState {
            limits,
            memory_used: 0,
            storage_used: 0,
            observables: 0,
            msg_sets: HashMap::new(),
            store_dir,
            probe_sid,
            tracker,
            cancel,
        });

        info!(account = %self.name, "jetstream enabled");
        Ok(())
    }

    /// Disable the engine, tearing down every message set and releasing
    /// the account's reservation.
    pub async fn disable_jetstream(&self) -> Result<()> {
        let engine = {
            let mut state = self.state.lock().await;
            state
                .engine
                .take()
                .ok_or_else(|| Error::invalid_state("jetstream not enabled for account"))?
        };

        for mset in engine.msg_sets.values() {
            if let Err(e) = mset.teardown().await {
                warn!(account = %self.name, msg_set = mset.name(), "teardown failed: {e}");
            }
        }

        self.transport.unsubscribe(engine.probe_sid).await;
        engine.cancel.cancel();
        engine.tracker.close();
        engine.tracker.wait().await;

        if let Ok(server) = self.server() {
            server.release_resources(&engine.limits).await;
        }

        info!(account = %self.name, "jetstream disabled");
        Ok(())
    }

    /// Replace the account's limits, adjusting the server reservation.
    pub async fn update_jetstream_limits(&self, limits: AccountLimits) -> Result<()> {
        let server = self.server()?;
        let mut state = self.state.lock().await;
        let engine = state
            .engine
            .as_mut()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled for account"))?;

        server.adjust_resources(&engine.limits, &limits).await?;
        engine.limits = limits;
        Ok(())
    }

    /// Whether the engine is enabled for this account.
    pub async fn jetstream_enabled(&self) -> bool {
        self.state.lock().await.engine.is_some()
    }

    /// Snapshot of current resource consumption.
    pub async fn jetstream_usage(&self) -> Result<AccountUsage> {
        let state = self.state.lock().await;
        let engine = state
            .engine
            .as_ref()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled for account"))?;
        Ok(AccountUsage {
            memory: engine.memory_used,
            storage: engine.storage_used,
            msg_sets: engine.msg_sets.len(),
            observables: engine.observables,
        })
    }

    /// Create a message set owned by this account.
    pub async fn add_msg_set(&self, config: MsgSetConfig) -> Result<Arc<MsgSet>> {
        let mut config = config;
        validate_msg_set_config(&mut config)?;

        let store_dir = {
            let mut state = self.state.lock().await;
            let engine = state
                .engine
                .as_mut()
                .ok_or_else(|| Error::invalid_state("jetstream not enabled for account"))?;

            if engine.msg_sets.contains_key(&config.name) {
                return Err(Error::already_exists(format!(
                    "message set {} already exists",
                    config.name
                )));
            }
            if engine.limits.max_msg_sets >= 0
                && engine.msg_sets.len() as i64 >= engine.limits.max_msg_sets
            {
                return Err(Error::resource_exhausted("message set limit reached"));
            }
            if config.storage == StorageType::Memory
                && engine.limits.max_memory >= 0
                && config.max_bytes > engine.limits.max_memory
            {
                return Err(Error::resource_exhausted(
                    "message set byte limit exceeds account memory",
                ));
            }
            for other in engine.msg_sets.values() {
                for subject in &config.subjects {
                    for existing in &other.config().subjects {
                        if subjects_overlap(subject, existing) {
                            return Err(Error::config(format!(
                                "subject {subject} overlaps with message set {}",
                                other.name()
                            )));
                        }
                    }
                }
            }
            engine.store_dir.join(&config.name)
        };

        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::invalid_state("account has shut down"))?;
        let mset = MsgSet::create(&this, config, store_dir).await?;
        // File-backed sets may come up with recovered messages; those
        // count against the account like fresh appends.
        let recovered = mset.stats().await.bytes;

        {
            let mut state = self.state.lock().await;
            let Some(engine) = state.engine.as_mut() else {
                drop(state);
                let _ = mset.teardown().await;
                return Err(Error::invalid_state("jetstream not enabled for account"));
            };
            match mset.config().storage {
                StorageType::Memory => engine.memory_used += recovered,
                StorageType::File => engine.storage_used += recovered,
            }
            engine.msg_sets.insert(mset.name().to_string(), mset.clone());
        }
        debug!(account = %self.name, msg_set = mset.name(), "message set created");
        Ok(mset)
    }

    /// Delete a message set and everything attached to it.
    pub async fn delete_msg_set(&self, name: &str) -> Result<()> {
        let mset = {
            let mut state = self.state.lock().await;
            let engine = state
                .engine
                .as_mut()
                .ok_or_else(|| Error::invalid_state("jetstream not enabled for account"))?;
            engine
                .msg_sets
                .remove(name)
                .ok_or_else(|| Error::not_found(format!("message set {name}")))?
        };
        mset.teardown().await
    }

    /// Look up a message set by name.
    pub async fn lookup_msg_set(&self, name: &str) -> Option<Arc<MsgSet>> {
        let state = self.state.lock().await;
        state.engine.as_ref()?.msg_sets.get(name).cloned()
    }

    /// Names of the account's message sets.
    pub async fn msg_set_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .engine
            .as_ref()
            .map(|e| e.msg_sets.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Check limits and account for `size` bytes about to be stored.
    pub(crate) async fn try_store(&self, storage: StorageType, size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let engine = state
            .engine
            .as_mut()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled for account"))?;

        match storage {
            StorageType::Memory => {
                if engine.limits.max_memory >= 0
                    && engine.memory_used + size > engine.limits.max_memory as u64
                {
                    return Err(Error::resource_exhausted(
                        "resource limits exceeded for account",
                    ));
                }
                engine.memory_used += size;
            }
            StorageType::File => {
                if engine.limits.max_storage >= 0
                    && engine.storage_used + size > engine.limits.max_storage as u64
                {
                    return Err(Error::resource_exhausted(
                        "resource limits exceeded for account",
                    ));
                }
                engine.storage_used += size;
            }
        }
        Ok(())
    }

    /// Return `size` bytes to the account after a removal or a failed
    /// append.
    pub(crate) async fn release_stored(&self, storage: StorageType, size: u64) {
        let mut state = self.state.lock().await;
        if let Some(engine) = state.engine.as_mut() {
            match storage {
                StorageType::Memory => {
                    engine.memory_used = engine.memory_used.saturating_sub(size);
                }
                StorageType::File => {
                    engine.storage_used = engine.storage_used.saturating_sub(size);
                }
            }
        }
    }

    /// Claim an observable slot against the account cap.
    pub(crate) async fn try_add_observable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let engine = state
            .engine
            .as_mut()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled for account"))?;
        if engine.limits.max_observables >= 0
            && engine.observables as i64 >= engine.limits.max_observables
        {
            return Err(Error::resource_exhausted("observable limit reached"));
        }
        engine.observables += 1;
        Ok(())
    }

    /// Give back an observable slot.
    pub(crate) async fn release_observable(&self) {
        let mut state = self.state.lock().await;
        if let Some(engine) = state.engine.as_mut() {
            engine.observables = engine.observables.saturating_sub(1);
        }
    }

    /// Drop a message set from the registry without tearing it down;
    /// used when teardown was initiated from the set itself.
    pub(crate) async fn forget_msg_set(&self, name: &str) {
        let mut state = self.state.lock().await;
        if let Some(engine) = state.engine.as_mut() {
            engine.msg_sets.remove(name);
        }
    }
}

fn validate_msg_set_config(config: &mut MsgSetConfig) -> Result<()> {
    if config.name.is_empty() {
        return Err(Error::config("message set name required"));
    }
    if config
        .name
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(Error::config("message set name must be a literal token"));
    }
    if config.replicas > 1 {
        return Err(Error::config("replicas must be 1"));
    }
    config.replicas = 1;
    if config.subjects.is_empty() {
        config.subjects = vec![config.name.clone()];
    }
    for subject in &config.subjects {
        if !is_valid_subject(subject) {
            return Err(Error::config(format!("invalid subject {subject}")));
        }
    }
    for (i, a) in config.subjects.iter().enumerate() {
        for b in config.subjects.iter().skip(i + 1) {
            if subjects_overlap(a, b) {
                return Err(Error::config(format!("subjects {a} and {b} overlap")));
            }
        }
    }
    Ok(())
}
