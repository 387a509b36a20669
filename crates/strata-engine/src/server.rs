//! Server-level orchestration: account registry and the engine-wide
//! reservation pool.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::account::Account;
use crate::config::{AccountLimits, EngineConfig};
use crate::error::{Error, Result};
use crate::limits::{dynamic_max_memory, ReservationPool};
use crate::transport::SharedTransport;

/// Name of the implicitly registered global account.
pub const GLOBAL_ACCOUNT: &str = "$G";

/// The engine's root object: owns accounts and the reservation pool.
pub struct Server {
    weak_self: Weak<Server>,
    transport: SharedTransport,
    accounts: DashMap<String, Arc<Account>>,
    state: Mutex<ServerState>,
}

struct ServerState {
    engine: Option<EngineGlobal>,
}

struct EngineGlobal {
    config: EngineConfig,
    pool: ReservationPool,
}

impl Server {
    /// Create a server bound to the given transport.
    pub fn new(transport: SharedTransport) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            transport,
            accounts: DashMap::new(),
            state: Mutex::new(ServerState { engine: None }),
        })
    }

    /// Enable the engine server-wide and on the global account.
    ///
    /// `None` resolves a dynamic configuration: memory capped at about
    /// 75% of host RAM and the store directory under the system temp
    /// directory.
    pub async fn enable_jetstream(&self, config: Option<EngineConfig>) -> Result<()> {
        let mut config = config.unwrap_or_default();
        if config.max_memory == 0 {
            config.max_memory = dynamic_max_memory();
        }
        std::fs::create_dir_all(&config.store_dir)?;

        {
            let mut state = self.state.lock().await;
            if state.engine.is_some() {
                return Err(Error::already_exists("jetstream already enabled"));
            }
            let pool = ReservationPool::new(config.max_memory, config.max_storage);
            state.engine = Some(EngineGlobal {
                config: config.clone(),
                pool,
            });
        }

        info!(
            max_memory = config.max_memory,
            max_storage = config.max_storage,
            store_dir = %config.store_dir.display(),
            "jetstream enabled"
        );

        let global = self.global_account().await;
        global.enable_jetstream(None).await
    }

    /// Whether the engine is enabled.
    pub async fn jetstream_enabled(&self) -> bool {
        self.state.lock().await.engine.is_some()
    }

    /// The resolved engine configuration, if enabled.
    pub async fn jetstream_config(&self) -> Option<EngineConfig> {
        let state = self.state.lock().await;
        state.engine.as_ref().map(|e| e.config.clone())
    }

    /// The implicitly registered global account.
    pub async fn global_account(&self) -> Arc<Account> {
        self.lookup_or_register_account(GLOBAL_ACCOUNT).await
    }

    /// Fetch an account, registering it on first use.
    pub async fn lookup_or_register_account(&self, name: &str) -> Arc<Account> {
        self.accounts
            .entry(name.to_string())
            .or_insert_with(|| {
                Account::new(
                    name.to_string(),
                    self.weak_self.clone(),
                    self.transport.clone(),
                )
            })
            .clone()
    }

    /// Number of accounts with the engine enabled.
    pub async fn num_jetstream_accounts(&self) -> usize {
        let accounts: Vec<Arc<Account>> = self
            .accounts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut enabled = 0;
        for account in accounts {
            if account.jetstream_enabled().await {
                enabled += 1;
            }
        }
        enabled
    }

    /// Currently reserved `(memory, storage)` across all accounts.
    pub async fn reserved_resources(&self) -> Result<(i64, i64)> {
        let state = self.state.lock().await;
        let engine = state
            .engine
            .as_ref()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled"))?;
        Ok(engine.pool.reserved())
    }

    /// Disable every account and drop the engine state.
    pub async fn shutdown(&self) {
        let accounts: Vec<Arc<Account>> = self
            .accounts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for account in accounts {
            if account.jetstream_enabled().await {
                if let Err(e) = account.disable_jetstream().await {
                    warn!(account = account.name(), "disable failed during shutdown: {e}");
                }
            }
        }
        self.accounts.clear();
        self.state.lock().await.engine = None;
        info!("jetstream shut down");
    }

    pub(crate) async fn store_dir(&self) -> Result<std::path::PathBuf> {
        let state = self.state.lock().await;
        let engine = state
            .engine
            .as_ref()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled"))?;
        Ok(engine.config.store_dir.clone())
    }

    pub(crate) async fn reserve_resources(&self, limits: &AccountLimits) -> Result<()> {
        let mut state = self.state.lock().await;
        let engine = state
            .engine
            .as_mut()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled"))?;
        engine.pool.reserve(limits)
    }

    pub(crate) async fn release_resources(&self, limits: &AccountLimits) {
        let mut state = self.state.lock().await;
        if let Some(engine) = state.engine.as_mut() {
            engine.pool.release(limits);
        }
    }

    pub(crate) async fn adjust_resources(
        &self,
        old: &AccountLimits,
        new: &AccountLimits,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let engine = state
            .engine
            .as_mut()
            .ok_or_else(|| Error::invalid_state("jetstream not enabled"))?;
        engine.pool.release(old);
        if let Err(e) = engine.pool.reserve(new) {
            // Restore the old reservation so accounting stays balanced.
            engine
                .pool
                .reserve(old)
                .expect("restoring a released reservation cannot fail");
            return Err(e);
        }
        Ok(())
    }
}
