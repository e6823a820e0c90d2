use crate::error::SchedulerError;
use crate::traits::ShardExecutor;
use parking_lot::Mutex;
use shardex_primitives::Address;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

struct ShardEntry {
    shard: Arc<dyn ShardExecutor>,
    contracts: HashSet<Address>,
}

#[derive(Default)]
struct Inner {
    shards: HashMap<String, ShardEntry>,
    affinity: HashMap<Address, String>,
}

/// Sticky load-balancing router from contract address to execution shard.
///
/// A contract binds to a shard on first dispatch and keeps that affinity
/// until the shard unregisters, minimizing cross-shard state movement. The
/// least-loaded pick and the binding happen under one mutex so tied shards
/// cannot both be assigned the same contract burst.
pub struct ExecutorManager {
    inner: Mutex<Inner>,
}

impl ExecutorManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        shard: Arc<dyn ShardExecutor>,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.shards.contains_key(&name) {
            return Err(SchedulerError::DuplicateExecutor(name));
        }
        info!(executor = %name, "registered executor");
        inner.shards.insert(
            name,
            ShardEntry {
                shard,
                contracts: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Unregister a shard and drop every contract affinity it owns, so
    /// future dispatch re-assigns those contracts.
    pub fn unregister(&self, name: &str) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .shards
            .remove(name)
            .ok_or_else(|| SchedulerError::ExecutorNotFound(name.to_string()))?;
        for contract in &entry.contracts {
            inner.affinity.remove(contract);
        }
        info!(executor = %name, contracts = entry.contracts.len(), "unregistered executor");
        Ok(())
    }

    /// Resolve the shard responsible for `contract`, binding it to the
    /// least-loaded shard (fewest bound contracts, lowest name on ties) if it
    /// has no affinity yet.
    pub fn route(&self, contract: &Address) -> Result<Arc<dyn ShardExecutor>, SchedulerError> {
        let mut inner = self.inner.lock();

        if let Some(name) = inner.affinity.get(contract) {
            if let Some(entry) = inner.shards.get(name) {
                return Ok(entry.shard.clone());
            }
        }

        let name = inner
            .shards
            .iter()
            .min_by_key(|&(name, entry)| (entry.contracts.len(), name.as_str()))
            .map(|(name, _)| name.clone())
            .ok_or(SchedulerError::NoExecutor)?;

        let entry = inner
            .shards
            .get_mut(&name)
            .ok_or(SchedulerError::NoExecutor)?;
        entry.contracts.insert(*contract);
        let shard = entry.shard.clone();
        debug!(%contract, executor = %name, "bound contract to executor");
        inner.affinity.insert(*contract, name);
        Ok(shard)
    }

    /// All registered shards, for block-wide fan-out operations.
    pub fn shards(&self) -> Vec<Arc<dyn ShardExecutor>> {
        self.inner
            .lock()
            .shards
            .values()
            .map(|entry| entry.shard.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().shards.is_empty()
    }
}

impl Default for ExecutorManager {
    fn default() -> Self {
        Self::new()
    }
}
