//! Correlation registry: which live call does an inbound envelope belong to.

use std::collections::HashMap;

use parking_lot::RwLock;
use pulsar_rpc_wire::CorrelationId;

use crate::RegistryError;

const SHARD_COUNT: usize = 16;

/// Concurrent map from correlation id to the call waiting for it.
///
/// Entries are spread over independently locked shards so registration on
/// the calling side and lookup on the delivery side rarely contend, and no
/// lock is ever held across calls.
pub struct CorrelationRegistry<V> {
    shards: Box<[RwLock<HashMap<CorrelationId, V>>]>,
}

impl<V: Clone> CorrelationRegistry<V> {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, id: &CorrelationId) -> &RwLock<HashMap<CorrelationId, V>> {
        &self.shards[(id.low_bits() as usize) % SHARD_COUNT]
    }

    /// Register a call. Fails if the id is already live.
    pub fn register(&self, id: CorrelationId, value: V) -> Result<(), RegistryError> {
        let mut shard = self.shard(&id).write();
        if shard.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        shard.insert(id, value);
        Ok(())
    }

    /// Look up a call. `None` means a stray or late envelope.
    pub fn lookup(&self, id: &CorrelationId) -> Option<V> {
        self.shard(id).read().get(id).cloned()
    }

    pub fn remove(&self, id: &CorrelationId) -> Option<V> {
        self.shard(id).write().remove(id)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.shard(id).read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<(CorrelationId, V)> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.read().iter().map(|(k, v)| (*k, v.clone())));
        }
        out
    }
}

impl<V: Clone> Default for CorrelationRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}
