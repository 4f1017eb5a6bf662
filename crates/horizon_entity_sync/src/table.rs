//! Bidirectional mapping between local and network entity ids.
//!
//! Both directions live behind one lock so an entry is always added or
//! removed from both maps together. The create and remove paths can run a
//! closure under that lock, which keeps the entity store and the table in
//! step: no other thread ever observes an entity without its mapping or a
//! mapping without its entity.

use crate::error::{SyncError, SyncResult};
use crate::ids::{LocalEntityId, NetworkEntityId};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Maps {
    network_to_local: HashMap<NetworkEntityId, LocalEntityId>,
    local_to_network: HashMap<LocalEntityId, NetworkEntityId>,
}

impl Maps {
    fn check_free(&self, network: NetworkEntityId, local: Option<LocalEntityId>) -> SyncResult<()> {
        if let Some(existing) = self.network_to_local.get(&network) {
            return Err(SyncError::DuplicateEntity {
                network,
                local: Some(*existing),
            });
        }
        if let Some(local) = local {
            if let Some(existing) = self.local_to_network.get(&local) {
                return Err(SyncError::DuplicateEntity {
                    network: *existing,
                    local: Some(local),
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, network: NetworkEntityId, local: LocalEntityId) {
        self.network_to_local.insert(network, local);
        self.local_to_network.insert(local, network);
    }
}

/// Translation table for one synchronized connection.
#[derive(Debug, Default)]
pub struct IdTranslationTable {
    maps: RwLock<Maps>,
}

impl IdTranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Binds `network` to `local`.
    ///
    /// Fails with `DuplicateEntity` if either id is already bound; the table
    /// is left unchanged in that case.
    pub fn bind(&self, network: NetworkEntityId, local: LocalEntityId) -> SyncResult<()> {
        let mut maps = self.write();
        maps.check_free(network, Some(local))?;
        maps.insert(network, local);
        Ok(())
    }

    /// Creates the local side of `network` with `create` and binds it.
    ///
    /// `create` runs under the table's write lock and only when `network` is
    /// not bound yet, so a duplicate never reaches the entity store. If the
    /// created id turns out to be bound already, `discard` receives it and
    /// the table is left unchanged.
    pub fn bind_new_with<F, D>(
        &self,
        network: NetworkEntityId,
        create: F,
        discard: D,
    ) -> SyncResult<LocalEntityId>
    where
        F: FnOnce() -> SyncResult<LocalEntityId>,
        D: FnOnce(LocalEntityId),
    {
        let mut maps = self.write();
        maps.check_free(network, None)?;
        let local = create()?;
        if let Err(e) = maps.check_free(network, Some(local)) {
            discard(local);
            return Err(e);
        }
        maps.insert(network, local);
        Ok(local)
    }

    /// Removes the mapping for `network`, returning the local id it pointed to.
    pub fn unbind_network(&self, network: NetworkEntityId) -> Option<LocalEntityId> {
        let mut maps = self.write();
        let local = maps.network_to_local.remove(&network)?;
        maps.local_to_network.remove(&local);
        Some(local)
    }

    /// Removes the mapping for `local`, returning the network id it pointed to.
    pub fn unbind_local(&self, local: LocalEntityId) -> Option<NetworkEntityId> {
        let mut maps = self.write();
        let network = maps.local_to_network.remove(&local)?;
        maps.network_to_local.remove(&network);
        Some(network)
    }

    /// Runs `remove` for the entity bound to `network`, then erases the
    /// mapping.
    ///
    /// Returns `Ok(None)` without calling `remove` when `network` is unbound.
    /// If `remove` fails the mapping is kept.
    pub fn unbind_network_with<F>(
        &self,
        network: NetworkEntityId,
        remove: F,
    ) -> SyncResult<Option<LocalEntityId>>
    where
        F: FnOnce(LocalEntityId) -> SyncResult<()>,
    {
        let mut maps = self.write();
        let Some(local) = maps.network_to_local.get(&network).copied() else {
            return Ok(None);
        };
        remove(local)?;
        maps.network_to_local.remove(&network);
        maps.local_to_network.remove(&local);
        Ok(Some(local))
    }

    pub fn local_for(&self, network: NetworkEntityId) -> Option<LocalEntityId> {
        self.read().network_to_local.get(&network).copied()
    }

    pub fn network_for(&self, local: LocalEntityId) -> Option<NetworkEntityId> {
        self.read().local_to_network.get(&local).copied()
    }

    pub fn contains_network(&self, network: NetworkEntityId) -> bool {
        self.read().network_to_local.contains_key(&network)
    }

    pub fn contains_local(&self, local: LocalEntityId) -> bool {
        self.read().local_to_network.contains_key(&local)
    }

    pub fn len(&self) -> usize {
        self.read().network_to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().network_to_local.is_empty()
    }

    /// All mappings, ordered by network id.
    pub fn entries(&self) -> Vec<(NetworkEntityId, LocalEntityId)> {
        let mut entries: Vec<_> = self
            .read()
            .network_to_local
            .iter()
            .map(|(network, local)| (*network, *local))
            .collect();
        entries.sort();
        entries
    }

    /// Empties the table, returning what it held.
    pub fn drain(&self) -> Vec<(NetworkEntityId, LocalEntityId)> {
        let mut maps = self.write();
        maps.local_to_network.clear();
        let mut entries: Vec<_> = maps.network_to_local.drain().collect();
        entries.sort();
        entries
    }

    /// Whether both directions describe the same one-to-one mapping.
    pub fn is_bijective(&self) -> bool {
        let maps = self.read();
        maps.network_to_local.len() == maps.local_to_network.len()
            && maps
                .network_to_local
                .iter()
                .all(|(network, local)| maps.local_to_network.get(local) == Some(network))
    }
}
