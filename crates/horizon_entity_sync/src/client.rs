//! Outbound side of the entity sync protocol.
//!
//! The host that owns the entities assigns network ids and pushes lifecycle
//! events to its peer. Pushing never waits for the peer: every helper
//! returns the [`PendingCall`], which can be awaited (see [`acknowledge`]) or
//! dropped.

use crate::error::{SyncError, SyncResult};
use crate::ids::{LocalEntityId, NetworkEntityId};
use crate::protocol::{SyncAck, SyncEvent};
use crate::store::Components;
use crate::table::IdTranslationTable;
use horizon_rpc::{Caller, PendingCall};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pushes the lifecycle of local entities to a peer.
#[derive(Debug)]
pub struct EntitySyncClient {
    caller: Arc<Caller>,
    table: IdTranslationTable,
    next_network_id: AtomicU64,
}

impl EntitySyncClient {
    pub fn new(caller: Arc<Caller>) -> Self {
        Self {
            caller,
            table: IdTranslationTable::new(),
            next_network_id: AtomicU64::new(1),
        }
    }

    /// Announces a new local entity to the peer.
    ///
    /// Assigns the entity a fresh network id and records the mapping before
    /// the request is sent. Fails with `DuplicateEntity` if the entity is
    /// already synchronized.
    pub fn sync_entity_creation(&self, local: LocalEntityId) -> SyncResult<PendingCall> {
        let network = NetworkEntityId(self.next_network_id.fetch_add(1, Ordering::Relaxed));
        self.table.bind(network, local)?;

        match self.send(SyncEvent::Create {
            network_id: network,
        }) {
            Ok(call) => {
                debug!("Announced {} as {}", local, network);
                Ok(call)
            }
            Err(e) => {
                self.table.unbind_network(network);
                Err(e)
            }
        }
    }

    /// Pushes a component payload for a synchronized entity.
    pub fn sync_entity_update(
        &self,
        local: LocalEntityId,
        components: Components,
    ) -> SyncResult<PendingCall> {
        let network = self.network_id(local).ok_or(SyncError::UnknownEntity(local))?;
        self.send(SyncEvent::Update {
            network_id: network,
            components,
        })
    }

    /// Pushes a single component of a synchronized entity.
    pub fn sync_component(
        &self,
        local: LocalEntityId,
        name: impl Into<String>,
        value: Value,
    ) -> SyncResult<PendingCall> {
        let network = self.network_id(local).ok_or(SyncError::UnknownEntity(local))?;
        let mut components = Components::new();
        components.insert(name.into(), value);
        self.send(SyncEvent::SyncComponent {
            network_id: network,
            components,
        })
    }

    /// Tells the peer a local entity is gone and forgets its network id.
    pub fn sync_entity_removal(&self, local: LocalEntityId) -> SyncResult<PendingCall> {
        let network = self
            .table
            .unbind_local(local)
            .ok_or(SyncError::UnknownEntity(local))?;
        match self.send(SyncEvent::Remove {
            network_id: network,
        }) {
            Ok(call) => {
                debug!("Retiring {} ({})", network, local);
                Ok(call)
            }
            Err(e) => {
                // Still synchronized; restore the mapping so removal can be retried.
                if let Err(bind_err) = self.table.bind(network, local) {
                    warn!("Could not restore {} for {}: {}", network, local, bind_err);
                }
                Err(e)
            }
        }
    }

    fn send(&self, event: SyncEvent) -> SyncResult<PendingCall> {
        Ok(self.caller.call(event.method(), event.to_params())?)
    }

    pub fn network_id(&self, local: LocalEntityId) -> Option<NetworkEntityId> {
        self.table.network_for(local)
    }

    pub fn table(&self) -> &IdTranslationTable {
        &self.table
    }

    pub fn caller(&self) -> &Arc<Caller> {
        &self.caller
    }
}

/// Waits for a sync call and interprets the peer's response.
pub async fn acknowledge(call: PendingCall) -> SyncResult<SyncAck> {
    let response = call.await?;
    SyncAck::from_response(&response)
}
