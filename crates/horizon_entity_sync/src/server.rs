//! Inbound side of the entity sync protocol.
//!
//! [`EntitySyncServer`] registers the reserved methods on a [`Dispatcher`]
//! and mirrors the peer's entity lifecycle into an [`EntityStore`]. Each
//! connection gets its own translation table, so two peers may use the same
//! network ids without colliding.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ids::LocalEntityId;
use crate::protocol::{SyncAck, SyncEvent, SyncNotice, SyncObserver, RESERVED_METHODS};
use crate::store::EntityStore;
use crate::table::IdTranslationTable;
use dashmap::DashMap;
use horizon_rpc::{ConnectionContext, ConnectionId, Dispatcher, HandlerError, Message};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Hosts the inbound sync sessions of every connection on a dispatcher.
pub struct EntitySyncServer {
    store: Arc<dyn EntityStore>,
    config: SyncConfig,
    tables: DashMap<ConnectionId, Arc<IdTranslationTable>>,
    default_observer: RwLock<Option<Arc<dyn SyncObserver>>>,
    connection_observers: DashMap<ConnectionId, Arc<dyn SyncObserver>>,
}

impl std::fmt::Debug for EntitySyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySyncServer")
            .field("config", &self.config)
            .field("sessions", &self.tables.len())
            .finish()
    }
}

impl EntitySyncServer {
    pub fn new(store: Arc<dyn EntityStore>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            tables: DashMap::new(),
            default_observer: RwLock::new(None),
            connection_observers: DashMap::new(),
        })
    }

    /// Registers the reserved sync methods and a disconnect hook on `dispatcher`.
    pub fn install(self: &Arc<Self>, dispatcher: &Dispatcher) {
        for method in RESERVED_METHODS {
            let server = Arc::clone(self);
            dispatcher.register_handler(method, move |request, ctx| {
                server.handle(request, ctx).map_err(HandlerError::from)
            });
        }

        let server = Arc::clone(self);
        dispatcher.on_disconnect(move |ctx| {
            server.close_session(ctx.connection_id);
        });

        info!("🔄 Entity sync handlers installed: {:?}", RESERVED_METHODS);
    }

    /// Sets the observer used for connections without their own.
    pub fn set_observer<O: SyncObserver + 'static>(&self, observer: O) {
        *self
            .default_observer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(observer));
    }

    /// Sets an observer for a single connection, overriding the default one.
    pub fn set_connection_observer<O: SyncObserver + 'static>(
        &self,
        connection: ConnectionId,
        observer: O,
    ) {
        self.connection_observers.insert(connection, Arc::new(observer));
    }

    /// Handles one inbound sync request and builds its response.
    pub fn handle(&self, request: &Message, ctx: &ConnectionContext) -> SyncResult<Message> {
        let event = SyncEvent::from_message(request)?;
        let table = self.table_for(ctx.connection_id);
        let ack = self.apply(&table, &event)?;

        if !ack.applied {
            debug!(
                "'{}' for unknown {} from {} ignored",
                event.method(),
                event.network_id(),
                ctx.remote_addr
            );
        }

        self.notify(&SyncNotice {
            connection: ctx.connection_id,
            event,
            local_entity: ack.local_entity,
        });

        Ok(request.reply(ack.to_params()))
    }

    fn apply(&self, table: &IdTranslationTable, event: &SyncEvent) -> SyncResult<SyncAck> {
        match event {
            SyncEvent::Create { network_id } => {
                let local = table
                    .bind_new_with(
                        *network_id,
                        || self.store.create_entity(),
                        |orphan| {
                            if let Err(e) = self.store.remove_entity(orphan) {
                                warn!("Failed to discard unmapped {}: {}", orphan, e);
                            }
                        },
                    )
                    .inspect_err(|e| warn!("Rejected create for {}: {}", network_id, e))?;
                debug!("Created {} for {}", local, network_id);
                Ok(SyncAck {
                    local_entity: Some(local),
                    applied: true,
                })
            }
            SyncEvent::Update {
                network_id,
                components,
            }
            | SyncEvent::SyncComponent {
                network_id,
                components,
            } => match table.local_for(*network_id) {
                Some(local) => {
                    self.store.apply_components(local, components)?;
                    Ok(SyncAck {
                        local_entity: Some(local),
                        applied: true,
                    })
                }
                None => Ok(SyncAck {
                    local_entity: None,
                    applied: false,
                }),
            },
            SyncEvent::Remove { network_id } => {
                let removed = table.unbind_network_with(*network_id, |local| {
                    self.remove_from_store(local)
                })?;
                if let Some(local) = removed {
                    debug!("Removed {} for {}", local, network_id);
                }
                Ok(SyncAck {
                    local_entity: removed,
                    applied: removed.is_some(),
                })
            }
        }
    }

    /// Removes an entity, treating one that is already gone as removed.
    fn remove_from_store(&self, local: LocalEntityId) -> SyncResult<()> {
        match self.store.remove_entity(local) {
            Ok(()) => Ok(()),
            Err(SyncError::UnknownEntity(_)) => {
                debug!("{} was already gone from the store", local);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn notify(&self, notice: &SyncNotice) {
        let observer = match self.connection_observers.get(&notice.connection) {
            Some(observer) => Some(Arc::clone(observer.value())),
            None => self
                .default_observer
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        };

        if let Some(observer) = observer {
            if catch_unwind(AssertUnwindSafe(|| observer.on_sync(notice))).is_err() {
                error!(
                    "Sync observer panicked on '{}' for {}",
                    notice.event.method(),
                    notice.event.network_id()
                );
            }
        }
    }

    fn table_for(&self, connection: ConnectionId) -> Arc<IdTranslationTable> {
        Arc::clone(self.tables.entry(connection).or_default().value())
    }

    /// Ends the sync session of `connection`.
    ///
    /// With `despawn_on_disconnect` the entities the peer created are removed
    /// from the store. Returns how many mappings the session held.
    pub fn close_session(&self, connection: ConnectionId) -> usize {
        self.connection_observers.remove(&connection);
        let Some((_, table)) = self.tables.remove(&connection) else {
            return 0;
        };

        let entries = table.drain();
        if self.config.despawn_on_disconnect {
            for (network, local) in &entries {
                if let Err(e) = self.remove_from_store(*local) {
                    warn!("Failed to despawn {} ({}) for {}: {}", local, network, connection, e);
                }
            }
        }

        info!(
            "Sync session {} closed with {} entit{} ({})",
            connection,
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" },
            if self.config.despawn_on_disconnect { "despawned" } else { "kept" }
        );
        entries.len()
    }

    /// The translation table of `connection`, if it has sent any sync call.
    pub fn table(&self, connection: ConnectionId) -> Option<Arc<IdTranslationTable>> {
        self.tables.get(&connection).map(|t| Arc::clone(t.value()))
    }

    /// Connections with an open sync session.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.tables.iter().map(|e| *e.key()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.tables.len()
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }
}
