//! # Horizon Entity Sync
//!
//! Keeps two entity stores in lifecycle agreement over a `horizon_rpc`
//! connection. The owning side pushes `create_entity`, `update_entity`,
//! `sync_component` and `remove_entity` calls through an
//! [`EntitySyncClient`]; the mirroring side answers them with an
//! [`EntitySyncServer`] installed on its dispatcher.
//!
//! Both sides pick their own [`LocalEntityId`]s. The owner assigns the
//! [`NetworkEntityId`] and each side keeps an [`IdTranslationTable`] between
//! the two. On the server the table is per connection.
//!
//! Updates and removals for a network id the server does not know are
//! acknowledged as no-ops. A second `create_entity` for a bound network id
//! is rejected with a `duplicate_entity` handler error instead of replacing
//! the existing mapping.

pub mod client;
pub mod config;
pub mod error;
pub mod ids;
pub mod protocol;
pub mod server;
pub mod store;
pub mod table;

pub use client::{acknowledge, EntitySyncClient};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use ids::{LocalEntityId, NetworkEntityId};
pub use protocol::{SyncAck, SyncEvent, SyncNotice, SyncObserver};
pub use server::EntitySyncServer;
pub use store::{Components, EntityRecord, EntityStore, InMemoryEntityStore};
pub use table::IdTranslationTable;
