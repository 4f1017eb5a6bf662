use serde::{Deserialize, Serialize};

/// Behaviour of the inbound sync sessions hosted by an [`EntitySyncServer`](crate::EntitySyncServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remove the entities a peer created once its connection closes.
    pub despawn_on_disconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            despawn_on_disconnect: true,
        }
    }
}
