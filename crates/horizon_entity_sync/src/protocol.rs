//! Reserved method names and payload shapes of the entity sync protocol.
//!
//! | method           | params                               |
//! |------------------|--------------------------------------|
//! | `create_entity`  | `networkEntityId`                    |
//! | `update_entity`  | `networkEntityId`, `componentData`   |
//! | `remove_entity`  | `networkEntityId`                    |
//! | `sync_component` | `networkEntityId`, `componentData`   |
//!
//! Every successful response carries `status: "success"`, `applied` (false
//! when the network id resolved to nothing) and, when an entity was
//! resolved, its `localEntityId` on the responding side.

use crate::error::{SyncError, SyncResult};
use crate::ids::{LocalEntityId, NetworkEntityId};
use crate::store::Components;
use horizon_rpc::{ConnectionId, Message, Params};
use serde_json::Value;

pub const CREATE_ENTITY: &str = "create_entity";
pub const UPDATE_ENTITY: &str = "update_entity";
pub const REMOVE_ENTITY: &str = "remove_entity";
pub const SYNC_COMPONENT: &str = "sync_component";

/// All methods handled by the sync layer.
pub const RESERVED_METHODS: [&str; 4] = [CREATE_ENTITY, UPDATE_ENTITY, REMOVE_ENTITY, SYNC_COMPONENT];

pub const NETWORK_ENTITY_ID: &str = "networkEntityId";
pub const COMPONENT_DATA: &str = "componentData";
pub const STATUS: &str = "status";
pub const LOCAL_ENTITY_ID: &str = "localEntityId";
pub const APPLIED: &str = "applied";

pub const STATUS_SUCCESS: &str = "success";

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Create {
        network_id: NetworkEntityId,
    },
    Update {
        network_id: NetworkEntityId,
        components: Components,
    },
    Remove {
        network_id: NetworkEntityId,
    },
    /// Same effect as `Update`; the payload is a single component by
    /// convention of the sending side.
    SyncComponent {
        network_id: NetworkEntityId,
        components: Components,
    },
}

impl SyncEvent {
    pub fn network_id(&self) -> NetworkEntityId {
        match self {
            SyncEvent::Create { network_id }
            | SyncEvent::Update { network_id, .. }
            | SyncEvent::Remove { network_id }
            | SyncEvent::SyncComponent { network_id, .. } => *network_id,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            SyncEvent::Create { .. } => CREATE_ENTITY,
            SyncEvent::Update { .. } => UPDATE_ENTITY,
            SyncEvent::Remove { .. } => REMOVE_ENTITY,
            SyncEvent::SyncComponent { .. } => SYNC_COMPONENT,
        }
    }

    pub fn components(&self) -> Option<&Components> {
        match self {
            SyncEvent::Update { components, .. } | SyncEvent::SyncComponent { components, .. } => {
                Some(components)
            }
            SyncEvent::Create { .. } | SyncEvent::Remove { .. } => None,
        }
    }

    /// Decodes a request carrying one of the reserved methods.
    pub fn from_message(message: &Message) -> SyncResult<Self> {
        let network_id = network_id_param(message)?;
        match message.method() {
            CREATE_ENTITY => Ok(SyncEvent::Create { network_id }),
            REMOVE_ENTITY => Ok(SyncEvent::Remove { network_id }),
            UPDATE_ENTITY => Ok(SyncEvent::Update {
                network_id,
                components: component_data_param(message)?,
            }),
            SYNC_COMPONENT => Ok(SyncEvent::SyncComponent {
                network_id,
                components: component_data_param(message)?,
            }),
            other => Err(SyncError::InvalidParams(format!(
                "'{other}' is not an entity sync method"
            ))),
        }
    }

    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        params.insert(NETWORK_ENTITY_ID.to_string(), Value::from(self.network_id().0));
        if let Some(components) = self.components() {
            params.insert(COMPONENT_DATA.to_string(), Value::Object(components.clone()));
        }
        params
    }

    pub fn to_message(&self, correlation_id: impl Into<String>) -> Message {
        Message::request(self.method(), self.to_params(), correlation_id)
    }
}

fn network_id_param(message: &Message) -> SyncResult<NetworkEntityId> {
    message
        .param(NETWORK_ENTITY_ID)
        .and_then(Value::as_u64)
        .map(NetworkEntityId)
        .ok_or_else(|| {
            SyncError::InvalidParams(format!(
                "'{}' requires a non-negative integer '{}'",
                message.method(),
                NETWORK_ENTITY_ID
            ))
        })
}

fn component_data_param(message: &Message) -> SyncResult<Components> {
    match message.param(COMPONENT_DATA) {
        Some(Value::Object(components)) => Ok(components.clone()),
        _ => Err(SyncError::InvalidParams(format!(
            "'{}' requires an object '{}'",
            message.method(),
            COMPONENT_DATA
        ))),
    }
}

/// Successful outcome of a sync call, as reported by the responding peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncAck {
    /// The entity on the responding side, if the network id resolved.
    pub local_entity: Option<LocalEntityId>,
    /// False when the event was a tolerated no-op.
    pub applied: bool,
}

impl SyncAck {
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        params.insert(STATUS.to_string(), Value::from(STATUS_SUCCESS));
        if let Some(local) = self.local_entity {
            params.insert(LOCAL_ENTITY_ID.to_string(), Value::from(local.0));
        }
        params.insert(APPLIED.to_string(), Value::Bool(self.applied));
        params
    }

    /// Interprets a response to a sync call.
    ///
    /// Error responses become [`SyncError::Rejected`].
    pub fn from_response(response: &Message) -> SyncResult<Self> {
        if let Some(kind) = response.error_kind() {
            return Err(SyncError::Rejected {
                kind,
                reason: response.error_reason().map(str::to_string),
                detail: response.error_detail().unwrap_or_default().to_string(),
            });
        }

        match response.param(STATUS).and_then(Value::as_str) {
            Some(STATUS_SUCCESS) => {}
            other => {
                return Err(SyncError::InvalidParams(format!(
                    "unexpected sync status {other:?}"
                )))
            }
        }

        Ok(Self {
            local_entity: response
                .param(LOCAL_ENTITY_ID)
                .and_then(Value::as_u64)
                .map(LocalEntityId),
            applied: response
                .param(APPLIED)
                .and_then(Value::as_bool)
                .unwrap_or(true),
        })
    }
}

/// What an observer sees for every inbound lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncNotice {
    pub connection: ConnectionId,
    pub event: SyncEvent,
    /// The entity the event resolved to, `None` for tolerated no-ops.
    pub local_entity: Option<LocalEntityId>,
}

/// Passive consumer of inbound lifecycle events (renderers, loggers, mirrors).
pub trait SyncObserver: Send + Sync {
    fn on_sync(&self, notice: &SyncNotice);
}

impl<F> SyncObserver for F
where
    F: Fn(&SyncNotice) + Send + Sync,
{
    fn on_sync(&self, notice: &SyncNotice) {
        self(notice)
    }
}
