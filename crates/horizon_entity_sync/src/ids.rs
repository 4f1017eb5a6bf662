//! Entity identifier newtypes.
//!
//! Each side of a synchronized connection assigns its own [`LocalEntityId`]s;
//! the two sides agree only on the [`NetworkEntityId`] chosen by the peer that
//! owns the entity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an entity in this process's entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalEntityId(pub u64);

/// Identifier shared by both peers for a synchronized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkEntityId(pub u64);

impl fmt::Display for LocalEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.0)
    }
}

impl fmt::Display for NetworkEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

impl From<u64> for LocalEntityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<u64> for NetworkEntityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
