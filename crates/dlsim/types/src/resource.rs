//! Resource type definitions

use crate::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Static definition of a resource type.
///
/// Definitions are immutable. Registering an id twice is rejected; an
/// explicit redefinition replaces the whole definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDef {
    /// Resource id
    pub id: ResourceId,

    /// Display name
    pub name: String,

    /// Number of instances of this type
    pub total_instances: u32,
}

impl ResourceDef {
    pub fn new(id: ResourceId, name: impl Into<String>, total_instances: u32) -> Self {
        Self {
            id,
            name: name.into(),
            total_instances,
        }
    }
}

impl fmt::Display for ResourceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
