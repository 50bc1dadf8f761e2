//! Resource registry.
//!
//! Holds the static definition of every resource type and initializes the
//! ledger's capacity when a definition is added. Definitions change rarely,
//! so the registry uses its own read/write lock instead of the ledger mutex.

use std::collections::BTreeMap;
use std::sync::Arc;

use dlsim_types::{ResourceDef, ResourceId};
use parking_lot::RwLock;
use tracing::instrument;

use crate::config::SimulationLimits;
use crate::error::{SimError, SimResult};
use crate::events::EventBus;
use crate::ledger::AllocationLedger;

/// Registry of resource definitions.
#[derive(Debug)]
pub struct ResourceRegistry {
    limits: SimulationLimits,
    definitions: RwLock<BTreeMap<ResourceId, ResourceDef>>,
    ledger: Arc<AllocationLedger>,
    events: EventBus,
}

impl ResourceRegistry {
    pub fn new(limits: SimulationLimits, ledger: Arc<AllocationLedger>, events: EventBus) -> Self {
        Self {
            limits,
            definitions: RwLock::new(BTreeMap::new()),
            ledger,
            events,
        }
    }

    fn validate(&self, id: i64, name: String, capacity: i64) -> SimResult<ResourceDef> {
        let id = self.limits.resource_id(id)?;
        if capacity <= 0 || capacity > i64::from(u32::MAX) {
            return Err(SimError::InvalidCapacity(capacity));
        }

        let name = match name.trim() {
            "" => id.to_string(),
            trimmed => trimmed.to_string(),
        };

        Ok(ResourceDef::new(id, name, capacity as u32))
    }

    /// Register a new resource type and size its ledger entry.
    #[instrument(skip(self, name))]
    pub fn register(&self, id: i64, name: impl Into<String>, capacity: i64) -> SimResult<ResourceDef> {
        let def = self.validate(id, name.into(), capacity)?;

        let mut definitions = self.definitions.write();
        if definitions.contains_key(&def.id) {
            return Err(SimError::DuplicateId {
                kind: "resource",
                id: def.id.get(),
            });
        }

        definitions.insert(def.id, def.clone());
        self.ledger.define(def.clone());
        drop(definitions);

        self.events.info(
            None,
            format!(
                "resource {} added with {} instance(s)",
                def, def.total_instances
            ),
        );
        Ok(def)
    }

    /// Replace the definition of an already registered resource.
    ///
    /// Capacity and availability are both reset to the new instance count.
    /// Instances already held are not reconciled and blocked requesters stay
    /// blocked, so the conservation invariant does not hold for this resource
    /// until its old holders are gone.
    #[instrument(skip(self, name))]
    pub fn redefine(&self, id: i64, name: impl Into<String>, capacity: i64) -> SimResult<ResourceDef> {
        let def = self.validate(id, name.into(), capacity)?;

        let mut definitions = self.definitions.write();
        if !definitions.contains_key(&def.id) {
            return Err(SimError::UnknownResource(def.id));
        }

        let snapshot = self.ledger.snapshot();
        let held = snapshot.allocated_total(def.id);
        let awaited: u32 = snapshot
            .request
            .values()
            .filter_map(|row| row.get(&def.id))
            .sum();

        definitions.insert(def.id, def.clone());
        self.ledger.define(def.clone());
        drop(definitions);

        if held > 0 || awaited > 0 {
            self.events.warn(
                None,
                format!(
                    "resource {} redefined with {} instance(s) while {} held and {} awaited",
                    def, def.total_instances, held, awaited
                ),
            );
        } else {
            self.events.info(
                None,
                format!("resource {} redefined with {} instance(s)", def, def.total_instances),
            );
        }
        Ok(def)
    }

    /// Currently defined resources, in id order.
    pub fn list_active(&self) -> Vec<ResourceDef> {
        self.definitions.read().values().cloned().collect()
    }

    pub fn get(&self, id: ResourceId) -> Option<ResourceDef> {
        self.definitions.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}
