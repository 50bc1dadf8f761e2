//! Ledger snapshots
//!
//! A [`LedgerSnapshot`] is an owned, consistent copy of the allocation
//! ledger taken under the ledger lock. It is what the presentation boundary
//! renders and what tests inspect to check the ledger invariants.

use crate::{ProcessId, ResourceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-resource capacity and availability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    /// Display name
    pub name: String,

    /// Total instances
    pub total: u32,

    /// Instances not currently held
    pub available: u32,
}

/// One row of the allocation or request matrix
pub type MatrixRow = BTreeMap<ResourceId, u32>;

/// Consistent copy of the allocation ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Mutation counter at the time of the snapshot
    pub version: u64,

    /// Capacity and availability per resource
    pub resources: BTreeMap<ResourceId, ResourceCounts>,

    /// Instances held, per process (zero cells omitted)
    pub allocation: BTreeMap<ProcessId, MatrixRow>,

    /// Instances awaited, per process (zero cells omitted)
    pub request: BTreeMap<ProcessId, MatrixRow>,
}

impl LedgerSnapshot {
    /// Add a resource row.
    pub fn with_resource(
        mut self,
        id: ResourceId,
        name: impl Into<String>,
        total: u32,
        available: u32,
    ) -> Self {
        self.resources.insert(
            id,
            ResourceCounts {
                name: name.into(),
                total,
                available,
            },
        );
        self
    }

    /// Set an allocation cell.
    pub fn with_allocation(mut self, process: ProcessId, resource: ResourceId, count: u32) -> Self {
        set_cell(&mut self.allocation, process, resource, count);
        self
    }

    /// Set a request cell.
    pub fn with_request(mut self, process: ProcessId, resource: ResourceId, count: u32) -> Self {
        set_cell(&mut self.request, process, resource, count);
        self
    }

    pub fn total(&self, resource: ResourceId) -> u32 {
        self.resources.get(&resource).map(|r| r.total).unwrap_or(0)
    }

    pub fn available(&self, resource: ResourceId) -> u32 {
        self.resources.get(&resource).map(|r| r.available).unwrap_or(0)
    }

    /// Instances of `resource` held by `process`.
    pub fn allocated(&self, process: ProcessId, resource: ResourceId) -> u32 {
        cell(&self.allocation, process, resource)
    }

    /// Instances of `resource` awaited by `process`.
    pub fn requested(&self, process: ProcessId, resource: ResourceId) -> u32 {
        cell(&self.request, process, resource)
    }

    /// Sum of `allocation[*][resource]`.
    pub fn allocated_total(&self, resource: ResourceId) -> u32 {
        self.allocation
            .values()
            .filter_map(|row| row.get(&resource))
            .sum()
    }

    /// Resources currently held by `process`, in id order.
    pub fn held_by(&self, process: ProcessId) -> Vec<ResourceId> {
        self.allocation
            .get(&process)
            .map(|row| row.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every process with a nonzero allocation or request row.
    pub fn active_processes(&self) -> BTreeSet<ProcessId> {
        self.allocation
            .keys()
            .chain(self.request.keys())
            .copied()
            .collect()
    }

    /// `available[r] + Σ allocation[*][r] == total[r]` for every resource.
    pub fn conserves_instances(&self) -> bool {
        self.resources
            .iter()
            .all(|(id, counts)| counts.available + self.allocated_total(*id) == counts.total)
    }

    /// `allocation[p][r] + request[p][r] <= total[r]` for every pair.
    pub fn within_capacity(&self) -> bool {
        self.active_processes().into_iter().all(|p| {
            self.resources
                .iter()
                .all(|(r, counts)| self.allocated(p, *r) + self.requested(p, *r) <= counts.total)
        })
    }

    /// Both ledger invariants hold.
    pub fn is_consistent(&self) -> bool {
        self.conserves_instances() && self.within_capacity()
    }
}

fn cell(matrix: &BTreeMap<ProcessId, MatrixRow>, process: ProcessId, resource: ResourceId) -> u32 {
    matrix
        .get(&process)
        .and_then(|row| row.get(&resource))
        .copied()
        .unwrap_or(0)
}

fn set_cell(
    matrix: &mut BTreeMap<ProcessId, MatrixRow>,
    process: ProcessId,
    resource: ResourceId,
    count: u32,
) {
    if count == 0 {
        if let Some(row) = matrix.get_mut(&process) {
            row.remove(&resource);
            if row.is_empty() {
                matrix.remove(&process);
            }
        }
    } else {
        matrix.entry(process).or_default().insert(resource, count);
    }
}
