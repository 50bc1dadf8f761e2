//! Banker's-style safety sweep.
//!
//! Given what every process holds and what it is currently waiting for,
//! repeatedly let any process whose outstanding request fits in the working
//! pool "finish" and return its allocation to the pool. Processes that never
//! finish are deadlocked.

use dlsim_types::{LedgerSnapshot, ProcessId, ResourceId};
use std::collections::{BTreeMap, BTreeSet};

/// Result of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyOutcome {
    /// Processes that can never finish, ascending
    pub deadlocked: Vec<ProcessId>,

    /// Processes with a nonzero allocation or request row
    pub active: usize,
}

/// Run the sweep over raw ledger data.
///
/// `work` starts as the available vector and is consumed.
pub fn find_deadlocked(
    mut work: BTreeMap<ResourceId, u32>,
    allocation: &BTreeMap<ProcessId, BTreeMap<ResourceId, u32>>,
    request: &BTreeMap<ProcessId, BTreeMap<ResourceId, u32>>,
) -> SafetyOutcome {
    let active: BTreeSet<ProcessId> = allocation
        .iter()
        .chain(request.iter())
        .filter(|(_, row)| row.values().any(|&n| n > 0))
        .map(|(p, _)| *p)
        .collect();

    let mut finished: BTreeSet<ProcessId> = BTreeSet::new();
    let mut changed = true;

    while changed {
        changed = false;
        for process in &active {
            if finished.contains(process) {
                continue;
            }

            let satisfiable = request.get(process).map_or(true, |row| {
                row.iter()
                    .all(|(r, &needed)| needed <= work.get(r).copied().unwrap_or(0))
            });

            if satisfiable {
                if let Some(held) = allocation.get(process) {
                    for (r, &count) in held {
                        *work.entry(*r).or_insert(0) += count;
                    }
                }
                finished.insert(*process);
                changed = true;
            }
        }
    }

    SafetyOutcome {
        deadlocked: active.difference(&finished).copied().collect(),
        active: active.len(),
    }
}

/// Run the sweep over a snapshot.
pub fn analyze(snapshot: &LedgerSnapshot) -> SafetyOutcome {
    let work = snapshot
        .resources
        .iter()
        .map(|(id, counts)| (*id, counts.available))
        .collect();
    find_deadlocked(work, &snapshot.allocation, &snapshot.request)
}
