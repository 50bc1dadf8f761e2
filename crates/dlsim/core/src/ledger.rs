//! Allocation ledger.
//!
//! The ledger owns per-resource capacity and availability plus the
//! allocation and pending-request matrices. All bookkeeping happens under a
//! single mutex; a blocked requester waits on the resource's [`Notify`]
//! without holding that mutex, then re-checks and commits under it.
//!
//! Waiters on the same resource are woken together and race for the next
//! free instance. There is no FIFO guarantee among them.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dlsim_types::{
    DeadlockReport, LedgerSnapshot, ProcessId, ResourceCounts, ResourceDef, ResourceId,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::error::{SimError, SimResult};
use crate::events::EventBus;
use crate::safety;
use crate::signal::StopSignal;

type Matrix = BTreeMap<ProcessId, BTreeMap<ResourceId, u32>>;

/// Capacity bookkeeping for one resource type.
#[derive(Debug)]
struct Slot {
    def: ResourceDef,
    total: u32,
    available: u32,
    wakeup: Arc<Notify>,
}

#[derive(Debug, Default)]
struct LedgerState {
    version: u64,
    slots: BTreeMap<ResourceId, Slot>,
    allocation: Matrix,
    request: Matrix,
}

impl LedgerState {
    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            version: self.version,
            resources: self
                .slots
                .iter()
                .map(|(id, slot)| {
                    (
                        *id,
                        ResourceCounts {
                            name: slot.def.name.clone(),
                            total: slot.total,
                            available: slot.available,
                        },
                    )
                })
                .collect(),
            allocation: self.allocation.clone(),
            request: self.request.clone(),
        }
    }
}

fn cell(matrix: &Matrix, process: ProcessId, resource: ResourceId) -> u32 {
    matrix
        .get(&process)
        .and_then(|row| row.get(&resource))
        .copied()
        .unwrap_or(0)
}

fn increment(matrix: &mut Matrix, process: ProcessId, resource: ResourceId) {
    *matrix.entry(process).or_default().entry(resource).or_insert(0) += 1;
}

/// Decrement a cell, dropping zero cells and empty rows. Returns `false` if
/// the cell was already zero.
fn decrement(matrix: &mut Matrix, process: ProcessId, resource: ResourceId) -> bool {
    let Some(row) = matrix.get_mut(&process) else {
        return false;
    };
    let Some(count) = row.get_mut(&resource) else {
        return false;
    };

    *count -= 1;
    if *count == 0 {
        row.remove(&resource);
        if row.is_empty() {
            matrix.remove(&process);
        }
    }
    true
}

/// What [`AllocationLedger::force_clear`] undid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearedRows {
    /// Instances returned to availability, per resource
    pub released: Vec<(ResourceId, u32)>,

    /// Resources whose pending request was dropped
    pub withdrawn: Vec<ResourceId>,
}

impl ClearedRows {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.withdrawn.is_empty()
    }
}

enum Commit {
    Granted(ResourceDef),
    Unavailable,
    Withdrawn,
}

/// Shared allocation ledger.
#[derive(Debug)]
pub struct AllocationLedger {
    state: Mutex<LedgerState>,
    events: EventBus,
}

impl AllocationLedger {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            events,
        }
    }

    fn publish(&self, state: &mut LedgerState) {
        state.version += 1;
        self.events.ledger_updated(state.snapshot());
    }

    /// Set capacity and availability for a resource to its instance count.
    ///
    /// Redefining an existing id keeps its waiters parked and does not
    /// reconcile instances already held; see [`crate::ResourceRegistry::redefine`].
    pub fn define(&self, def: ResourceDef) {
        let mut state = self.state.lock();
        let capacity = def.total_instances;

        match state.slots.entry(def.id) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.def = def;
                slot.total = capacity;
                slot.available = capacity;
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot {
                    def,
                    total: capacity,
                    available: capacity,
                    wakeup: Arc::new(Notify::new()),
                });
            }
        }

        self.publish(&mut state);
    }

    pub fn is_defined(&self, resource: ResourceId) -> bool {
        self.state.lock().slots.contains_key(&resource)
    }

    /// Record a request for one instance (validation plus bookkeeping).
    ///
    /// The returned handle owns the pending request: it must be driven to a
    /// grant with [`PendingRequest::try_acquire`] / [`PendingRequest::acquire`],
    /// and dropping it unsettled withdraws the request.
    #[instrument(skip_all, fields(process_id = %process, resource_id = %resource))]
    pub fn enqueue(
        &self,
        process: ProcessId,
        resource: ResourceId,
    ) -> SimResult<PendingRequest<'_>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(slot) = state.slots.get(&resource) else {
            drop(guard);
            self.events.warn(
                Some(process),
                format!("tried to request invalid or unknown resource {}", resource),
            );
            return Err(SimError::UnknownResource(resource));
        };
        let name = slot.def.name.clone();
        let total = slot.total;
        let wakeup = Arc::clone(&slot.wakeup);

        let held = cell(&state.allocation, process, resource);
        let awaited = cell(&state.request, process, resource);
        if held + awaited >= total {
            drop(guard);
            self.events.warn(
                Some(process),
                format!("already holds or awaits every instance of {} ({})", name, resource),
            );
            return Err(SimError::QuotaExceeded {
                process,
                resource,
                total,
            });
        }

        increment(&mut state.request, process, resource);
        self.publish(state);
        drop(guard);

        self.events.info(
            Some(process),
            format!("requested 1 instance of {} ({})", name, resource),
        );

        Ok(PendingRequest {
            ledger: self,
            process,
            resource,
            wakeup,
            settled: false,
        })
    }

    /// Request one instance and wait for it.
    pub async fn request(
        &self,
        process: ProcessId,
        resource: ResourceId,
        stop: &mut StopSignal,
    ) -> SimResult<ResourceDef> {
        self.enqueue(process, resource)?.acquire(stop).await
    }

    fn try_commit(&self, process: ProcessId, resource: ResourceId) -> Commit {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if cell(&state.request, process, resource) == 0 {
            return Commit::Withdrawn;
        }
        let Some(slot) = state.slots.get_mut(&resource) else {
            return Commit::Withdrawn;
        };
        if slot.available == 0 {
            return Commit::Unavailable;
        }

        slot.available -= 1;
        let def = slot.def.clone();
        decrement(&mut state.request, process, resource);
        increment(&mut state.allocation, process, resource);
        self.publish(state);
        drop(guard);

        self.events.info(
            Some(process),
            format!("allocated 1 instance of {} ({})", def.name, def.id),
        );
        Commit::Granted(def)
    }

    /// Undo the bookkeeping of a pending request that will not be granted.
    fn withdraw(&self, process: ProcessId, resource: ResourceId, reason: &str) {
        let mut state = self.state.lock();
        if !decrement(&mut state.request, process, resource) {
            // Already wiped by force_clear
            return;
        }
        self.publish(&mut state);
        drop(state);

        self.events.info(
            Some(process),
            format!("request for {} withdrawn ({})", resource, reason),
        );
    }

    /// Return one instance. A release of something the process does not hold
    /// is logged and ignored.
    #[instrument(skip_all, fields(process_id = %process, resource_id = %resource))]
    pub fn release(&self, process: ProcessId, resource: ResourceId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(slot) = state.slots.get_mut(&resource) else {
            drop(guard);
            self.events.warn(
                Some(process),
                format!("tried to release invalid or unknown resource {}", resource),
            );
            return false;
        };
        let name = slot.def.name.clone();

        if !decrement(&mut state.allocation, process, resource) {
            drop(guard);
            self.events.warn(
                Some(process),
                format!("tried to release {} ({}) which it does not hold", name, resource),
            );
            return false;
        }

        slot.available += 1;
        let wakeup = Arc::clone(&slot.wakeup);
        self.publish(state);
        drop(guard);

        wakeup.notify_waiters();
        self.events.info(
            Some(process),
            format!("released 1 instance of {} ({})", name, resource),
        );
        true
    }

    /// Drop every pending request of `process` and return everything it
    /// holds. Publishes a single snapshot.
    #[instrument(skip_all, fields(process_id = %process))]
    pub fn force_clear(&self, process: ProcessId) -> ClearedRows {
        let mut state = self.state.lock();

        let withdrawn: Vec<ResourceId> = state
            .request
            .remove(&process)
            .map(|row| row.into_keys().collect())
            .unwrap_or_default();

        let held = state.allocation.remove(&process).unwrap_or_default();
        let mut released = Vec::with_capacity(held.len());
        let mut wakeups = Vec::with_capacity(held.len());
        let mut messages = Vec::with_capacity(held.len());

        for (resource, count) in held {
            if let Some(slot) = state.slots.get_mut(&resource) {
                slot.available += count;
                wakeups.push(Arc::clone(&slot.wakeup));
                messages.push(format!(
                    "had {} instance(s) of {} ({}) forcibly released",
                    count, slot.def.name, resource
                ));
            }
            released.push((resource, count));
        }

        self.publish(&mut state);
        drop(state);

        for wakeup in wakeups {
            wakeup.notify_waiters();
        }
        for message in messages {
            self.events.info(Some(process), message);
        }
        debug!(
            released = released.len(),
            withdrawn = withdrawn.len(),
            "Cleared ledger rows"
        );

        ClearedRows {
            released,
            withdrawn,
        }
    }

    /// Consistent copy of the whole ledger.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.state.lock().snapshot()
    }

    /// Run the safety sweep against the current state, under the lock.
    pub fn sweep(&self) -> DeadlockReport {
        let state = self.state.lock();
        let work = state
            .slots
            .iter()
            .map(|(id, slot)| (*id, slot.available))
            .collect();
        let outcome = safety::find_deadlocked(work, &state.allocation, &state.request);

        DeadlockReport {
            deadlocked: outcome.deadlocked,
            active_processes: outcome.active,
            ledger_version: state.version,
            swept_at: Utc::now(),
        }
    }

    pub fn allocated(&self, process: ProcessId, resource: ResourceId) -> u32 {
        cell(&self.state.lock().allocation, process, resource)
    }

    pub fn requested(&self, process: ProcessId, resource: ResourceId) -> u32 {
        cell(&self.state.lock().request, process, resource)
    }

    pub fn available(&self, resource: ResourceId) -> Option<u32> {
        self.state.lock().slots.get(&resource).map(|s| s.available)
    }
}

/// Outcome of a non-blocking grant attempt.
#[derive(Debug)]
pub enum TryAcquire<'a> {
    /// Instance allocated
    Granted(ResourceDef),

    /// Nothing free yet; the request is still pending
    Waiting(PendingRequest<'a>),
}

/// A recorded, not yet granted request for one instance.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    ledger: &'a AllocationLedger,
    process: ProcessId,
    resource: ResourceId,
    wakeup: Arc<Notify>,
    settled: bool,
}

impl<'a> PendingRequest<'a> {
    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    fn cancelled(&self) -> SimError {
        SimError::Cancelled {
            process: self.process,
            resource: self.resource,
        }
    }

    /// Grant immediately if an instance is free.
    pub fn try_acquire(mut self) -> SimResult<TryAcquire<'a>> {
        match self.ledger.try_commit(self.process, self.resource) {
            Commit::Granted(def) => {
                self.settled = true;
                Ok(TryAcquire::Granted(def))
            }
            Commit::Withdrawn => {
                self.settled = true;
                Err(self.cancelled())
            }
            Commit::Unavailable => Ok(TryAcquire::Waiting(self)),
        }
    }

    /// Wait until an instance can be allocated, or until `stop` fires.
    ///
    /// On stop the pending request is withdrawn before returning
    /// [`SimError::Cancelled`]; nothing is consumed.
    pub async fn acquire(mut self, stop: &mut StopSignal) -> SimResult<ResourceDef> {
        let wakeup = Arc::clone(&self.wakeup);

        loop {
            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let notified = wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if stop.is_stopped() {
                return Err(self.withdraw_cancelled());
            }

            match self.ledger.try_commit(self.process, self.resource) {
                Commit::Granted(def) => {
                    self.settled = true;
                    return Ok(def);
                }
                Commit::Withdrawn => {
                    self.settled = true;
                    return Err(self.cancelled());
                }
                Commit::Unavailable => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = stop.stopped() => {
                    return Err(self.withdraw_cancelled());
                }
            }
        }
    }

    fn withdraw_cancelled(&mut self) -> SimError {
        self.settled = true;
        self.ledger
            .withdraw(self.process, self.resource, "interrupted");
        self.cancelled()
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger
                .withdraw(self.process, self.resource, "abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::StopHandle;
    use std::time::Duration;

    const R0: ResourceId = ResourceId::new(0);
    const R1: ResourceId = ResourceId::new(1);
    const P1: ProcessId = ProcessId::new(1);
    const P2: ProcessId = ProcessId::new(2);

    fn ledger_with(resources: &[(ResourceId, u32)]) -> AllocationLedger {
        let ledger = AllocationLedger::new(EventBus::new(64));
        for (id, count) in resources {
            ledger.define(ResourceDef::new(*id, format!("res-{}", id.get()), *count));
        }
        ledger
    }

    fn grant(ledger: &AllocationLedger, process: ProcessId, resource: ResourceId) -> ResourceDef {
        match ledger.enqueue(process, resource).unwrap().try_acquire().unwrap() {
            TryAcquire::Granted(def) => def,
            TryAcquire::Waiting(_) => panic!("expected an immediate grant"),
        }
    }

    #[test]
    fn test_define_sets_capacity() {
        let ledger = ledger_with(&[(R0, 3)]);
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.total(R0), 3);
        assert_eq!(snapshot.available(R0), 3);
        assert!(ledger.is_defined(R0));
        assert!(!ledger.is_defined(R1));
    }

    #[test]
    fn test_grant_and_release() {
        let ledger = ledger_with(&[(R0, 2)]);

        let def = grant(&ledger, P1, R0);
        assert_eq!(def.id, R0);
        assert_eq!(ledger.allocated(P1, R0), 1);
        assert_eq!(ledger.requested(P1, R0), 0);
        assert_eq!(ledger.available(R0), Some(1));
        assert!(ledger.snapshot().is_consistent());

        assert!(ledger.release(P1, R0));
        assert_eq!(ledger.allocated(P1, R0), 0);
        assert_eq!(ledger.available(R0), Some(2));
        assert!(ledger.snapshot().is_consistent());
    }

    #[test]
    fn test_unknown_resource_changes_nothing() {
        let ledger = ledger_with(&[(R0, 1)]);
        let before = ledger.snapshot();

        let err = ledger.enqueue(P1, R1).unwrap_err();
        assert_eq!(err, SimError::UnknownResource(R1));
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn test_quota_exceeded_changes_nothing() {
        let ledger = ledger_with(&[(R0, 1)]);
        grant(&ledger, P1, R0);
        let before = ledger.snapshot();

        let err = ledger.enqueue(P1, R0).unwrap_err();
        assert_eq!(
            err,
            SimError::QuotaExceeded {
                process: P1,
                resource: R0,
                total: 1
            }
        );
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn test_quota_counts_pending_requests() {
        let ledger = ledger_with(&[(R0, 2)]);
        grant(&ledger, P2, R0);
        grant(&ledger, P2, R0);

        // P1 waits for one of the two, so a second request would exceed the total
        let pending = match ledger.enqueue(P1, R0).unwrap().try_acquire().unwrap() {
            TryAcquire::Waiting(pending) => pending,
            TryAcquire::Granted(_) => panic!("nothing should be free"),
        };
        assert_eq!(ledger.requested(P1, R0), 1);

        ledger.release(P2, R0);
        let second = ledger.enqueue(P1, R0).unwrap();
        assert!(matches!(
            ledger.enqueue(P1, R0),
            Err(SimError::QuotaExceeded { .. })
        ));

        drop(second);
        drop(pending);
        assert_eq!(ledger.requested(P1, R0), 0);
    }

    #[test]
    fn test_release_without_allocation_is_noop() {
        let ledger = ledger_with(&[(R0, 1)]);
        let before = ledger.snapshot();

        assert!(!ledger.release(P1, R0));
        assert!(!ledger.release(P1, R1));
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn test_dropping_pending_request_withdraws_it() {
        let ledger = ledger_with(&[(R0, 1)]);
        grant(&ledger, P1, R0);

        let waiting = ledger.enqueue(P2, R0).unwrap().try_acquire().unwrap();
        assert!(matches!(waiting, TryAcquire::Waiting(_)));
        assert_eq!(ledger.requested(P2, R0), 1);

        drop(waiting);
        assert_eq!(ledger.requested(P2, R0), 0);
        assert_eq!(ledger.available(R0), Some(0));
        assert!(ledger.snapshot().is_consistent());
    }

    #[test]
    fn test_force_clear_returns_everything() {
        let ledger = ledger_with(&[(R0, 2), (R1, 1)]);
        grant(&ledger, P1, R0);
        grant(&ledger, P1, R0);
        grant(&ledger, P2, R1);
        let waiting = ledger.enqueue(P1, R1).unwrap().try_acquire().unwrap();

        let cleared = ledger.force_clear(P1);
        assert_eq!(cleared.released, vec![(R0, 2)]);
        assert_eq!(cleared.withdrawn, vec![R1]);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.available(R0), 2);
        assert_eq!(snapshot.available(R1), 0);
        assert!(snapshot.held_by(P1).is_empty());
        assert_eq!(snapshot.requested(P1, R1), 0);
        assert!(snapshot.is_consistent());

        // The wiped request settles as cancelled rather than allocating later
        ledger.release(P2, R1);
        match waiting {
            TryAcquire::Waiting(pending) => {
                assert!(pending.try_acquire().unwrap_err().is_cancelled());
            }
            TryAcquire::Granted(_) => panic!("R1 was held by P2"),
        }
        assert_eq!(ledger.allocated(P1, R1), 0);
        assert_eq!(ledger.available(R1), Some(1));
    }

    #[test]
    fn test_versions_increase_per_mutation() {
        let ledger = ledger_with(&[(R0, 1)]);
        let v0 = ledger.snapshot().version;

        grant(&ledger, P1, R0);
        let v1 = ledger.snapshot().version;
        // enqueue + commit
        assert_eq!(v1, v0 + 2);

        ledger.release(P1, R0);
        assert_eq!(ledger.snapshot().version, v1 + 1);
    }

    #[test]
    fn test_sweep_reports_circular_wait() {
        let ledger = ledger_with(&[(R0, 1), (R1, 1)]);
        grant(&ledger, P1, R0);
        grant(&ledger, P2, R1);
        let w1 = ledger.enqueue(P1, R1).unwrap().try_acquire().unwrap();
        let w2 = ledger.enqueue(P2, R0).unwrap().try_acquire().unwrap();

        let report = ledger.sweep();
        assert_eq!(report.deadlocked, vec![P1, P2]);
        assert_eq!(report.active_processes, 2);

        drop(w1);
        drop(w2);
        assert!(!ledger.sweep().is_deadlocked());
    }

    #[tokio::test]
    async fn test_blocked_request_granted_on_release() {
        let ledger = Arc::new(ledger_with(&[(R0, 1)]));
        grant(&ledger, P1, R0);

        let (_handle, mut stop) = StopHandle::new();
        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.request(P2, R0, &mut stop).await })
        };

        // Wait until the request is recorded
        while ledger.requested(P2, R0) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ledger.allocated(P2, R0), 0);

        ledger.release(P1, R0);
        let def = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(def.id, R0);
        assert_eq!(ledger.allocated(P2, R0), 1);
        assert_eq!(ledger.requested(P2, R0), 0);
        assert!(ledger.snapshot().is_consistent());
    }

    #[tokio::test]
    async fn test_stop_while_blocked_withdraws_request() {
        let ledger = Arc::new(ledger_with(&[(R0, 1), (R1, 2)]));
        grant(&ledger, P1, R0);
        let before_r1 = ledger.available(R1);

        let (handle, mut stop) = StopHandle::new();
        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.request(P2, R0, &mut stop).await })
        };

        while ledger.requested(P2, R0) == 0 {
            tokio::task::yield_now().await;
        }

        handle.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            result.unwrap_err(),
            SimError::Cancelled {
                process: P2,
                resource: R0
            }
        );
        assert_eq!(ledger.requested(P2, R0), 0);
        assert_eq!(ledger.allocated(P2, R0), 0);
        assert_eq!(ledger.available(R0), Some(0));
        assert_eq!(ledger.available(R1), before_r1);
        assert!(ledger.snapshot().is_consistent());
    }

    #[tokio::test]
    async fn test_aborted_waiter_withdraws_request() {
        let ledger = Arc::new(ledger_with(&[(R0, 1)]));
        grant(&ledger, P1, R0);

        let (_handle, mut stop) = StopHandle::new();
        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.request(P2, R0, &mut stop).await })
        };

        while ledger.requested(P2, R0) == 0 {
            tokio::task::yield_now().await;
        }

        waiter.abort();
        let _ = waiter.await;

        assert_eq!(ledger.requested(P2, R0), 0);
        assert!(ledger.snapshot().is_consistent());
    }

    #[tokio::test]
    async fn test_ledger_publishes_snapshots() {
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let ledger = AllocationLedger::new(events);

        ledger.define(ResourceDef::new(R0, "printer", 1));

        loop {
            if let dlsim_types::SimEvent::LedgerUpdated(snapshot) = rx.recv().await.unwrap() {
                assert_eq!(snapshot.total(R0), 1);
                break;
            }
        }
    }
}
