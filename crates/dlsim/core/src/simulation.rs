//! Simulation facade.
//!
//! The command boundary used by a presentation layer. Every command is
//! validated here again, whatever the caller already checked.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dlsim_types::{
    AcquisitionMode, DeadlockReport, LedgerSnapshot, ProcessId, ProcessSpec, ProcessState,
    ProcessStatus, ResourceDef, SimEvent,
};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::actor::{ProcessActor, StatusCell};
use crate::config::SimulationConfig;
use crate::detector::{DeadlockDetector, DetectorHandle};
use crate::error::{SimError, SimResult};
use crate::events::EventBus;
use crate::ledger::{AllocationLedger, ClearedRows};
use crate::registry::ResourceRegistry;
use crate::signal::StopHandle;

/// A running process actor
struct ProcessEntry {
    spec: ProcessSpec,
    status: StatusCell,
    stop: StopHandle,
    join: JoinHandle<()>,
}

/// Owns the registry, the ledger, every process actor and the detector.
///
/// Dropping the simulation without [`Simulation::shutdown`] drops every stop
/// handle, which the background tasks treat as a stop.
pub struct Simulation {
    config: SimulationConfig,
    events: EventBus,
    ledger: Arc<AllocationLedger>,
    registry: Arc<ResourceRegistry>,
    processes: DashMap<ProcessId, ProcessEntry>,
    /// Serializes process admission so the active limit holds. Also holds the
    /// ids whose actors are still unwinding; they stay reserved until their
    /// ledger rows are cleared.
    admission: Mutex<HashSet<ProcessId>>,
    detector: AsyncMutex<Option<DetectorHandle>>,
}

impl Simulation {
    /// Create an empty simulation.
    pub fn new(config: SimulationConfig) -> Self {
        let events = EventBus::new(config.events.channel_capacity);
        let ledger = Arc::new(AllocationLedger::new(events.clone()));
        let registry = Arc::new(ResourceRegistry::new(
            config.limits.clone(),
            Arc::clone(&ledger),
            events.clone(),
        ));

        Self {
            config,
            events,
            ledger,
            registry,
            processes: DashMap::new(),
            admission: Mutex::new(HashSet::new()),
            detector: AsyncMutex::new(None),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.ledger
    }

    /// Subscribe to log lines, snapshots, state changes and reports.
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.events.subscribe()
    }

    fn rejected(&self, command: &str, err: SimError) -> SimError {
        self.events.warn(None, format!("{} rejected: {}", command, err));
        err
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Register a new resource type.
    pub fn add_resource(
        &self,
        id: i64,
        name: impl Into<String>,
        capacity: i64,
    ) -> SimResult<ResourceDef> {
        self.registry
            .register(id, name, capacity)
            .map_err(|err| self.rejected("add resource", err))
    }

    /// Overwrite an existing resource definition. See
    /// [`ResourceRegistry::redefine`] for what is not reconciled.
    pub fn redefine_resource(
        &self,
        id: i64,
        name: impl Into<String>,
        capacity: i64,
    ) -> SimResult<ResourceDef> {
        self.registry
            .redefine(id, name, capacity)
            .map_err(|err| self.rejected("redefine resource", err))
    }

    pub fn list_resources(&self) -> Vec<ResourceDef> {
        self.registry.list_active()
    }

    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------

    /// Create and start a process actor. Must be called from within a tokio
    /// runtime.
    #[instrument(skip(self))]
    pub fn create_process(
        &self,
        id: i64,
        request_interval: Duration,
        usage_interval: Duration,
        mode: AcquisitionMode,
    ) -> SimResult<ProcessSpec> {
        self.admit(id, request_interval, usage_interval, mode)
            .map_err(|err| self.rejected("create process", err))
    }

    fn admit(
        &self,
        id: i64,
        request_interval: Duration,
        usage_interval: Duration,
        mode: AcquisitionMode,
    ) -> SimResult<ProcessSpec> {
        let id = self.config.limits.process_id(id)?;
        for interval in [request_interval, usage_interval] {
            if interval.is_zero() {
                return Err(SimError::InvalidPeriod(interval));
            }
        }

        let stopping = self.admission.lock();
        if self.processes.contains_key(&id) || stopping.contains(&id) {
            return Err(SimError::DuplicateId {
                kind: "process",
                id: id.get(),
            });
        }
        let limit = self.config.limits.max_active_processes;
        if self.processes.len() + stopping.len() >= limit {
            return Err(SimError::ProcessLimitReached { limit });
        }

        let spec = ProcessSpec::new(id, request_interval, usage_interval).with_mode(mode);
        let actor = ProcessActor::new(
            spec.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
            self.events.clone(),
            &self.config.actor,
        );
        let status = actor.status();
        let (stop, signal) = StopHandle::new();
        let join = actor.spawn(signal);

        self.processes.insert(
            id,
            ProcessEntry {
                spec: spec.clone(),
                status,
                stop,
                join,
            },
        );

        info!(process_id = %id, ?mode, "Process created");
        Ok(spec)
    }

    /// Stop a process, wait for it to unwind, then clear whatever it left in
    /// the ledger.
    #[instrument(skip(self), fields(process_id = %id))]
    pub async fn stop_process(&self, id: ProcessId) -> SimResult<ClearedRows> {
        let entry = {
            let mut stopping = self.admission.lock();
            let Some((_, entry)) = self.processes.remove(&id) else {
                drop(stopping);
                return Err(self.rejected("stop process", SimError::NotFound(id)));
            };
            stopping.insert(id);
            entry
        };

        entry.stop.stop();
        if let Err(err) = entry.join.await {
            error!(error = %err, "Process actor terminated abnormally");
            self.events
                .warn(Some(id), format!("terminated abnormally: {}", err));
        }

        let cleared = self.ledger.force_clear(id);
        {
            let mut status = entry.status.write();
            status.state = ProcessState::Stopped;
            status.holding.clear();
        }
        self.admission.lock().remove(&id);

        self.events.info(Some(id), "stopped");
        Ok(cleared)
    }

    pub fn process_status(&self, id: ProcessId) -> Option<ProcessStatus> {
        self.processes
            .get(&id)
            .map(|entry| entry.status.read().clone())
    }

    pub fn process_spec(&self, id: ProcessId) -> Option<ProcessSpec> {
        self.processes.get(&id).map(|entry| entry.spec.clone())
    }

    /// Status of every live process, in id order.
    pub fn list_processes(&self) -> Vec<ProcessStatus> {
        let mut statuses: Vec<ProcessStatus> = self
            .processes
            .iter()
            .map(|entry| entry.status.read().clone())
            .collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    // ------------------------------------------------------------------
    // Detector
    // ------------------------------------------------------------------

    /// Start the deadlock detector, replacing any running one.
    #[instrument(skip(self))]
    pub async fn start_detector(&self, period: Duration) -> SimResult<()> {
        let detector =
            DeadlockDetector::new(Arc::clone(&self.ledger), self.events.clone(), period)
                .map_err(|err| self.rejected("start detector", err))?;

        let mut slot = self.detector.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        *slot = Some(detector.spawn());
        drop(slot);

        self.events
            .info(None, format!("deadlock detector running every {:?}", period));
        Ok(())
    }

    /// Stop the detector. Returns `false` if none was running.
    pub async fn stop_detector(&self) -> bool {
        let handle = self.detector.lock().await.take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                self.events.info(None, "deadlock detector stopped");
                true
            }
            None => false,
        }
    }

    /// Period of the running detector, if any.
    pub async fn detector_period(&self) -> Option<Duration> {
        self.detector.lock().await.as_ref().map(|h| h.period())
    }

    /// Run a sweep right now, independent of the detector timer.
    pub fn sweep(&self) -> DeadlockReport {
        self.ledger.sweep()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Stop the detector and every process.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.stop_detector().await;

        let ids: Vec<ProcessId> = self.processes.iter().map(|entry| *entry.key()).collect();
        let count = ids.len();
        join_all(ids.into_iter().map(|id| self.stop_process(id))).await;

        info!(processes = count, "Simulation shut down");
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationLimits;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_process_validation() {
        let sim = Simulation::default();

        assert!(matches!(
            sim.create_process(0, secs(1), secs(1), AcquisitionMode::Sequential),
            Err(SimError::InvalidId { .. })
        ));
        assert!(matches!(
            sim.create_process(11, secs(1), secs(1), AcquisitionMode::Sequential),
            Err(SimError::InvalidId { .. })
        ));
        assert_eq!(
            sim.create_process(1, Duration::ZERO, secs(1), AcquisitionMode::Sequential),
            Err(SimError::InvalidPeriod(Duration::ZERO))
        );

        sim.create_process(1, secs(1), secs(1), AcquisitionMode::Sequential)
            .unwrap();
        assert_eq!(
            sim.create_process(1, secs(2), secs(2), AcquisitionMode::Sequential),
            Err(SimError::DuplicateId {
                kind: "process",
                id: 1
            })
        );
        assert_eq!(sim.process_count(), 1);

        sim.shutdown().await;
        assert_eq!(sim.process_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_limit() {
        let sim = Simulation::new(SimulationConfig {
            limits: SimulationLimits {
                max_active_processes: 2,
                ..SimulationLimits::default()
            },
            ..SimulationConfig::default()
        });

        sim.create_process(1, secs(1), secs(1), AcquisitionMode::Sequential)
            .unwrap();
        sim.create_process(2, secs(1), secs(1), AcquisitionMode::Sequential)
            .unwrap();
        assert_eq!(
            sim.create_process(3, secs(1), secs(1), AcquisitionMode::Sequential),
            Err(SimError::ProcessLimitReached { limit: 2 })
        );

        // A stopped process frees its slot
        sim.stop_process(ProcessId::new(1)).await.unwrap();
        sim.create_process(3, secs(1), secs(1), AcquisitionMode::Sequential)
            .unwrap();

        sim.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unknown_process() {
        let sim = Simulation::default();
        assert_eq!(
            sim.stop_process(ProcessId::new(4)).await,
            Err(SimError::NotFound(ProcessId::new(4)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_process_clears_ledger() {
        let sim = Simulation::default();
        let r = sim.add_resource(0, "printer", 1).unwrap().id;
        let p = ProcessId::new(1);

        sim.create_process(1, secs(1), secs(30), AcquisitionMode::Sequential)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sim.snapshot().allocated(p, r), 1);
        assert_eq!(
            sim.process_status(p).unwrap().state,
            ProcessState::Holding
        );

        sim.stop_process(p).await.unwrap();
        let snapshot = sim.snapshot();
        assert_eq!(snapshot.allocated(p, r), 0);
        assert_eq!(snapshot.available(r), 1);
        assert!(snapshot.is_consistent());
        assert!(sim.process_status(p).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_id_stays_reserved_while_stopping() {
        let sim = Simulation::default();
        let r = sim.add_resource(0, "printer", 1).unwrap().id;
        let p = ProcessId::new(1);

        sim.create_process(1, secs(1), secs(30), AcquisitionMode::Sequential)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sim.snapshot().allocated(p, r), 1);

        // The actor has not run since the stop, so its rows are still live.
        let mut stopping = Box::pin(sim.stop_process(p));
        assert!(futures::poll!(stopping.as_mut()).is_pending());
        assert_eq!(
            sim.create_process(1, secs(1), secs(1), AcquisitionMode::Sequential),
            Err(SimError::DuplicateId {
                kind: "process",
                id: 1
            })
        );

        stopping.await.unwrap();
        assert_eq!(sim.snapshot().allocated(p, r), 0);
        assert_eq!(sim.snapshot().available(r), 1);

        sim.create_process(1, secs(1), secs(1), AcquisitionMode::Sequential)
            .unwrap();
        assert_eq!(sim.process_count(), 1);
        sim.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_restart_and_idempotent_stop() {
        let sim = Simulation::default();

        assert_eq!(
            sim.start_detector(Duration::ZERO).await,
            Err(SimError::InvalidPeriod(Duration::ZERO))
        );
        assert!(!sim.stop_detector().await);

        sim.start_detector(secs(5)).await.unwrap();
        sim.start_detector(secs(2)).await.unwrap();
        assert_eq!(sim.detector_period().await, Some(secs(2)));

        assert!(sim.stop_detector().await);
        assert!(!sim.stop_detector().await);
        assert_eq!(sim.detector_period().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_processes_sorted() {
        let sim = Simulation::default();
        for id in [7, 2, 5] {
            sim.create_process(id, secs(1), secs(1), AcquisitionMode::Sequential)
                .unwrap();
        }

        let ids: Vec<u32> = sim.list_processes().iter().map(|s| s.id.get()).collect();
        assert_eq!(ids, vec![2, 5, 7]);
        sim.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_command_is_logged() {
        let sim = Simulation::default();
        let mut rx = sim.subscribe();

        assert!(sim.add_resource(1, "printer", 0).is_err());
        match rx.recv().await.unwrap() {
            SimEvent::Log(line) => {
                assert!(line.message.starts_with("add resource rejected"));
                assert!(line.process_id.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
