//! Process actor.
//!
//! One task per simulated process. The actor picks a registered resource at
//! random, requests one instance through the ledger, holds it for the usage
//! interval and gives it back. A stop signal interrupts any sleep or block;
//! the actor then returns everything it still holds and ends in
//! [`ProcessState::Stopped`].
//!
//! In [`AcquisitionMode::Overlapping`] every grant gets its own release
//! deadline and the actor keeps requesting on its request cadence. Releases
//! only happen while the actor is not blocked, so a blocked process keeps
//! what it holds. That hold-and-wait is what lets circular waits form.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dlsim_types::{AcquisitionMode, ProcessId, ProcessSpec, ProcessState, ProcessStatus, ResourceId};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, instrument};

use crate::config::ActorConfig;
use crate::events::EventBus;
use crate::ledger::{AllocationLedger, TryAcquire};
use crate::registry::ResourceRegistry;
use crate::signal::StopSignal;

/// Shared, read-only view of an actor's status
pub type StatusCell = Arc<RwLock<ProcessStatus>>;

/// Outcome of one request attempt
enum Attempt {
    Granted(ResourceId),
    Failed,
    EmptyRegistry,
    Stopped,
}

/// A simulated process.
pub struct ProcessActor {
    spec: ProcessSpec,
    registry: Arc<ResourceRegistry>,
    ledger: Arc<AllocationLedger>,
    events: EventBus,
    status: StatusCell,
    backoff: Duration,
    rng: StdRng,
}

impl ProcessActor {
    pub fn new(
        spec: ProcessSpec,
        registry: Arc<ResourceRegistry>,
        ledger: Arc<AllocationLedger>,
        events: EventBus,
        config: &ActorConfig,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(u64::from(spec.id.get()))),
            None => StdRng::from_entropy(),
        };

        Self {
            status: Arc::new(RwLock::new(ProcessStatus::new(spec.id))),
            spec,
            registry,
            ledger,
            events,
            backoff: config.empty_registry_backoff(),
            rng,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.spec.id
    }

    /// Handle for reading the actor's status from outside its task.
    pub fn status(&self) -> StatusCell {
        Arc::clone(&self.status)
    }

    /// Run the actor on its own task.
    pub fn spawn(self, stop: StopSignal) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    /// Drive the actor until `stop` fires.
    #[instrument(skip_all, fields(process_id = %self.spec.id, mode = ?self.spec.mode))]
    pub async fn run(mut self, mut stop: StopSignal) {
        info!("Process actor started");
        self.events.info(
            Some(self.spec.id),
            format!(
                "started (request every {:?}, hold for {:?})",
                self.spec.request_interval, self.spec.usage_interval
            ),
        );

        let held = match self.spec.mode {
            AcquisitionMode::Sequential => self.run_sequential(&mut stop).await,
            AcquisitionMode::Overlapping => self.run_overlapping(&mut stop).await,
        };

        self.unwind(held);
        info!("Process actor stopped");
    }

    /// Request, hold, release, one resource at a time. Returns whatever is
    /// still held when the stop arrives.
    async fn run_sequential(&mut self, stop: &mut StopSignal) -> Vec<ResourceId> {
        loop {
            self.set_state(ProcessState::Idle);
            if !sleep_or_stop(self.spec.request_interval, stop).await {
                return Vec::new();
            }

            let resource = match self.request_one(stop).await {
                Attempt::Granted(resource) => resource,
                Attempt::Failed => continue,
                Attempt::EmptyRegistry => {
                    if !sleep_or_stop(self.backoff, stop).await {
                        return Vec::new();
                    }
                    continue;
                }
                Attempt::Stopped => return Vec::new(),
            };

            self.set_state(ProcessState::Holding);
            if !sleep_or_stop(self.spec.usage_interval, stop).await {
                return vec![resource];
            }
            self.give_back(resource);
        }
    }

    /// Keep requesting while each held instance expires on its own deadline.
    async fn run_overlapping(&mut self, stop: &mut StopSignal) -> Vec<ResourceId> {
        // Grants happen in time order and share one usage interval, so the
        // queue stays sorted by deadline.
        let mut leases: VecDeque<(Instant, ResourceId)> = VecDeque::new();
        let mut next_request = Instant::now() + self.spec.request_interval;

        loop {
            self.set_state(if leases.is_empty() {
                ProcessState::Idle
            } else {
                ProcessState::Holding
            });

            let wake_at = leases
                .front()
                .map_or(next_request, |(due, _)| (*due).min(next_request));
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = sleep_until(wake_at) => {}
            }

            let now = Instant::now();
            while let Some(&(due, resource)) = leases.front() {
                if due > now {
                    break;
                }
                leases.pop_front();
                self.give_back(resource);
            }

            if now < next_request {
                continue;
            }

            match self.request_one(stop).await {
                Attempt::Granted(resource) => {
                    leases.push_back((Instant::now() + self.spec.usage_interval, resource));
                }
                Attempt::Failed => {}
                Attempt::EmptyRegistry => {
                    next_request = Instant::now() + self.backoff;
                    continue;
                }
                Attempt::Stopped => break,
            }
            next_request = Instant::now() + self.spec.request_interval;
        }

        leases.into_iter().map(|(_, resource)| resource).collect()
    }

    /// Pick a target and request one instance, blocking if none is free.
    async fn request_one(&mut self, stop: &mut StopSignal) -> Attempt {
        let process = self.spec.id;
        let Some(resource) = self.pick_target() else {
            self.events.warn(
                Some(process),
                format!("no resources registered, retrying in {:?}", self.backoff),
            );
            return Attempt::EmptyRegistry;
        };

        self.set_state(ProcessState::RequestPending { resource });

        let ledger = Arc::clone(&self.ledger);
        let pending = match ledger.enqueue(process, resource) {
            Ok(pending) => pending,
            Err(err) => {
                // The ledger already logged the rejection
                debug!(error = %err, "Request rejected");
                return Attempt::Failed;
            }
        };

        let result = match pending.try_acquire() {
            Ok(TryAcquire::Granted(def)) => Ok(def),
            Ok(TryAcquire::Waiting(pending)) => {
                self.set_state(ProcessState::Blocked { resource });
                self.events
                    .info(Some(process), format!("blocked waiting for {}", resource));
                pending.acquire(stop).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(def) => {
                self.status.write().holding.push(def.id);
                Attempt::Granted(def.id)
            }
            Err(_) if stop.is_stopped() => Attempt::Stopped,
            Err(err) => {
                self.events.info(
                    Some(process),
                    format!("failed to allocate {}: {}", resource, err),
                );
                Attempt::Failed
            }
        }
    }

    fn pick_target(&mut self) -> Option<ResourceId> {
        let active = self.registry.list_active();
        active.choose(&mut self.rng).map(|def| def.id)
    }

    /// Return one held instance.
    fn give_back(&mut self, resource: ResourceId) {
        self.set_state(ProcessState::Releasing { resource });
        self.ledger.release(self.spec.id, resource);
        self.forget(resource);
    }

    fn forget(&self, resource: ResourceId) {
        let mut status = self.status.write();
        if let Some(index) = status.holding.iter().position(|held| *held == resource) {
            status.holding.remove(index);
        }
    }

    /// Return everything still held and enter the terminal state.
    fn unwind(&mut self, held: Vec<ResourceId>) {
        let process = self.spec.id;
        self.events.info(Some(process), "was interrupted");

        for resource in held {
            self.ledger.release(process, resource);
            self.forget(resource);
        }
        self.status.write().holding.clear();
        self.set_state(ProcessState::Stopped);
    }

    /// Record a state change; unchanged states are not republished.
    fn set_state(&self, state: ProcessState) {
        {
            let mut status = self.status.write();
            if status.state == state {
                return;
            }
            status.state = state;
        }
        self.events.process_state(self.spec.id, state);
    }
}

/// Sleep for `duration`. Returns `false` if the stop fired first.
async fn sleep_or_stop(duration: Duration, stop: &mut StopSignal) -> bool {
    tokio::select! {
        biased;
        _ = stop.stopped() => false,
        _ = sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationLimits;
    use crate::signal::StopHandle;
    use dlsim_types::SimEvent;

    struct Fixture {
        events: EventBus,
        ledger: Arc<AllocationLedger>,
        registry: Arc<ResourceRegistry>,
    }

    fn fixture() -> Fixture {
        let events = EventBus::new(4096);
        let ledger = Arc::new(AllocationLedger::new(events.clone()));
        let registry = Arc::new(ResourceRegistry::new(
            SimulationLimits::default(),
            Arc::clone(&ledger),
            events.clone(),
        ));
        Fixture {
            events,
            ledger,
            registry,
        }
    }

    fn actor(fx: &Fixture, id: u32, mode: AcquisitionMode) -> ProcessActor {
        let spec = ProcessSpec::new(
            ProcessId::new(id),
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .with_mode(mode);
        let config = ActorConfig {
            seed: Some(11),
            ..ActorConfig::default()
        };
        ProcessActor::new(
            spec,
            Arc::clone(&fx.registry),
            Arc::clone(&fx.ledger),
            fx.events.clone(),
            &config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_actor_holds_then_releases() {
        let fx = fixture();
        let r = fx.registry.register(0, "printer", 1).unwrap().id;
        let p = ProcessId::new(1);

        let actor = actor(&fx, 1, AcquisitionMode::Sequential);
        let status = actor.status();
        let (handle, stop) = StopHandle::new();
        let join = actor.spawn(stop);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(fx.ledger.allocated(p, r), 1);
        assert_eq!(status.read().state, ProcessState::Holding);
        assert_eq!(status.read().holding, vec![r]);

        // Usage interval elapsed, instance returned, waiting for next request
        sleep(Duration::from_secs(3)).await;
        assert_eq!(fx.ledger.allocated(p, r), 0);
        assert!(status.read().holding.is_empty());

        handle.stop();
        join.await.unwrap();
        assert_eq!(status.read().state, ProcessState::Stopped);
        assert!(fx.ledger.snapshot().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_holding_releases() {
        let fx = fixture();
        let r = fx.registry.register(3, "disk", 2).unwrap().id;
        let p = ProcessId::new(4);

        let actor = actor(&fx, 4, AcquisitionMode::Sequential);
        let status = actor.status();
        let (handle, stop) = StopHandle::new();
        let join = actor.spawn(stop);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(fx.ledger.allocated(p, r), 1);

        handle.stop();
        join.await.unwrap();

        assert_eq!(fx.ledger.allocated(p, r), 0);
        assert_eq!(fx.ledger.available(r), Some(2));
        assert_eq!(status.read().state, ProcessState::Stopped);
        assert!(status.read().holding.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_blocked_unwinds() {
        let fx = fixture();
        let r = fx.registry.register(0, "printer", 1).unwrap().id;
        let other = ProcessId::new(9);
        match fx.ledger.enqueue(other, r).unwrap().try_acquire().unwrap() {
            TryAcquire::Granted(_) => {}
            TryAcquire::Waiting(_) => panic!("expected a grant"),
        }

        let actor = actor(&fx, 2, AcquisitionMode::Sequential);
        let status = actor.status();
        let (handle, stop) = StopHandle::new();
        let join = actor.spawn(stop);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(status.read().state, ProcessState::Blocked { resource: r });
        assert_eq!(fx.ledger.requested(ProcessId::new(2), r), 1);

        handle.stop();
        join.await.unwrap();

        assert_eq!(fx.ledger.requested(ProcessId::new(2), r), 0);
        assert_eq!(fx.ledger.available(r), Some(0));
        assert_eq!(fx.ledger.allocated(other, r), 1);
        assert_eq!(status.read().state, ProcessState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_backs_off() {
        let fx = fixture();
        let mut rx = fx.events.subscribe();

        let actor = actor(&fx, 1, AcquisitionMode::Sequential);
        let (handle, stop) = StopHandle::new();
        let join = actor.spawn(stop);

        let warned = loop {
            match rx.recv().await.unwrap() {
                SimEvent::Log(line) if line.message.starts_with("no resources registered") => {
                    break line;
                }
                _ => {}
            }
        };
        assert_eq!(warned.process_id, Some(ProcessId::new(1)));

        handle.stop();
        join.await.unwrap();
        assert!(fx.ledger.snapshot().active_processes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_actor_accumulates_instances() {
        let fx = fixture();
        let r = fx.registry.register(0, "tape", 3).unwrap().id;
        let p = ProcessId::new(5);

        let actor = actor(&fx, 5, AcquisitionMode::Overlapping);
        let status = actor.status();
        let (handle, stop) = StopHandle::new();
        let join = actor.spawn(stop);

        // Requests at 1s and 2s, both still within the 3s usage interval
        sleep(Duration::from_millis(2500)).await;
        assert_eq!(fx.ledger.allocated(p, r), 2);
        assert_eq!(status.read().holding, vec![r, r]);
        assert!(fx.ledger.snapshot().is_consistent());

        handle.stop();
        join.await.unwrap();
        assert_eq!(fx.ledger.allocated(p, r), 0);
        assert_eq!(fx.ledger.available(r), Some(3));
    }
}
