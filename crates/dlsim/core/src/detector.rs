//! Periodic deadlock detector.

use std::sync::Arc;
use std::time::Duration;

use dlsim_types::DeadlockReport;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::{SimError, SimResult};
use crate::events::EventBus;
use crate::ledger::AllocationLedger;
use crate::signal::{StopHandle, StopSignal};

/// Recurring safety sweep over the ledger.
#[derive(Debug)]
pub struct DeadlockDetector {
    ledger: Arc<AllocationLedger>,
    events: EventBus,
    period: Duration,
}

impl DeadlockDetector {
    /// Create a detector. A zero period is rejected.
    pub fn new(ledger: Arc<AllocationLedger>, events: EventBus, period: Duration) -> SimResult<Self> {
        if period.is_zero() {
            return Err(SimError::InvalidPeriod(period));
        }
        Ok(Self {
            ledger,
            events,
            period,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one sweep and publish its report.
    pub fn sweep_once(&self) -> DeadlockReport {
        let report = self.ledger.sweep();

        if report.is_deadlocked() {
            self.events.warn(
                None,
                format!(
                    "DEADLOCK DETECTED! processes involved: {}",
                    report.summary()
                ),
            );
        } else {
            debug!(
                active = report.active_processes,
                version = report.ledger_version,
                "No deadlock"
            );
        }

        self.events.deadlock_swept(report.clone());
        report
    }

    /// Start sweeping on a background task. The first sweep runs one period
    /// after the call.
    pub fn spawn(self) -> DetectorHandle {
        let (stop, signal) = StopHandle::new();
        let period = self.period;
        let join = tokio::spawn(self.run(signal));

        info!(period_ms = period.as_millis() as u64, "Deadlock detector started");
        DetectorHandle { stop, join, period }
    }

    async fn run(self, mut stop: StopSignal) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = ticker.tick() => {
                    // Synchronous, so a stop can never land mid-sweep
                    self.sweep_once();
                }
            }
        }
    }
}

/// Running detector task.
#[derive(Debug)]
pub struct DetectorHandle {
    stop: StopHandle,
    join: JoinHandle<()>,
    period: Duration,
}

impl DetectorHandle {
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop the detector and wait for its task. No sweep runs after this
    /// returns.
    pub async fn stop(self) {
        self.stop.stop();
        if let Err(err) = self.join.await {
            error!(error = %err, "Deadlock detector task failed");
        }
        info!("Deadlock detector stopped");
    }
}
