//! Outbound event bus.
//!
//! Every log line, ledger snapshot, process state change and detector report
//! is broadcast to subscribers. Log lines are mirrored into `tracing` so the
//! core stays observable without any subscriber attached.

use dlsim_types::{
    DeadlockReport, LedgerSnapshot, LogLevel, LogLine, ProcessId, ProcessState, SimEvent,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Broadcast channel for [`SimEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SimEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to simulation events.
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.tx.subscribe()
    }

    /// Emit a log line.
    pub fn log(&self, level: LogLevel, process_id: Option<ProcessId>, message: impl Into<String>) {
        let line = LogLine::new(level, process_id, message);

        match (level, process_id) {
            (LogLevel::Debug, Some(id)) => debug!(process_id = %id, "{}", line.message),
            (LogLevel::Debug, None) => debug!("{}", line.message),
            (LogLevel::Info, Some(id)) => info!(process_id = %id, "{}", line.message),
            (LogLevel::Info, None) => info!("{}", line.message),
            (LogLevel::Warn, Some(id)) => warn!(process_id = %id, "{}", line.message),
            (LogLevel::Warn, None) => warn!("{}", line.message),
        }

        // No subscribers is fine
        let _ = self.tx.send(SimEvent::Log(line));
    }

    pub fn info(&self, process_id: Option<ProcessId>, message: impl Into<String>) {
        self.log(LogLevel::Info, process_id, message);
    }

    pub fn warn(&self, process_id: Option<ProcessId>, message: impl Into<String>) {
        self.log(LogLevel::Warn, process_id, message);
    }

    /// Publish a ledger snapshot.
    pub fn ledger_updated(&self, snapshot: LedgerSnapshot) {
        let _ = self.tx.send(SimEvent::LedgerUpdated(Box::new(snapshot)));
    }

    /// Publish a process state change.
    pub fn process_state(&self, process_id: ProcessId, state: ProcessState) {
        let _ = self
            .tx
            .send(SimEvent::ProcessStateChanged { process_id, state });
    }

    /// Publish a detector report.
    pub fn deadlock_swept(&self, report: DeadlockReport) {
        let _ = self.tx.send(SimEvent::DeadlockSwept(report));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
