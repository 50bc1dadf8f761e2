//! Event types pushed to the presentation boundary
//!
//! The core never renders anything itself; it publishes [`SimEvent`]s and
//! lets subscribers decide how to display them.

use crate::{LedgerSnapshot, ProcessId, ProcessState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Free-text log line, optionally tagged with the process it concerns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub process_id: Option<ProcessId>,
    pub message: String,
}

impl LogLine {
    pub fn new(level: LogLevel, process_id: Option<ProcessId>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            process_id,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.process_id {
            Some(id) => write!(f, "Process {}: {}", id.get(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Classification of a detector sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockStatus {
    /// No process holds or awaits anything
    Idle,
    /// Every active process can finish
    Clear,
    /// At least one process can never finish
    Deadlocked,
}

/// Result of one detector sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockReport {
    /// Deadlocked process ids in ascending order
    pub deadlocked: Vec<ProcessId>,

    /// Number of processes with a nonzero allocation or request row
    pub active_processes: usize,

    /// Ledger version the sweep ran against
    pub ledger_version: u64,

    /// When the sweep ran
    pub swept_at: DateTime<Utc>,
}

impl DeadlockReport {
    pub fn is_deadlocked(&self) -> bool {
        !self.deadlocked.is_empty()
    }

    pub fn status(&self) -> DeadlockStatus {
        if self.is_deadlocked() {
            DeadlockStatus::Deadlocked
        } else if self.active_processes == 0 {
            DeadlockStatus::Idle
        } else {
            DeadlockStatus::Clear
        }
    }

    /// Comma separated process ids, or `"none"`.
    pub fn summary(&self) -> String {
        if self.deadlocked.is_empty() {
            return "none".to_string();
        }
        self.deadlocked
            .iter()
            .map(|p| p.get().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Everything the core publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SimEvent {
    /// Log line for the log panel
    Log(LogLine),

    /// Ledger changed
    LedgerUpdated(Box<LedgerSnapshot>),

    /// Process moved to a new state
    ProcessStateChanged {
        process_id: ProcessId,
        state: ProcessState,
    },

    /// Detector finished a sweep
    DeadlockSwept(DeadlockReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(deadlocked: Vec<u32>, active: usize) -> DeadlockReport {
        DeadlockReport {
            deadlocked: deadlocked.into_iter().map(ProcessId::new).collect(),
            active_processes: active,
            ledger_version: 0,
            swept_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_status() {
        assert_eq!(report(vec![], 0).status(), DeadlockStatus::Idle);
        assert_eq!(report(vec![], 3).status(), DeadlockStatus::Clear);
        assert_eq!(report(vec![1, 2], 2).status(), DeadlockStatus::Deadlocked);
    }

    #[test]
    fn test_report_summary() {
        assert_eq!(report(vec![], 1).summary(), "none");
        assert_eq!(report(vec![1, 3], 3).summary(), "1, 3");
    }

    #[test]
    fn test_log_line_display() {
        let line = LogLine::new(LogLevel::Info, Some(ProcessId::new(2)), "released printer");
        assert_eq!(line.to_string(), "Process 2: released printer");

        let line = LogLine::new(LogLevel::Info, None, "detector started");
        assert_eq!(line.to_string(), "detector started");
    }

    #[test]
    fn test_event_json_shape() {
        let event = SimEvent::ProcessStateChanged {
            process_id: ProcessId::new(1),
            state: ProcessState::Idle,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "process_state_changed");
        assert_eq!(json["data"]["process_id"], 1);
        assert_eq!(json["data"]["state"]["state"], "idle");
    }
}
