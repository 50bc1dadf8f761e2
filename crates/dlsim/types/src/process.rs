//! Simulated process types

use crate::{ProcessId, ResourceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How a process cycles through its resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Request, hold for the usage interval, release, then wait for the next
    /// request. At most one instance is held at a time.
    #[default]
    Sequential,

    /// Keep requesting on the request interval while every granted instance
    /// is released on its own timer. Instances accumulate, which is what
    /// makes circular waits possible.
    Overlapping,
}

/// Parameters of a simulated process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Process id
    pub id: ProcessId,

    /// Pause before each request
    pub request_interval: Duration,

    /// How long a granted instance is held
    pub usage_interval: Duration,

    /// Acquisition behavior
    #[serde(default)]
    pub mode: AcquisitionMode,
}

impl ProcessSpec {
    pub fn new(id: ProcessId, request_interval: Duration, usage_interval: Duration) -> Self {
        Self {
            id,
            request_interval,
            usage_interval,
            mode: AcquisitionMode::Sequential,
        }
    }

    pub fn with_mode(mut self, mode: AcquisitionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Lifecycle state of a process actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    /// Waiting for the next request
    Idle,

    /// Request recorded, grant not yet attempted
    RequestPending { resource: ResourceId },

    /// Waiting for an instance to become free
    Blocked { resource: ResourceId },

    /// Using at least one instance
    Holding,

    /// Returning an instance
    Releasing { resource: ResourceId },

    /// Terminal
    Stopped,
}

impl ProcessState {
    /// Resource the process is waiting on, if any.
    pub fn awaiting(&self) -> Option<ResourceId> {
        match self {
            ProcessState::RequestPending { resource } | ProcessState::Blocked { resource } => {
                Some(*resource)
            }
            _ => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, ProcessState::Blocked { .. })
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::RequestPending { resource } => write!(f, "requesting {}", resource),
            ProcessState::Blocked { resource } => write!(f, "blocked (awaiting {})", resource),
            ProcessState::Holding => write!(f, "holding"),
            ProcessState::Releasing { resource } => write!(f, "releasing {}", resource),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Read-only view of a process, for presentation polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub id: ProcessId,
    pub state: ProcessState,
    /// Resource ids currently held, one entry per instance
    pub holding: Vec<ResourceId>,
}

impl ProcessStatus {
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            state: ProcessState::Idle,
            holding: Vec::new(),
        }
    }

    pub fn awaiting(&self) -> Option<ResourceId> {
        self.state.awaiting()
    }
}
