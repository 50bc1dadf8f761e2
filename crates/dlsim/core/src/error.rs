//! Error types for dlsim-core

use dlsim_types::{ProcessId, ResourceId};
use std::time::Duration;
use thiserror::Error;

/// Errors reported at the command boundary and by the ledger.
///
/// None of these are fatal: the requested operation is simply not performed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// Id outside the configured range
    #[error("invalid {kind} id {id}: allowed range is {min}..={max}")]
    InvalidId {
        kind: &'static str,
        id: i64,
        min: u32,
        max: u32,
    },

    /// Resource or process id already in use
    #[error("{kind} id {id} is already registered")]
    DuplicateId { kind: &'static str, id: u32 },

    /// Capacity must be a positive instance count
    #[error("invalid capacity {0}: a resource needs at least one instance")]
    InvalidCapacity(i64),

    /// Resource id not registered
    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),

    /// Process would hold or await more instances than exist
    #[error("{process} already holds or awaits all {total} instance(s) of {resource}")]
    QuotaExceeded {
        process: ProcessId,
        resource: ResourceId,
        total: u32,
    },

    /// Blocking request abandoned because the process is stopping
    #[error("request of {process} for {resource} was cancelled")]
    Cancelled {
        process: ProcessId,
        resource: ResourceId,
    },

    /// No such process
    #[error("process {0} not found")]
    NotFound(ProcessId),

    /// Detector period must be strictly positive
    #[error("invalid detector period {0:?}")]
    InvalidPeriod(Duration),

    /// Too many concurrently active processes
    #[error("process limit reached: at most {limit} active processes")]
    ProcessLimitReached { limit: usize },
}

impl SimError {
    /// Whether this error is the normal cancellation unwind path.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SimError::Cancelled { .. })
    }
}

/// Result type alias for simulation operations
pub type SimResult<T> = Result<T, SimError>;
