//! Configuration for the simulation core

use crate::error::{SimError, SimResult};
use dlsim_types::{ProcessId, ResourceId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main simulation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Id ranges and process count limits
    #[serde(default)]
    pub limits: SimulationLimits,

    /// Process actor behavior
    #[serde(default)]
    pub actor: ActorConfig,

    /// Event bus configuration
    #[serde(default)]
    pub events: EventConfig,
}

/// Bounds on ids and on the number of live processes.
///
/// The ledger itself is map based; these bounds are the documented limits
/// of the simulation's scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationLimits {
    /// Smallest accepted resource id
    #[serde(default)]
    pub min_resource_id: u32,

    /// Largest accepted resource id
    #[serde(default = "default_max_resource_id")]
    pub max_resource_id: u32,

    /// Smallest accepted process id
    #[serde(default = "default_min_process_id")]
    pub min_process_id: u32,

    /// Largest accepted process id
    #[serde(default = "default_max_process_id")]
    pub max_process_id: u32,

    /// Maximum concurrently active processes
    #[serde(default = "default_max_active_processes")]
    pub max_active_processes: usize,
}

impl Default for SimulationLimits {
    fn default() -> Self {
        Self {
            min_resource_id: 0,
            max_resource_id: default_max_resource_id(),
            min_process_id: default_min_process_id(),
            max_process_id: default_max_process_id(),
            max_active_processes: default_max_active_processes(),
        }
    }
}

impl SimulationLimits {
    /// Validate a raw resource id.
    pub fn resource_id(&self, raw: i64) -> SimResult<ResourceId> {
        check_range("resource", raw, self.min_resource_id, self.max_resource_id)
            .map(ResourceId::new)
    }

    /// Validate a raw process id.
    pub fn process_id(&self, raw: i64) -> SimResult<ProcessId> {
        check_range("process", raw, self.min_process_id, self.max_process_id).map(ProcessId::new)
    }
}

fn check_range(kind: &'static str, raw: i64, min: u32, max: u32) -> SimResult<u32> {
    if raw < i64::from(min) || raw > i64::from(max) {
        return Err(SimError::InvalidId {
            kind,
            id: raw,
            min,
            max,
        });
    }
    Ok(raw as u32)
}

/// Process actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Pause before retrying when no resource is registered, in milliseconds
    #[serde(default = "default_empty_registry_backoff_ms")]
    pub empty_registry_backoff_ms: u64,

    /// Seed for target selection; each actor derives its own stream from it.
    /// `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            empty_registry_backoff_ms: default_empty_registry_backoff_ms(),
            seed: None,
        }
    }
}

impl ActorConfig {
    pub fn empty_registry_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_registry_backoff_ms)
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Broadcast channel capacity; slow subscribers lag beyond this
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

// Default value helpers
fn default_max_resource_id() -> u32 {
    9
}

fn default_min_process_id() -> u32 {
    1
}

fn default_max_process_id() -> u32 {
    10
}

fn default_max_active_processes() -> usize {
    10
}

fn default_empty_registry_backoff_ms() -> u64 {
    5_000
}

fn default_channel_capacity() -> usize {
    1024
}
