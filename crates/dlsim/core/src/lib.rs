//! # dlsim Core - Resource Allocation and Deadlock Detection
//!
//! Simulated processes compete for finite, typed resources through a shared
//! allocation ledger while a detector periodically runs a safety sweep over
//! the ledger to find processes that can never finish.
//!
//! ## Key Components
//!
//! - [`ResourceRegistry`]: Resource type definitions
//! - [`AllocationLedger`]: Availability, allocation and pending requests,
//!   with blocking acquisition
//! - [`ProcessActor`]: One task per simulated process
//! - [`DeadlockDetector`]: Recurring safety sweep
//! - [`Simulation`]: The command boundary that owns all of the above
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use dlsim_core::{Simulation, SimulationConfig};
//! use dlsim_types::{AcquisitionMode, SimEvent};
//!
//! # async fn example() -> dlsim_core::SimResult<()> {
//! let sim = Simulation::new(SimulationConfig::default());
//! let mut events = sim.subscribe();
//!
//! sim.add_resource(0, "printer", 1)?;
//! sim.add_resource(1, "scanner", 1)?;
//! sim.create_process(1, Duration::from_secs(1), Duration::from_secs(5), AcquisitionMode::Overlapping)?;
//! sim.create_process(2, Duration::from_secs(1), Duration::from_secs(5), AcquisitionMode::Overlapping)?;
//! sim.start_detector(Duration::from_secs(2)).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SimEvent::DeadlockSwept(report) = event {
//!         if report.is_deadlocked() {
//!             println!("deadlocked: {}", report.summary());
//!             break;
//!         }
//!     }
//! }
//!
//! sim.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! All ledger bookkeeping happens under one mutex. A blocked request waits
//! outside that mutex on a per-resource wake-up and retries when an instance
//! is released. Each background task observes its own stop signal at every
//! suspension point.

#![deny(unsafe_code)]

pub mod actor;
pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod ledger;
pub mod registry;
pub mod safety;
pub mod signal;
pub mod simulation;

pub use actor::{ProcessActor, StatusCell};
pub use config::{ActorConfig, EventConfig, SimulationConfig, SimulationLimits};
pub use detector::{DeadlockDetector, DetectorHandle};
pub use error::{SimError, SimResult};
pub use events::EventBus;
pub use ledger::{AllocationLedger, ClearedRows, PendingRequest, TryAcquire};
pub use registry::ResourceRegistry;
pub use safety::SafetyOutcome;
pub use signal::{StopHandle, StopSignal};
pub use simulation::Simulation;
