//! dlsim Types - Core types for the resource allocation simulator
//!
//! dlsim simulates processes competing for finite, typed resources and
//! periodically sweeps the allocation state for deadlock.
//!
//! ## Architectural Boundaries
//!
//! - **dlsim-types** owns: identifiers, resource definitions, ledger
//!   snapshots, process status and the outbound event vocabulary
//! - **dlsim-core** owns: the allocation ledger, process actors and the
//!   deadlock detector
//! - **dlsim-cli** owns: presentation (scenario loading, rendering)
//!
//! ## Key Concepts
//!
//! - **ResourceDef**: A resource type with a fixed number of instances
//! - **LedgerSnapshot**: Consistent copy of capacity, availability, allocation
//!   and pending requests
//! - **ProcessStatus**: What a simulated process is doing right now
//! - **SimEvent**: Everything pushed to the presentation boundary

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod ids;
pub mod process;
pub mod resource;
pub mod snapshot;

// Re-export main types
pub use events::{DeadlockReport, DeadlockStatus, LogLevel, LogLine, SimEvent};
pub use ids::{ProcessId, ResourceId};
pub use process::{AcquisitionMode, ProcessSpec, ProcessState, ProcessStatus};
pub use resource::ResourceDef;
pub use snapshot::{LedgerSnapshot, ResourceCounts};
