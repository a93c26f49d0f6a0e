//! sluice - multi-stage DAQ pipelines over shared-memory ring buffers
//!
//! Independent worker processes produce, transform, observe, and
//! consume fixed-layout numeric records; ring buffers coordinate the
//! handoff with backpressure and fan-out, and a controller wires the
//! declared topology together, supervises the run, and shuts the
//! graph down deterministically.
//!
//! ## Components
//!
//! - [`ring`]: the shared-memory ring buffer with writer, reader, and
//!   observer endpoints and the slot lifecycle protocol
//! - [`layout`]: fixed slot record layouts (scalar arrays or packed
//!   named-field records)
//! - [`control`]: setup-file loading, the worker registry, process
//!   spawning, and the supervising controller
//! - [`workers`]: stock worker payloads (sources, transforms, sinks,
//!   histogram observer)
//!
//! ## Example
//!
//! ```no_run
//! use sluice::{workers, SetupPlan};
//!
//! workers::register_builtin();
//! let plan = SetupPlan::load(std::path::Path::new("setup.yaml"))?;
//! let summary = sluice::run(plan)?;
//! println!("{} events processed", summary.events_processed);
//! # Ok::<(), sluice::SluiceError>(())
//! ```

pub mod constants;
pub mod control;
pub mod error;
pub mod layout;
pub mod ring;
pub mod worker;
pub mod workers;

// Re-export main components
pub use control::{
    register_worker, run, run_with_hooks, Controller, NoopHooks, RunHooks, RunSummary, SetupPlan,
};
pub use error::{Result, SluiceError};
pub use layout::{Element, ElementType, FieldDef, SlotLayout};
pub use ring::{
    BufferConfig, BufferStatus, Observer, ReadGuard, Reader, RingBuffer, SlotSnapshot, WriteGuard,
    Writer,
};
pub use worker::{Role, WorkerContext, WorkerFn};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
