//! Priority-driven scheduling for PathSteer.
//!
//! This crate decides which suspended execution state of an instrumented
//! driver gets resumed next:
//!
//! 1. **Annotations** from the instrumented code adjust per-state priorities
//! 2. **Execution callbacks** keep a block-coverage metric current
//! 3. **Selection** picks the next state under one of two policies
//!
//! # Architecture
//!
//! The scheduler sits between the execution engine and the instrumented
//! driver code:
//!
//! ```text
//! 1. Driver code hits an annotation → engine hands the page to the
//!    scheduler tagged with the invoking state
//! 2. The handler mutates that state's annotation (priority, loops,
//!    call stack, perf spans) and re-ranks it in the registry
//! 3. Block boundaries, forks, and hardware accesses arrive as
//!    callbacks and keep the coverage metric fresh
//! 4. When the engine needs a state to resume, select_next answers:
//!    favor-successful takes the priority order, maximize-coverage
//!    rotates through coverage-guided heuristics
//! 5. Trace records (hardware accesses, span events, success scores)
//!    stream to the session's trace sink throughout
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use std::path::Path;
//! use pathsteer_sched::{covdb, ModuleMap, Scheduler, SchedulerConfig};
//!
//! let module = covdb::LoadedModule::load(
//!     Path::new("/path/to/covdb"),
//!     "mydriver.ko",
//!     covdb::DEFAULT_GAP_MARKER,
//! )
//! .unwrap();
//! let mut modules = ModuleMap::new();
//! modules.insert(module, 0xffff_0000, true);
//!
//! let mut sched = Scheduler::new(SchedulerConfig {
//!     seed: 42,
//!     max_states: 64,
//!     ..Default::default()
//! });
//! // Wire `modules` plus the engine and a trace sink into a HostCtx,
//! // feed annotations and callbacks, then ask:
//! let next = sched.select_next();
//! ```
//!
//! # Module Structure
//!
//! - [`annotation`] — Per-state bookkeeping (priorities, stacks, counters)
//! - [`registry`] — Ordered index of runnable states per policy
//! - [`coverage`] — Block hit counts and annotated block coverage
//! - [`covdb`] — Basic-block listing loader and module address map
//! - [`selection`] — Sticky selection window and coverage-mode pickers
//! - [`scheduler`] — Annotation dispatch, callbacks, and selection
//! - [`report`] — Human-readable dumps of scheduler internals
//! - [`host`] — Traits the execution engine implements for us
//!
//! # Determinism
//!
//! Scheduling is deterministic given the same seed. The selection RNG is
//! a seeded ChaCha8 and every map that affects ordering is a BTreeMap.

pub mod annotation;
pub mod covdb;
pub mod coverage;
pub mod host;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod selection;

// Re-export main types for convenience
pub use annotation::{PerfKind, StateAnnotation, StateId, TrackedFunctions};
pub use covdb::{CovDbError, LoadedModule, ModuleMap};
pub use coverage::{BlockCoverage, BlockCoverageRecord, CoverageMap};
pub use host::{ExecutionHost, HostCtx, ModuleLocation, ModuleResolver};
pub use registry::{Policy, StateRegistry};
pub use scheduler::{SchedError, Scheduler, SchedulerConfig};
