//! Host integration seams.
//!
//! The scheduler never owns execution states, loaded modules, or the trace
//! stream; it drives them through these traits. Production wires in the
//! real engine and a [`crate::covdb::ModuleMap`], tests substitute
//! recording fakes.

use pathsteer_trace::sink::TraceSink;

use crate::annotation::StateId;

/// Where a program counter landed inside a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLocation {
    /// Module name, matching the coverage database key.
    pub module: String,
    /// Program counter relative to the module load base.
    pub rel_pc: u64,
    /// Whether this module is the instrumented target.
    pub primary: bool,
}

/// Resolves raw program counters against the host's loaded modules.
pub trait ModuleResolver {
    /// Locate `pc` inside a loaded module, if any covers it.
    fn resolve(&self, pc: u64) -> Option<ModuleLocation>;

    /// Function name covering `rel_pc` in `module`, instrumentation stubs
    /// included.
    fn function_at(&self, module: &str, rel_pc: u64) -> Option<String>;

    /// Like [`function_at`], but `None` for instrumentation stubs.
    ///
    /// [`function_at`]: ModuleResolver::function_at
    fn valid_function_at(&self, module: &str, rel_pc: u64) -> Option<String>;
}

/// Control operations the scheduler issues back to the execution engine.
pub trait ExecutionHost {
    /// Terminate `id` permanently. The scheduler drops its own bookkeeping
    /// for the state before this returns.
    fn terminate_state(&mut self, id: StateId, reason: &str);

    /// Concretize all symbolic data held by `id`.
    fn concretize_all(&mut self, id: StateId);

    /// Ask the engine to re-run selection at the next safe point.
    fn request_reschedule(&mut self);

    /// Subscribe or unsubscribe the scheduler from memory access events.
    fn set_memory_tracing(&mut self, enabled: bool);

    /// Relative execution cost of resuming `id`; scales the coverage
    /// metric. Values below one are treated as one.
    fn cost_weight(&self, id: StateId) -> u64;

    /// Translate a concrete virtual address for `id`.
    fn physical_address(&self, id: StateId, virt: u64) -> u64;
}

/// Borrowed bundle of host-side collaborators, passed into each scheduler
/// entry point.
pub struct HostCtx<'a> {
    pub engine: &'a mut dyn ExecutionHost,
    pub resolver: &'a dyn ModuleResolver,
    pub trace: &'a mut dyn TraceSink,
}
