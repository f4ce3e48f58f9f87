//! The scheduler core: annotation dispatch, execution callbacks, and
//! resume selection.
//!
//! Annotation pages arrive tagged with the invoking state. Each page
//! adjusts that state's [`StateAnnotation`] and, through the
//! [`StateRegistry`], its position in the resume order. Execution
//! callbacks (block boundaries, forks, hardware accesses) keep the
//! coverage metric and the perf counters current between annotations.
//! [`Scheduler::select_next`] then answers the one question the host
//! asks: which suspended state runs next.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use thiserror::Error;

use pathsteer_protocol::{
    decode_name, AnnotationOp, AnnotationPage, DeprioritizeDirective, IoRegionKind, IrqTrackMode,
    SpanCode, TrackedFnKind, FN_KIND_STUB_WRAPPER, OP_RANGE_FIRST, OP_RANGE_LAST,
};
use pathsteer_trace::records::{AccessKind, RecordKind, TraceRecord, HW_ATTRIBUTED_FNS};

use crate::annotation::{PerfKind, StateAnnotation, StateId, TrackedFunctions};
use crate::coverage::{BlockCoverage, CoverageMap};
use crate::host::{HostCtx, ModuleResolver};
use crate::registry::{Policy, StateRegistry};
use crate::report;
use crate::selection::{self, SelectionState};

/// Placeholder written into trace records for symbolic addresses and
/// values.
const SYMBOLIC_MARK: u64 = 0xDEAD_BEEF;

/// Tunables for one scheduling session.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard cap on live states; forks beyond it evict a loser.
    pub max_states: usize,
    /// Sticky-selection window under favor-successful, in timer ticks.
    pub favor_budget: u64,
    /// Sticky-selection window under maximize-coverage.
    pub maxcov_budget: u64,
    /// Priority step applied by prioritize and friends.
    pub boost: i64,
    /// Ceiling beyond which another boost is treated as runaway.
    pub extreme_priority: i64,
    /// Penalty applications granted per deprioritization site beyond the
    /// first.
    pub penalty_budget: u32,
    /// Open spans allowed per state before the stack is declared leaky.
    pub span_stack_cap: usize,
    /// Entry count below which a function counts as rarely visited.
    pub rare_fn_below: u64,
    /// Seed for the selection RNG.
    pub seed: u64,
    /// Log each state's I/O tag map when it is forgotten.
    pub dump_io_map: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_states: 100,
            favor_budget: 30,
            maxcov_budget: 2,
            boost: 1000,
            extreme_priority: 2_000_000_000,
            penalty_budget: 10,
            span_stack_cap: 100,
            rare_fn_below: 3,
            seed: 42,
            dump_io_map: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("unknown annotation opcode {0:#x}")]
    UnknownOp(u8),
    #[error("{op} annotation argument {index} is unresolvable")]
    UnresolvableArg { op: &'static str, index: usize },
    #[error("priority change {0} exceeds the extreme ceiling")]
    PriorityOverflow(i64),
    #[error("loop annotation at line {line} outside any annotated loop")]
    LoopStackEmpty { line: u32 },
    #[error("loop annotation at line {0} carries no site id")]
    LoopSiteZero(u32),
    #[error("success path delta {0} out of range")]
    BadSuccessDelta(i64),
    #[error("span stack exceeded {0} entries")]
    SpanStackOverflow(usize),
    #[error("span {code} arrived without an open {wanted}")]
    SpanMismatch { code: SpanCode, wanted: SpanCode },
    #[error("unrecognized span code {0}")]
    BadSpanCode(i64),
    #[error("unrecognized tracked-function kind {0}")]
    BadFnKind(i64),
    #[error("unrecognized io region kind {0}")]
    BadIoRegion(i64),
    #[error("DMA write attribution is not supported")]
    DmaWriteUnsupported,
    #[error("fork reported no children")]
    EmptyFork,
    #[error("no states available to select")]
    NoStates,
}

/// Priority-driven scheduler over suspended execution states.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    policy: Policy,
    registry: StateRegistry,
    annotations: BTreeMap<StateId, StateAnnotation>,
    coverage: CoverageMap,
    block_coverage: BlockCoverage,
    /// Global stub-wrapper crossing counts per function.
    function_counts: BTreeMap<String, u64>,
    primary_fns: Vec<String>,
    /// Iterations per live annotated loop site.
    loop_counts: BTreeMap<i64, u64>,
    /// Remaining penalty budget per deprioritization site.
    penalties: BTreeMap<i64, u32>,
    tracked: TrackedFunctions,
    irq_mode: IrqTrackMode,
    selection: SelectionState,
    tracing: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let selection = SelectionState::new(config.seed);
        Self {
            config,
            policy: Policy::FavorSuccessful,
            registry: StateRegistry::new(),
            annotations: BTreeMap::new(),
            coverage: CoverageMap::new(),
            block_coverage: BlockCoverage::new(),
            function_counts: BTreeMap::new(),
            primary_fns: Vec::new(),
            loop_counts: BTreeMap::new(),
            penalties: BTreeMap::new(),
            tracked: TrackedFunctions::default(),
            irq_mode: IrqTrackMode::None,
            selection,
            tracing: false,
        }
    }

    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.registry.len()
    }

    pub fn annotation(&self, id: StateId) -> Option<&StateAnnotation> {
        self.annotations.get(&id)
    }

    /// Registered states, best resume candidate first.
    pub fn states(&self) -> impl Iterator<Item = StateId> + '_ {
        self.registry.iter()
    }

    #[inline]
    pub fn block_coverage(&self) -> &BlockCoverage {
        &self.block_coverage
    }

    #[inline]
    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    /// Apply one annotation page invoked by `id`.
    ///
    /// Opcodes outside the annotation range are ignored; holes inside it
    /// are fatal. The invoking state is re-ranked afterwards whatever the
    /// handler did.
    pub fn handle_annotation(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        if !(OP_RANGE_FIRST..=OP_RANGE_LAST).contains(&page.op) {
            debug!(
                "[State {id}] ignoring opcode {:#x} outside the annotation range",
                page.op
            );
            return Ok(());
        }
        let Some(op) = AnnotationOp::from_code(page.op) else {
            return Err(SchedError::UnknownOp(page.op));
        };
        self.annotations.entry(id).or_insert_with(StateAnnotation::new);
        self.registry.remove(id);
        let result = self.dispatch(id, op, page, host);
        if let Some(ann) = self.annotations.get(&id) {
            self.registry.insert(self.policy, id, ann);
        }
        result
    }

    fn dispatch(
        &mut self,
        id: StateId,
        op: AnnotationOp,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        match op {
            AnnotationOp::Prioritize => self.handle_prioritize(id),
            AnnotationOp::Deprioritize => self.handle_deprioritize(id, page, host),
            AnnotationOp::LoopBefore => self.handle_loop_before(id, page),
            AnnotationOp::LoopBody => self.handle_loop_body(id, page, host),
            AnnotationOp::LoopAfter => self.handle_loop_after(id, page),
            AnnotationOp::ConcretizeKill => self.handle_concretize_kill(id, host),
            AnnotationOp::ConcretizeAll => {
                host.engine.concretize_all(id);
                Ok(())
            }
            AnnotationOp::KillAllOthers => {
                self.kill_others(id, host);
                Ok(())
            }
            AnnotationOp::DriverCallStack => self.handle_driver_call_stack(id, page),
            AnnotationOp::FavorSuccessful => self.handle_favor_successful(id, page, host),
            AnnotationOp::ResetPriorities => {
                self.reset_priorities(host.resolver);
                Ok(())
            }
            AnnotationOp::EnableTracing => {
                self.set_tracing(true, host);
                Ok(())
            }
            AnnotationOp::DisableTracing => {
                self.set_tracing(false, host);
                Ok(())
            }
            AnnotationOp::EnterFunction => self.handle_function_edge(id, page, true, host),
            AnnotationOp::ExitFunction => self.handle_function_edge(id, page, false, host),
            AnnotationOp::SuccessPath => self.handle_success_path(id, page, host),
            AnnotationOp::EnterBlock => self.handle_enter_block(id, page),
            AnnotationOp::PrimaryFn => self.handle_primary_fn(page),
            AnnotationOp::EnableTrackperf => self.handle_enable_trackperf(id, page, host),
            AnnotationOp::DisableTrackperf => self.handle_disable_trackperf(id, page, host),
            AnnotationOp::TrackperfFn => self.handle_trackperf_fn(page),
            AnnotationOp::IoRegion => self.handle_io_region(id, page, host),
        }
    }

    /// Priority ops are inert under maximize-coverage; the priority
    /// machinery must stay untouched there.
    fn maxcov_gated(&self, id: StateId) -> bool {
        if self.policy != Policy::MaximizeCoverage {
            return false;
        }
        if let Some(ann) = self.annotations.get(&id) {
            debug_assert!(ann.priority_change <= 0 && ann.loop_states.is_empty());
        }
        true
    }

    fn handle_prioritize(&mut self, id: StateId) -> Result<(), SchedError> {
        if self.maxcov_gated(id) {
            return Ok(());
        }
        self.boost_priority(id)
    }

    /// Raise a state's priority by one boost step. A state recovering
    /// from a penalty first snaps back to zero.
    fn boost_priority(&mut self, id: StateId) -> Result<(), SchedError> {
        let boost = self.config.boost;
        let ceiling = self.config.extreme_priority;
        let Some(ann) = self.annotations.get_mut(&id) else {
            return Ok(());
        };
        if ann.priority_change >= -boost {
            if ann.priority_change > ceiling {
                return Err(SchedError::PriorityOverflow(ann.priority_change));
            }
            ann.priority_change += boost;
        } else {
            ann.priority_change = 0;
        }
        Ok(())
    }

    fn handle_deprioritize(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        if self.maxcov_gated(id) {
            return Ok(());
        }
        let raw = page.arg(0).ok_or(SchedError::UnresolvableArg {
            op: "deprioritize",
            index: 0,
        })?;
        self.apply_deprioritize(id, DeprioritizeDirective::from_raw(raw), page.line, host);
        Ok(())
    }

    /// Apply a deprioritization directive, then always force the host to
    /// reschedule so the change takes effect immediately.
    fn apply_deprioritize(
        &mut self,
        id: StateId,
        directive: DeprioritizeDirective,
        line: u32,
        host: &mut HostCtx<'_>,
    ) {
        match directive {
            DeprioritizeDirective::ForceReschedule => self.force_reschedule(id, line),
            DeprioritizeDirective::Minimal => {
                let penalty = -self.config.boost;
                if let Some(ann) = self.annotations.get_mut(&id) {
                    ann.priority_change = penalty;
                }
            }
            DeprioritizeDirective::Decaying { site } => self.decaying_deprioritize(id, site, line),
        }
        info!("[State {id}] Rescheduling at line {line}");
        self.selection.reset_sticky();
        host.engine.request_reschedule();
    }

    /// Drop the state just below the best-ranked competitor.
    fn force_reschedule(&mut self, id: StateId, line: u32) {
        let target = self
            .registry
            .iter()
            .filter(|other| *other != id)
            .filter_map(|other| self.annotations.get(&other))
            .map(|ann| ann.priority_change)
            .max();
        let Some(target) = target else {
            info!("[State {id}] not bothering as only one state is available");
            return;
        };
        let Some(ann) = self.annotations.get_mut(&id) else {
            return;
        };
        let delta = ann.priority_change - target;
        if delta >= 0 {
            let delta = delta + 1;
            ann.priority_change -= delta;
            info!("[State {id}] Deprioritizing by {delta} at line {line}");
        } else {
            warn!("[State {id}] already not in first place");
        }
    }

    /// Penalize with a per-site budget. The first hit at a site seeds the
    /// budget without consuming it, so a site yields one more penalty
    /// than the configured budget before going quiet.
    fn decaying_deprioritize(&mut self, id: StateId, site: i64, line: u32) {
        match self.penalties.get_mut(&site) {
            None => {
                self.penalties.insert(site, self.config.penalty_budget);
                self.apply_penalty(id);
            }
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                self.apply_penalty(id);
            }
            Some(_) => {
                warn!(
                    "[State {id}] repeated deprioritizations at line {line}, \
                     maybe add an annotation?"
                );
            }
        }
    }

    fn apply_penalty(&mut self, id: StateId) {
        let penalty = -self.config.boost;
        if let Some(ann) = self.annotations.get_mut(&id) {
            ann.priority_change = penalty;
        }
    }

    fn loop_site(page: &AnnotationPage) -> Result<i64, SchedError> {
        let site = page.arg(0).ok_or(SchedError::UnresolvableArg {
            op: "loop annotation",
            index: 0,
        })?;
        if site == 0 {
            return Err(SchedError::LoopSiteZero(page.line));
        }
        Ok(site)
    }

    fn handle_loop_before(&mut self, id: StateId, page: &AnnotationPage) -> Result<(), SchedError> {
        if self.maxcov_gated(id) {
            return Ok(());
        }
        let site = Self::loop_site(page)?;
        if let Some(ann) = self.annotations.get_mut(&id) {
            ann.loop_states.push(0);
        }
        self.loop_counts.entry(site).or_insert(0);
        Ok(())
    }

    /// One loop iteration. A loop that has never forked keeps its state
    /// boosted; once forks pile up inside it, early iterations get pushed
    /// behind their siblings so the siblings run first.
    fn handle_loop_body(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        if self.maxcov_gated(id) {
            return Ok(());
        }
        let site = Self::loop_site(page)?;
        let slot = self
            .annotations
            .get(&id)
            .and_then(|ann| ann.loop_states.last().copied())
            .ok_or(SchedError::LoopStackEmpty { line: page.line })?;
        let count = {
            let entry = self.loop_counts.entry(site).or_insert(0);
            *entry += 1;
            *entry
        };
        match slot {
            0 => self.boost_priority(id)?,
            1..=20 => match count {
                1 => {}
                2 => {
                    self.apply_deprioritize(id, DeprioritizeDirective::Minimal, page.line, host);
                }
                3 => {
                    self.apply_deprioritize(
                        id,
                        DeprioritizeDirective::ForceReschedule,
                        page.line,
                        host,
                    );
                }
                _ => self.boost_priority(id)?,
            },
            _ => {
                if slot % 10 == 0 {
                    warn!(
                        "[State {id}] loop at line {} has forked {slot} times",
                        page.line
                    );
                    self.apply_deprioritize(
                        id,
                        DeprioritizeDirective::ForceReschedule,
                        page.line,
                        host,
                    );
                } else {
                    self.boost_priority(id)?;
                }
            }
        }
        Ok(())
    }

    fn handle_loop_after(&mut self, id: StateId, page: &AnnotationPage) -> Result<(), SchedError> {
        if self.maxcov_gated(id) {
            return Ok(());
        }
        let site = Self::loop_site(page)?;
        let popped = self
            .annotations
            .get_mut(&id)
            .and_then(|ann| ann.loop_states.pop());
        if popped.is_none() {
            return Err(SchedError::LoopStackEmpty { line: page.line });
        }
        self.loop_counts.remove(&site);
        self.boost_priority(id)
    }

    /// Concretize everything and, if the state already left the driver,
    /// collapse exploration down to it.
    fn handle_concretize_kill(
        &mut self,
        id: StateId,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        if self.maxcov_gated(id) {
            return Ok(());
        }
        host.engine.concretize_all(id);
        self.boost_priority(id)?;
        let depth = self
            .annotations
            .get(&id)
            .map_or(0, |ann| ann.driver_call_stack);
        if depth > 0 {
            info!("[State {id}] still inside the driver, keeping sibling states");
            return Ok(());
        }
        self.kill_others(id, host);
        Ok(())
    }

    fn kill_others(&mut self, id: StateId, host: &mut HostCtx<'_>) {
        let victims: Vec<StateId> = self.registry.iter().filter(|other| *other != id).collect();
        for victim in victims {
            host.engine
                .terminate_state(victim, "Killed because we're removing all states except one");
            self.forget_state(victim);
        }
    }

    /// Drop every trace of a state that no longer exists.
    fn forget_state(&mut self, id: StateId) {
        if self.config.dump_io_map {
            if let Some(ann) = self.annotations.get(&id) {
                info!("{}", report::format_io_map(id, ann));
            }
        }
        self.registry.remove(id);
        self.selection.forget(id);
        self.annotations.remove(&id);
    }

    fn handle_driver_call_stack(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
    ) -> Result<(), SchedError> {
        let Some(depth) = page.arg(0) else {
            warn!("[State {id}] call stack depth argument is symbolic, ignoring");
            return Ok(());
        };
        if let Some(ann) = self.annotations.get_mut(&id) {
            ann.driver_call_stack = depth;
        }
        Ok(())
    }

    /// Switch between the two selection policies. Entering
    /// maximize-coverage also wipes the priority state so nothing from
    /// the favor-successful era leaks into coverage ranking.
    fn handle_favor_successful(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        let Some(value) = page.arg(0) else {
            warn!("[State {id}] favor-successful argument is symbolic, ignoring");
            return Ok(());
        };
        if value == 0 {
            if self.policy == Policy::FavorSuccessful {
                warn!("Switching policy to maximize-coverage");
                self.policy = Policy::MaximizeCoverage;
                self.registry.rebuild(self.policy, &self.annotations);
                self.reset_priorities(host.resolver);
            }
        } else {
            warn!("Switching policy to favor-successful");
            self.policy = Policy::FavorSuccessful;
            self.registry.rebuild(self.policy, &self.annotations);
        }
        Ok(())
    }

    /// Zero every priority, drop loop tracking, and re-rank everything
    /// from fresh metrics.
    fn reset_priorities(&mut self, resolver: &dyn ModuleResolver) {
        for ann in self.annotations.values_mut() {
            ann.priority_change = 0;
            ann.loop_states.clear();
        }
        self.registry.clear();
        let ids: Vec<StateId> = self.annotations.keys().copied().collect();
        for state in ids {
            self.refresh_metric(state, resolver);
        }
    }

    /// Recompute a state's coverage metric from its resume pc and
    /// re-rank it. Returns false when the pc resolves to no module.
    fn refresh_metric(&mut self, id: StateId, resolver: &dyn ModuleResolver) -> bool {
        let Some(pc) = self.annotations.get(&id).map(|ann| ann.last_pc) else {
            return false;
        };
        let Some(loc) = resolver.resolve(pc) else {
            debug!("[State {id}] {pc:#x} is outside any known module");
            self.rerank(id, |ann| ann.metric_valid = false);
            return false;
        };
        let count = self.coverage.count(&loc.module, loc.rel_pc);
        self.rerank(id, |ann| {
            ann.metric = count;
            ann.metric_valid = true;
        });
        if let Some(ann) = self.annotations.get(&id) {
            info!(
                "[State {id}] {}, metric for {pc:#x} = {count}, priority change {}",
                loc.module, ann.priority_change
            );
        }
        true
    }

    /// Erase, mutate, re-insert. Every annotation change that can move a
    /// registry key goes through here.
    fn rerank<F: FnOnce(&mut StateAnnotation)>(&mut self, id: StateId, mutate: F) {
        self.registry.remove(id);
        let Some(ann) = self.annotations.get_mut(&id) else {
            return;
        };
        mutate(ann);
        if let Some(ann) = self.annotations.get(&id) {
            self.registry.insert(self.policy, id, ann);
        }
    }

    fn set_tracing(&mut self, enabled: bool, host: &mut HostCtx<'_>) {
        info!(
            "Memory tracing {}",
            if enabled { "enabled" } else { "disabled" }
        );
        host.engine.set_memory_tracing(enabled);
        self.tracing = enabled;
    }

    /// Function entry or exit. Stub wrappers report inverted edges and
    /// feed the global visit counts; everything else maintains the
    /// instrumented call stack. Emits one span event per tracked-function
    /// match still standing after the change.
    fn handle_function_edge(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        enter: bool,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        let Some(name) = payload_name(page) else {
            warn!("[State {id}] function name payload is unreadable, ignoring");
            return Ok(());
        };
        let Some(kind) = page.arg(0) else {
            warn!("[State {id}] function kind argument is symbolic, ignoring");
            return Ok(());
        };
        let mut push = enter;
        if kind == FN_KIND_STUB_WRAPPER {
            push = !enter;
            *self.function_counts.entry(name.clone()).or_insert(0) += 1;
        }
        let Some(ann) = self.annotations.get_mut(&id) else {
            return Ok(());
        };
        let edge = if push {
            ann.push_frame(&name, page.line);
            SpanCode::StartFn
        } else {
            if !ann.pop_frame(&name) {
                debug!("[State {id}] exit from {name} without a matching entry");
            }
            SpanCode::StopFn
        };
        let events = ann.recompute_tracked(&self.tracked, self.irq_mode);
        let pc = ann.last_pc;
        for _ in 0..events {
            host.trace.emit(TraceRecord {
                state_id: id.0,
                pc,
                kind: RecordKind::Event {
                    code: edge as i64,
                },
            });
        }
        Ok(())
    }

    /// Success score update. Once a state has gone negative, further
    /// positive reports push it further negative; only an explicit zero
    /// report clears it.
    fn handle_success_path(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        let Some(name) = payload_name(page) else {
            warn!("[State {id}] success-path function payload is unreadable, ignoring");
            return Ok(());
        };
        let Some(delta) = page.arg(0) else {
            warn!("[State {id}] success-path delta is symbolic, ignoring");
            return Ok(());
        };
        if !(-1..=1).contains(&delta) {
            return Err(SchedError::BadSuccessDelta(delta));
        }
        let Some(ann) = self.annotations.get_mut(&id) else {
            return Ok(());
        };
        match delta {
            1 => {
                if ann.success_path >= 0 {
                    ann.success_path += 1;
                } else {
                    ann.success_path -= 1;
                }
            }
            -1 => ann.success_path -= 1,
            _ => ann.success_path = 0,
        }
        let value = ann.success_path;
        let pc = ann.last_pc;
        debug!("[State {id}] success path for {name} now {value}");
        host.trace.emit(TraceRecord {
            state_id: id.0,
            pc,
            kind: RecordKind::SuccessPath {
                function: name,
                value,
            },
        });
        Ok(())
    }

    fn handle_enter_block(&mut self, id: StateId, page: &AnnotationPage) -> Result<(), SchedError> {
        let total = page.arg(0).ok_or(SchedError::UnresolvableArg {
            op: "enter-block",
            index: 0,
        })?;
        let index = page.arg(1).ok_or(SchedError::UnresolvableArg {
            op: "enter-block",
            index: 1,
        })?;
        let Some(name) = payload_name(page) else {
            warn!("[State {id}] enter-block function payload is unreadable, ignoring");
            return Ok(());
        };
        self.block_coverage.record(&name, total, index);
        Ok(())
    }

    fn handle_primary_fn(&mut self, page: &AnnotationPage) -> Result<(), SchedError> {
        let Some(name) = payload_name(page) else {
            warn!("primary function payload is unreadable, ignoring");
            return Ok(());
        };
        if name.is_empty() {
            debug!("skipping empty primary function name");
            return Ok(());
        }
        self.primary_fns.push(name);
        Ok(())
    }

    /// Open a tracking span (start), or close a pause (continue). An IRQ
    /// tracking mode arriving through the same argument reconfigures the
    /// tracker instead and emits nothing.
    fn handle_enable_trackperf(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        let raw = page.arg(0).ok_or(SchedError::UnresolvableArg {
            op: "enable-trackperf",
            index: 0,
        })?;
        if let Some(mode) = IrqTrackMode::from_raw(raw) {
            info!("IRQ tracking mode set to {mode:?}");
            self.irq_mode = mode;
            return Ok(());
        }
        let Some(code) = SpanCode::from_raw(raw) else {
            return Err(SchedError::BadSpanCode(raw));
        };
        {
            let Some(ann) = self.annotations.get_mut(&id) else {
                return Ok(());
            };
            match code {
                SpanCode::StartAuto | SpanCode::StartManual => {
                    if ann.span_stack.len() > self.config.span_stack_cap {
                        return Err(SchedError::SpanStackOverflow(ann.span_stack.len()));
                    }
                    ann.push_span(code);
                }
                SpanCode::ContinueProbe
                | SpanCode::ContinueStub
                | SpanCode::ContinueIrq
                | SpanCode::ContinueAuto
                | SpanCode::ContinueManual => {
                    let Some(wanted) = code.resume_target() else {
                        return Err(SchedError::BadSpanCode(raw));
                    };
                    if !ann.pop_span(wanted) {
                        warn!("{}", report::format_span_stack(id, ann));
                        return Err(SchedError::SpanMismatch { code, wanted });
                    }
                }
                _ => return Err(SchedError::BadSpanCode(raw)),
            }
        }
        self.emit_span_event(id, code, host);
        Ok(())
    }

    /// Pause an open span, or close one (stop keeps the counters as a
    /// history entry, discard throws them away).
    fn handle_disable_trackperf(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        let raw = page.arg(0).ok_or(SchedError::UnresolvableArg {
            op: "disable-trackperf",
            index: 0,
        })?;
        if let Some(mode) = IrqTrackMode::from_raw(raw) {
            info!("IRQ tracking mode set to {mode:?}");
            self.irq_mode = mode;
            return Ok(());
        }
        let Some(code) = SpanCode::from_raw(raw) else {
            return Err(SchedError::BadSpanCode(raw));
        };
        {
            let Some(ann) = self.annotations.get_mut(&id) else {
                return Ok(());
            };
            match code {
                SpanCode::PauseProbe
                | SpanCode::PauseStub
                | SpanCode::PauseIrq
                | SpanCode::PauseAuto
                | SpanCode::PauseManual => {
                    if ann.span_stack.len() > self.config.span_stack_cap {
                        return Err(SchedError::SpanStackOverflow(ann.span_stack.len()));
                    }
                    ann.push_span(code);
                }
                SpanCode::StopAuto
                | SpanCode::StopManual
                | SpanCode::DiscardAuto
                | SpanCode::DiscardManual => {
                    let Some(wanted) = code.resume_target() else {
                        return Err(SchedError::BadSpanCode(raw));
                    };
                    if !ann.pop_span(wanted) {
                        warn!("{}", report::format_span_stack(id, ann));
                        return Err(SchedError::SpanMismatch { code, wanted });
                    }
                }
                _ => return Err(SchedError::BadSpanCode(raw)),
            }
            if matches!(code, SpanCode::StopAuto | SpanCode::StopManual) {
                ann.perf.store();
            }
        }
        if matches!(code, SpanCode::StopAuto | SpanCode::StopManual) {
            self.log_perf_history(id);
        }
        if matches!(
            code,
            SpanCode::StopAuto
                | SpanCode::StopManual
                | SpanCode::DiscardAuto
                | SpanCode::DiscardManual
        ) {
            if let Some(ann) = self.annotations.get_mut(&id) {
                ann.perf.reset_current();
            }
        }
        self.emit_span_event(id, code, host);
        Ok(())
    }

    fn emit_span_event(&self, id: StateId, code: SpanCode, host: &mut HostCtx<'_>) {
        let pc = self.annotations.get(&id).map_or(0, |ann| ann.last_pc);
        host.trace.emit(TraceRecord {
            state_id: id.0,
            pc,
            kind: RecordKind::Event {
                code: code as i64,
            },
        });
    }

    fn log_perf_history(&self, invoker: StateId) {
        let mut states: Vec<(StateId, &StateAnnotation)> = Vec::new();
        if let Some(ann) = self.annotations.get(&invoker) {
            states.push((invoker, ann));
        }
        for id in self.registry.iter() {
            if id == invoker {
                continue;
            }
            if let Some(ann) = self.annotations.get(&id) {
                states.push((id, ann));
            }
        }
        info!(
            "Stored perf counters:\n{}",
            report::format_perf_history(&states)
        );
    }

    fn handle_trackperf_fn(&mut self, page: &AnnotationPage) -> Result<(), SchedError> {
        let raw = page.arg(0).ok_or(SchedError::UnresolvableArg {
            op: "trackperf-fn",
            index: 0,
        })?;
        let Some(name) = payload_name(page) else {
            warn!("tracked function payload is unreadable, ignoring");
            return Ok(());
        };
        if name.is_empty() {
            debug!("skipping empty tracked function name");
            return Ok(());
        }
        let Some(kind) = TrackedFnKind::from_raw(raw) else {
            return Err(SchedError::BadFnKind(raw));
        };
        self.tracked.register(&name, kind);
        Ok(())
    }

    fn handle_io_region(
        &mut self,
        id: StateId,
        page: &AnnotationPage,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        let kind_raw = page.arg(0).ok_or(SchedError::UnresolvableArg {
            op: "io-region",
            index: 0,
        })?;
        let address = page.arg(1).ok_or(SchedError::UnresolvableArg {
            op: "io-region",
            index: 1,
        })?;
        let size = page.arg(2).ok_or(SchedError::UnresolvableArg {
            op: "io-region",
            index: 2,
        })?;
        let Some(kind) = IoRegionKind::from_raw(kind_raw) else {
            return Err(SchedError::BadIoRegion(kind_raw));
        };
        info!(
            "[State {id}] io region {} at {address:#x}, size {size}",
            kind.name()
        );
        let pc = self.annotations.get(&id).map_or(0, |ann| ann.last_pc);
        host.trace.emit(TraceRecord {
            state_id: id.0,
            pc,
            kind: RecordKind::IoRegion {
                region: kind_raw as u32,
                address: address as u64,
                size: size as u64,
            },
        });
        Ok(())
    }

    /// Record a hardware access. The trace record always goes out, even
    /// for the unsupported DMA-write case; only the counter attribution
    /// is gated on an active span.
    pub fn on_memory_access(
        &mut self,
        id: StateId,
        kind: AccessKind,
        write: bool,
        virt: Option<u64>,
        value: Option<u64>,
        size: u8,
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        let ann = self
            .annotations
            .entry(id)
            .or_insert_with(StateAnnotation::new);
        let virt_address = virt.unwrap_or(SYMBOLIC_MARK);
        let phys_address = match (kind, virt) {
            (AccessKind::Mmio | AccessKind::Dma, Some(v)) => host.engine.physical_address(id, v),
            _ => SYMBOLIC_MARK,
        };
        let concrete_value = value.unwrap_or(SYMBOLIC_MARK);
        let functions = ann.attributed_functions(HW_ATTRIBUTED_FNS);
        debug!(
            "[State {id}] {kind} {} at {virt_address:#x}, size {size}",
            if write { "write" } else { "read" }
        );
        host.trace.emit(TraceRecord {
            state_id: id.0,
            pc: ann.last_pc,
            kind: RecordKind::HwAccess {
                kind,
                write,
                virt_address,
                phys_address,
                address_symbolic: virt.is_none(),
                value: concrete_value,
                value_symbolic: value.is_none(),
                size,
                functions,
            },
        });
        if !ann.attribution_active() {
            return Ok(());
        }
        let perf_kind = match (kind, write) {
            (AccessKind::Port, false) => PerfKind::PortRead,
            (AccessKind::Port, true) => PerfKind::PortWrite,
            (AccessKind::Mmio, false) => PerfKind::MmioRead,
            (AccessKind::Mmio, true) => PerfKind::MmioWrite,
            (AccessKind::Dma, false) => PerfKind::DmaRead,
            (AccessKind::Dma, true) => return Err(SchedError::DmaWriteUnsupported),
        };
        ann.perf.bump(perf_kind);
        Ok(())
    }

    /// Where an execution event at `pc` should be attributed, if
    /// anywhere: inside an active span, in the primary module, on a
    /// real (non-stub) function.
    fn trackperf_target(
        &self,
        id: StateId,
        pc: u64,
        resolver: &dyn ModuleResolver,
    ) -> Option<(u64, String)> {
        let ann = self.annotations.get(&id)?;
        if !ann.attribution_active() {
            return None;
        }
        if pc == 0 {
            return Some((0, String::new()));
        }
        let loc = resolver.resolve(pc)?;
        if !loc.primary {
            return None;
        }
        let function = resolver.valid_function_at(&loc.module, loc.rel_pc)?;
        Some((loc.rel_pc, function))
    }

    pub fn on_block_start(&mut self, id: StateId, pc: u64, host: &mut HostCtx<'_>) {
        self.perf_event(id, pc, PerfKind::Block, host);
    }

    pub fn on_instruction(&mut self, id: StateId, pc: u64, host: &mut HostCtx<'_>) {
        self.perf_event(id, pc, PerfKind::Instruction, host);
    }

    fn perf_event(&mut self, id: StateId, pc: u64, kind: PerfKind, host: &mut HostCtx<'_>) {
        let Some((delta, function)) = self.trackperf_target(id, pc, host.resolver) else {
            return;
        };
        if let Some(ann) = self.annotations.get_mut(&id) {
            ann.perf.bump(kind);
        }
        let record_kind = match kind {
            PerfKind::Block => RecordKind::Block { delta, function },
            _ => RecordKind::Instruction { delta, function },
        };
        host.trace.emit(TraceRecord {
            state_id: id.0,
            pc,
            kind: record_kind,
        });
    }

    pub fn on_timer_tick(&mut self) {
        self.selection.tick();
    }

    /// Tag an I/O region with the call stack that touched it.
    pub fn on_io_tag(&mut self, id: StateId, tag: &str) {
        let ann = self
            .annotations
            .entry(id)
            .or_insert_with(StateAnnotation::new);
        let stack = ann.call_stack_string();
        ann.io_map.insert(tag.to_string(), stack);
    }

    /// A state finished the block at `block_start` and will resume at
    /// `next_pc`. Updates the global hit counts and re-derives the
    /// state's metric from how well-trodden its next block already is.
    pub fn on_block_boundary(
        &mut self,
        id: StateId,
        block_start: u64,
        next_pc: u64,
        host: &mut HostCtx<'_>,
    ) {
        let ann = self
            .annotations
            .entry(id)
            .or_insert_with(StateAnnotation::new);
        ann.last_pc = next_pc;
        let Some(cur) = host.resolver.resolve(block_start) else {
            self.rerank(id, |ann| ann.metric_valid = false);
            return;
        };
        let was_invalid = self
            .annotations
            .get(&id)
            .is_some_and(|ann| !ann.metric_valid);
        if was_invalid {
            self.rerank(id, |ann| ann.metric_valid = true);
        }
        let weight = host.engine.cost_weight(id).max(1);
        let count = match host.resolver.resolve(next_pc) {
            None => self.coverage.hit(&cur.module, cur.rel_pc),
            Some(next) => {
                let cur_is_new = !self.coverage.is_known(&cur.module, cur.rel_pc);
                let next_is_new = !self.coverage.is_known(&next.module, next.rel_pc);
                if cur_is_new {
                    self.coverage.set(&cur.module, cur.rel_pc, 1);
                } else {
                    self.coverage.hit(&cur.module, cur.rel_pc);
                }
                if next_is_new {
                    self.coverage.set(&next.module, next.rel_pc, 0);
                }
                self.coverage.count(&next.module, next.rel_pc)
            }
        };
        self.rerank(id, |ann| {
            ann.metric = count.saturating_mul(weight);
            ann.metric_valid = true;
        });
    }

    /// Track states appearing and disappearing outside of forks.
    pub fn on_states_updated(
        &mut self,
        added: &[(StateId, u64)],
        removed: &[StateId],
        host: &mut HostCtx<'_>,
    ) {
        for &(id, pc) in added {
            let ann = self
                .annotations
                .entry(id)
                .or_insert_with(StateAnnotation::new);
            ann.last_pc = pc;
            self.refresh_metric(id, host.resolver);
        }
        for &id in removed {
            self.forget_state(id);
        }
    }

    /// A state forked. Children inherit a snapshot of the parent's
    /// annotation; a fork inside an annotated loop advances the loop's
    /// fork slot. Enforces the state cap afterwards.
    pub fn on_fork(
        &mut self,
        parent: StateId,
        children: &[StateId],
        host: &mut HostCtx<'_>,
    ) -> Result<(), SchedError> {
        if children.is_empty() {
            return Err(SchedError::EmptyFork);
        }
        self.annotations
            .entry(parent)
            .or_insert_with(StateAnnotation::new);
        if self.policy == Policy::FavorSuccessful {
            let in_loop = self
                .annotations
                .get(&parent)
                .is_some_and(|ann| !ann.loop_states.is_empty());
            if in_loop {
                if let Some(ann) = self.annotations.get_mut(&parent) {
                    if let Some(top) = ann.loop_states.last_mut() {
                        *top += 1;
                    }
                }
                if let Some(ann) = self.annotations.get(&parent) {
                    info!(
                        "Forking and tracking loop: {parent}, state count: {}, \
                         number of entries: {}",
                        self.registry.len(),
                        ann.loop_states.len()
                    );
                }
            }
        }
        let snapshot = match self.annotations.get(&parent) {
            Some(ann) => ann.clone(),
            None => StateAnnotation::new(),
        };
        for &child in children {
            self.annotations.insert(child, snapshot.clone());
            self.refresh_metric(child, host.resolver);
        }
        if !self.registry.contains(parent) {
            if let Some(ann) = self.annotations.get(&parent) {
                self.registry.insert(self.policy, parent, ann);
            }
        }
        self.enforce_state_cap(parent, children, host);
        Ok(())
    }

    /// Kill one loser when the fork pushed us over the cap. The parent
    /// and the fresh children are never candidates.
    fn enforce_state_cap(&mut self, parent: StateId, children: &[StateId], host: &mut HostCtx<'_>) {
        if self.registry.len() <= self.config.max_states {
            return;
        }
        let mut victim: Option<StateId> = None;
        match self.policy {
            Policy::FavorSuccessful => {
                let mut lowest = i64::MAX;
                for id in self.registry.iter() {
                    if id == parent || children.contains(&id) {
                        continue;
                    }
                    let Some(ann) = self.annotations.get(&id) else {
                        continue;
                    };
                    if ann.priority_change < lowest {
                        lowest = ann.priority_change;
                        victim = Some(id);
                    }
                }
            }
            Policy::MaximizeCoverage => {
                let mut best = 0u64;
                for id in self.registry.iter() {
                    if id == parent || children.contains(&id) {
                        continue;
                    }
                    let Some(ann) = self.annotations.get(&id) else {
                        continue;
                    };
                    if ann.metric_valid && ann.metric > best {
                        best = ann.metric;
                        victim = Some(id);
                    }
                }
            }
        }
        let Some(victim) = victim else {
            warn!("Failed to destroy any state");
            return;
        };
        host.engine
            .terminate_state(victim, "Too many states -- killing low priority one");
        self.forget_state(victim);
    }

    /// Pick the state to resume. The previous selection is sticky within
    /// its policy's budget; otherwise favor-successful takes the registry
    /// head and maximize-coverage runs its staged picks.
    pub fn select_next(&mut self) -> Result<StateId, SchedError> {
        let selected = match self.policy {
            Policy::FavorSuccessful => match self.sticky_selection(self.config.favor_budget) {
                Some(last) => last,
                None => self.registry.head().ok_or(SchedError::NoStates)?,
            },
            Policy::MaximizeCoverage => match self.sticky_selection(self.config.maxcov_budget) {
                Some(last) => last,
                None => self.coverage_pick()?,
            },
        };
        if self.selection.note_selected(selected) {
            self.log_priority_snapshot(selected);
        }
        Ok(selected)
    }

    fn sticky_selection(&self, budget: u64) -> Option<StateId> {
        if !self.selection.within_budget(budget) {
            return None;
        }
        self.selection
            .last()
            .filter(|last| self.registry.contains(*last))
    }

    /// Barely-explored states win outright; otherwise one round-robin
    /// mode gets consulted, and anything still unresolved goes to the
    /// seeded random pick.
    fn coverage_pick(&mut self) -> Result<StateId, SchedError> {
        let mut picked = selection::pick_low_metric(&self.registry, &self.annotations);
        if picked.is_none() {
            picked = match self.selection.mode() {
                2 => selection::pick_hot_metric(&self.registry, &self.annotations),
                3 => selection::pick_rare_function(
                    &self.registry,
                    &self.annotations,
                    &self.function_counts,
                    self.config.rare_fn_below,
                ),
                4 => selection::pick_primary_match(
                    &self.registry,
                    &self.annotations,
                    &self.primary_fns,
                ),
                5 => selection::pick_success_extreme(&self.registry, &self.annotations, true),
                6 => selection::pick_success_extreme(&self.registry, &self.annotations, false),
                7 => selection::pick_stack_extreme(&self.registry, &self.annotations, true),
                8 => selection::pick_stack_extreme(&self.registry, &self.annotations, false),
                _ => None,
            };
            self.selection.advance_mode();
        }
        match picked {
            Some(id) => Ok(id),
            None => self
                .selection
                .pick_random(&self.registry)
                .ok_or(SchedError::NoStates),
        }
    }

    fn log_priority_snapshot(&self, selected: StateId) {
        let invoker_stack = self
            .annotations
            .get(&selected)
            .map_or_else(|| "Not in driver".to_string(), |ann| ann.call_stack_string());
        let mut states: Vec<(StateId, &StateAnnotation)> = Vec::new();
        for id in self.registry.iter() {
            if let Some(ann) = self.annotations.get(&id) {
                states.push((id, ann));
            }
        }
        info!(
            "Selection changed to state {selected}:\n{}",
            report::format_priority_snapshot(&invoker_stack, &states)
        );
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        if let Err(msg) = self.registry.verify_invariants(self.policy, &self.annotations) {
            panic!("registry invariant violated: {msg}");
        }
    }
}

fn payload_name(page: &AnnotationPage) -> Option<String> {
    let len = page.payload_len as usize;
    let buf = page.payload.get(..len)?;
    decode_name(buf)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
