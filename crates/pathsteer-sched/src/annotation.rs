//! Per-state bookkeeping.
//!
//! Every execution state the scheduler knows about carries one
//! [`StateAnnotation`], held in a side table keyed by [`StateId`] rather
//! than inside the host's own state objects. Forking clones the parent's
//! annotation wholesale; the copies never alias.

use std::collections::BTreeMap;
use std::fmt;

use pathsteer_protocol::{IrqTrackMode, SpanCode, TrackedFnKind};

/// Number of per-state performance counter kinds.
pub const PERF_KINDS: usize = 8;

/// Port and MMIO accessor wrappers that carry no attribution value; the
/// interesting caller is always further up the stack.
const ACCESSOR_FNS: [&str; 18] = [
    "inb",
    "inb_local",
    "inw",
    "inw_local",
    "inl",
    "inl_local",
    "outb",
    "outb_local",
    "outw",
    "outw_local",
    "outl",
    "outl_local",
    "writeb",
    "writew",
    "writel",
    "readb",
    "readw",
    "readl",
];

fn is_accessor(function: &str) -> bool {
    ACCESSOR_FNS.contains(&function)
}

/// Identifier of one suspended execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub u64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One per-state performance counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfKind {
    Block,
    Instruction,
    PortRead,
    PortWrite,
    MmioRead,
    MmioWrite,
    DmaRead,
    DmaWrite,
}

impl PerfKind {
    /// Every kind, in dump order.
    pub const ALL: [PerfKind; PERF_KINDS] = [
        PerfKind::Block,
        PerfKind::Instruction,
        PerfKind::PortRead,
        PerfKind::PortWrite,
        PerfKind::MmioRead,
        PerfKind::MmioWrite,
        PerfKind::DmaRead,
        PerfKind::DmaWrite,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            PerfKind::Block => "BB",
            PerfKind::Instruction => "INST",
            PerfKind::PortRead => "PIO_Read",
            PerfKind::PortWrite => "PIO_Write",
            PerfKind::MmioRead => "MMIO_Read",
            PerfKind::MmioWrite => "MMIO_Write",
            PerfKind::DmaRead => "DMA_Read",
            PerfKind::DmaWrite => "DMA_Write",
        }
    }
}

impl fmt::Display for PerfKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Live counters plus the stored history snapshots for one state.
#[derive(Debug, Clone, Default)]
pub struct PerfCounters {
    current: [u64; PERF_KINDS],
    history: [Vec<u64>; PERF_KINDS],
}

impl PerfCounters {
    #[inline]
    pub fn bump(&mut self, kind: PerfKind) {
        self.current[kind.index()] += 1;
    }

    #[inline]
    pub fn get(&self, kind: PerfKind) -> u64 {
        self.current[kind.index()]
    }

    #[inline]
    pub fn history(&self, kind: PerfKind) -> &[u64] {
        &self.history[kind.index()]
    }

    /// Append every live counter to its history.
    pub fn store(&mut self) {
        for kind in PerfKind::ALL {
            self.history[kind.index()].push(self.current[kind.index()]);
        }
    }

    /// Zero the live counters. History is kept.
    pub fn reset_current(&mut self) {
        self.current = [0; PERF_KINDS];
    }
}

/// Everything the scheduler tracks about one execution state.
///
/// Fresh annotations start with a valid zero metric so a state that never
/// reports a block boundary still ranks under maximize-coverage.
#[derive(Debug, Clone)]
pub struct StateAnnotation {
    /// Cumulative priority adjustment; higher wins under favor-successful.
    pub priority_change: i64,
    /// Hit count of the block the state will resume into, scaled by the
    /// host cost weight.
    pub metric: u64,
    /// Whether `metric` is meaningful for ordering.
    pub metric_valid: bool,
    /// Sticky success score; once negative, positive reports subtract.
    pub success_path: i64,
    /// Depth of the instrumented driver call stack as last reported.
    pub driver_call_stack: i64,
    /// One slot per live annotated loop, innermost last; each slot counts
    /// the forks taken inside that loop.
    pub loop_states: Vec<u32>,
    /// Function names of the instrumented call stack, outermost first.
    pub call_stack_fns: Vec<String>,
    /// Call-site line per frame, parallel to `call_stack_fns`.
    pub call_stack_lines: Vec<u32>,
    /// Open tracking spans, innermost last.
    pub span_stack: Vec<SpanCode>,
    /// Tracked functions currently on the call stack per the IRQ mode.
    pub tracked_fn_count: u32,
    pub perf: PerfCounters,
    /// I/O region tag to the call stack that registered it.
    pub io_map: BTreeMap<String, String>,
    /// Most recently reported program counter.
    pub last_pc: u64,
}

impl StateAnnotation {
    pub fn new() -> Self {
        Self {
            priority_change: 0,
            metric: 0,
            metric_valid: true,
            success_path: 0,
            driver_call_stack: 0,
            loop_states: Vec::new(),
            call_stack_fns: Vec::new(),
            call_stack_lines: Vec::new(),
            span_stack: Vec::new(),
            tracked_fn_count: 0,
            perf: PerfCounters::default(),
            io_map: BTreeMap::new(),
            last_pc: 0,
        }
    }

    /// Push one frame onto the instrumented call stack.
    pub fn push_frame(&mut self, function: &str, line: u32) {
        self.call_stack_fns.push(function.to_string());
        self.call_stack_lines.push(line);
    }

    /// Pop the most recent frame named `function`. Returns false and
    /// leaves the stack untouched when no frame matches.
    pub fn pop_frame(&mut self, function: &str) -> bool {
        for idx in (0..self.call_stack_fns.len()).rev() {
            if self.call_stack_fns[idx] == function {
                self.call_stack_fns.remove(idx);
                self.call_stack_lines.remove(idx);
                return true;
            }
        }
        false
    }

    /// Render the call stack as `fn:line -> fn:line -> `, outermost first,
    /// or a placeholder when the state never entered the driver.
    pub fn call_stack_string(&self) -> String {
        if self.call_stack_fns.is_empty() {
            return "Not in driver".to_string();
        }
        let mut out = String::new();
        for (function, line) in self.call_stack_fns.iter().zip(&self.call_stack_lines) {
            out.push_str(&format!("{function}:{line} -> "));
        }
        out
    }

    #[inline]
    pub fn push_span(&mut self, code: SpanCode) {
        self.span_stack.push(code);
    }

    /// Pop the most recent occurrence of `target` from the span stack.
    pub fn pop_span(&mut self, target: SpanCode) -> bool {
        for idx in (0..self.span_stack.len()).rev() {
            if self.span_stack[idx] == target {
                self.span_stack.remove(idx);
                return true;
            }
        }
        false
    }

    /// Whether executed blocks and hardware accesses should currently be
    /// attributed to this state's perf counters.
    pub fn attribution_active(&self) -> bool {
        match self.span_stack.last() {
            Some(&SpanCode::StartManual) => true,
            Some(_) => self.tracked_fn_count > 0,
            None => false,
        }
    }

    /// Recount tracked functions on the call stack after a push or pop.
    ///
    /// Walks the stack outermost to innermost. The first registered IRQ
    /// handler frame splits the walk per `irq_mode`: `None` discards the
    /// count and stops, `OnlyCalled` stops only when a tracked function sat
    /// beneath the handler (the interrupted context was tracked) and
    /// otherwise skips the handler frame itself, `All` treats the handler
    /// like any other frame. Returns the number of matches made before the
    /// walk stopped, which is also the number of trace events the caller
    /// should emit; the final count stored in `tracked_fn_count` can be
    /// smaller when the walk was cut short.
    pub fn recompute_tracked(
        &mut self,
        tracked: &TrackedFunctions,
        irq_mode: IrqTrackMode,
    ) -> u32 {
        let mut count: u32 = 0;
        let mut matches: u32 = 0;
        let mut irq_depth: u32 = 0;
        let top = self.call_stack_fns.len().saturating_sub(1);
        for (idx, frame) in self.call_stack_fns.iter().enumerate() {
            if irq_depth == 0 && tracked.is_irq_handler(frame) {
                irq_depth = 1;
            } else if irq_depth > 0 {
                irq_depth += 1;
            }
            if irq_depth == 1 {
                match irq_mode {
                    IrqTrackMode::None => {
                        count = 0;
                        break;
                    }
                    IrqTrackMode::OnlyCalled => {
                        if count > 0 {
                            count = 0;
                            break;
                        }
                        continue;
                    }
                    IrqTrackMode::All => {}
                }
            }
            for (name, kind) in tracked.iter() {
                if kind == TrackedFnKind::IrqHandler {
                    continue;
                }
                if kind == TrackedFnKind::NonTransitive && idx != top {
                    continue;
                }
                if name == frame {
                    count += 1;
                    matches += 1;
                }
            }
        }
        self.tracked_fn_count = count;
        matches
    }

    /// Most recent call-stack functions for hardware-access attribution,
    /// innermost first, skipping the raw accessor wrappers.
    pub fn attributed_functions(&self, limit: usize) -> Vec<String> {
        let mut out = Vec::new();
        for frame in self.call_stack_fns.iter().rev() {
            if is_accessor(frame) {
                continue;
            }
            out.push(frame.clone());
            if out.len() >= limit {
                break;
            }
        }
        out
    }
}

impl Default for StateAnnotation {
    fn default() -> Self {
        Self::new()
    }
}

/// Global registry of functions whose execution is attributed, in
/// registration order.
#[derive(Debug, Clone, Default)]
pub struct TrackedFunctions {
    names: Vec<String>,
    kinds: Vec<TrackedFnKind>,
}

impl TrackedFunctions {
    pub fn register(&mut self, name: &str, kind: TrackedFnKind) {
        self.names.push(name.to_string());
        self.kinds.push(kind);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn is_irq_handler(&self, function: &str) -> bool {
        self.iter()
            .any(|(name, kind)| kind == TrackedFnKind::IrqHandler && name == function)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, TrackedFnKind)> + '_ {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.kinds.iter().copied())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(entries: &[(&str, TrackedFnKind)]) -> TrackedFunctions {
        let mut t = TrackedFunctions::default();
        for (name, kind) in entries {
            t.register(name, *kind);
        }
        t
    }

    #[test]
    fn test_fresh_annotation_has_valid_zero_metric() {
        let ann = StateAnnotation::new();
        assert!(ann.metric_valid);
        assert_eq!(ann.metric, 0);
        assert_eq!(ann.priority_change, 0);
        assert!(ann.loop_states.is_empty());
    }

    #[test]
    fn test_frame_stacks_stay_parallel() {
        let mut ann = StateAnnotation::new();
        ann.push_frame("probe", 10);
        ann.push_frame("setup", 20);
        assert_eq!(ann.call_stack_fns, ["probe", "setup"]);
        assert_eq!(ann.call_stack_lines, [10, 20]);
        assert!(ann.pop_frame("setup"));
        assert_eq!(ann.call_stack_fns, ["probe"]);
        assert_eq!(ann.call_stack_lines, [10]);
    }

    #[test]
    fn test_pop_frame_removes_most_recent_match() {
        let mut ann = StateAnnotation::new();
        ann.push_frame("a", 1);
        ann.push_frame("b", 2);
        ann.push_frame("a", 3);
        assert!(ann.pop_frame("a"));
        assert_eq!(ann.call_stack_fns, ["a", "b"]);
        assert_eq!(ann.call_stack_lines, [1, 2]);
    }

    #[test]
    fn test_pop_missing_frame_leaves_stack() {
        let mut ann = StateAnnotation::new();
        ann.push_frame("a", 1);
        assert!(!ann.pop_frame("b"));
        assert_eq!(ann.call_stack_fns, ["a"]);
    }

    #[test]
    fn test_call_stack_string() {
        let mut ann = StateAnnotation::new();
        assert_eq!(ann.call_stack_string(), "Not in driver");
        ann.push_frame("probe", 10);
        ann.push_frame("setup", 20);
        assert_eq!(ann.call_stack_string(), "probe:10 -> setup:20 -> ");
    }

    #[test]
    fn test_pop_span_removes_most_recent_match() {
        let mut ann = StateAnnotation::new();
        ann.push_span(SpanCode::StartAuto);
        ann.push_span(SpanCode::PauseAuto);
        ann.push_span(SpanCode::StartAuto);
        assert!(ann.pop_span(SpanCode::StartAuto));
        assert_eq!(ann.span_stack, [SpanCode::StartAuto, SpanCode::PauseAuto]);
        assert!(!ann.pop_span(SpanCode::StartManual));
    }

    #[test]
    fn test_attribution_requires_open_span() {
        let mut ann = StateAnnotation::new();
        assert!(!ann.attribution_active());
        ann.push_span(SpanCode::StartAuto);
        assert!(!ann.attribution_active());
        ann.tracked_fn_count = 1;
        assert!(ann.attribution_active());
        ann.tracked_fn_count = 0;
        ann.push_span(SpanCode::StartManual);
        assert!(ann.attribution_active());
    }

    #[test]
    fn test_recompute_transitive_and_nontransitive() {
        let t = tracked(&[
            ("deep", TrackedFnKind::Transitive),
            ("top_only", TrackedFnKind::NonTransitive),
        ]);
        let mut ann = StateAnnotation::new();
        ann.push_frame("deep", 1);
        ann.push_frame("top_only", 2);
        assert_eq!(ann.recompute_tracked(&t, IrqTrackMode::None), 2);
        assert_eq!(ann.tracked_fn_count, 2);

        // top_only buried under another frame no longer matches
        ann.push_frame("other", 3);
        assert_eq!(ann.recompute_tracked(&t, IrqTrackMode::None), 1);
        assert_eq!(ann.tracked_fn_count, 1);
    }

    #[test]
    fn test_recompute_irq_none_stops_at_handler() {
        let t = tracked(&[
            ("work", TrackedFnKind::Transitive),
            ("irq", TrackedFnKind::IrqHandler),
        ]);
        let mut ann = StateAnnotation::new();
        ann.push_frame("work", 1);
        ann.push_frame("irq", 2);
        ann.push_frame("work", 3);
        // One event fired for the frame below the handler, count discarded.
        assert_eq!(ann.recompute_tracked(&t, IrqTrackMode::None), 1);
        assert_eq!(ann.tracked_fn_count, 0);
    }

    #[test]
    fn test_recompute_irq_only_called_interrupted_context() {
        let t = tracked(&[
            ("work", TrackedFnKind::Transitive),
            ("irq", TrackedFnKind::IrqHandler),
        ]);
        // A tracked function sat beneath the handler: discard.
        let mut ann = StateAnnotation::new();
        ann.push_frame("work", 1);
        ann.push_frame("irq", 2);
        ann.push_frame("work", 3);
        assert_eq!(ann.recompute_tracked(&t, IrqTrackMode::OnlyCalled), 1);
        assert_eq!(ann.tracked_fn_count, 0);

        // Nothing tracked beneath it: the handler's callees still count.
        let mut ann = StateAnnotation::new();
        ann.push_frame("boring", 1);
        ann.push_frame("irq", 2);
        ann.push_frame("work", 3);
        assert_eq!(ann.recompute_tracked(&t, IrqTrackMode::OnlyCalled), 1);
        assert_eq!(ann.tracked_fn_count, 1);
    }

    #[test]
    fn test_recompute_irq_all_counts_through_handler() {
        let t = tracked(&[
            ("work", TrackedFnKind::Transitive),
            ("irq", TrackedFnKind::IrqHandler),
        ]);
        let mut ann = StateAnnotation::new();
        ann.push_frame("work", 1);
        ann.push_frame("irq", 2);
        ann.push_frame("work", 3);
        assert_eq!(ann.recompute_tracked(&t, IrqTrackMode::All), 2);
        assert_eq!(ann.tracked_fn_count, 2);
    }

    #[test]
    fn test_recompute_irq_handler_never_matches_by_name() {
        let t = tracked(&[("irq", TrackedFnKind::IrqHandler)]);
        let mut ann = StateAnnotation::new();
        ann.push_frame("irq", 1);
        assert_eq!(ann.recompute_tracked(&t, IrqTrackMode::All), 0);
        assert_eq!(ann.tracked_fn_count, 0);
    }

    #[test]
    fn test_attributed_functions_skip_accessors() {
        let mut ann = StateAnnotation::new();
        ann.push_frame("probe", 1);
        ann.push_frame("reset_chip", 2);
        ann.push_frame("readl", 3);
        let fns = ann.attributed_functions(3);
        assert_eq!(fns, ["reset_chip", "probe"]);
        let fns = ann.attributed_functions(1);
        assert_eq!(fns, ["reset_chip"]);
    }

    #[test]
    fn test_perf_store_and_reset() {
        let mut perf = PerfCounters::default();
        perf.bump(PerfKind::Block);
        perf.bump(PerfKind::Block);
        perf.bump(PerfKind::MmioRead);
        perf.store();
        perf.reset_current();
        perf.bump(PerfKind::Block);
        perf.store();
        assert_eq!(perf.history(PerfKind::Block), [2, 1]);
        assert_eq!(perf.history(PerfKind::MmioRead), [1, 0]);
        assert_eq!(perf.get(PerfKind::Block), 1);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut parent = StateAnnotation::new();
        parent.push_frame("probe", 1);
        parent.priority_change = 5;
        let mut child = parent.clone();
        child.push_frame("child_only", 2);
        child.priority_change = -5;
        assert_eq!(parent.call_stack_fns, ["probe"]);
        assert_eq!(parent.priority_change, 5);
        assert_eq!(child.call_stack_fns, ["probe", "child_only"]);
    }
}
