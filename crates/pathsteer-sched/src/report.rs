//! Format scheduler dumps and coverage reports.

use serde::Serialize;

use crate::annotation::{PerfKind, StateAnnotation, StateId};
use crate::coverage::BlockCoverage;

const SNAPSHOT_RULE: &str =
    "==================================================";

/// Format the priority snapshot logged when selection moves to a new
/// state: the invoker's call stack, then one line per registered state
/// in rank order.
pub fn format_priority_snapshot(
    invoker_stack: &str,
    states: &[(StateId, &StateAnnotation)],
) -> String {
    let mut output = String::new();
    output.push_str(SNAPSHOT_RULE);
    output.push('\n');
    output.push_str(invoker_stack);
    output.push('\n');
    for (id, ann) in states {
        output.push_str(&format!(
            "[State {id}] pChg:{} met:{}{} sPth:{} cDep:{} IP:{:#x} \
             BB:{} I:{} PR:{} PW:{} MR:{} MW:{} DR:{} DW:{}\n",
            ann.priority_change,
            ann.metric,
            if ann.metric_valid { 't' } else { 'f' },
            ann.success_path,
            ann.driver_call_stack,
            ann.last_pc,
            ann.perf.get(PerfKind::Block),
            ann.perf.get(PerfKind::Instruction),
            ann.perf.get(PerfKind::PortRead),
            ann.perf.get(PerfKind::PortWrite),
            ann.perf.get(PerfKind::MmioRead),
            ann.perf.get(PerfKind::MmioWrite),
            ann.perf.get(PerfKind::DmaRead),
            ann.perf.get(PerfKind::DmaWrite),
        ));
    }
    output.push_str(SNAPSHOT_RULE);
    output.push('\n');
    output
}

/// Format the stored per-span counter history, one line per state and
/// counter kind. States with no stored spans for a kind are skipped.
/// The caller chooses the state order.
pub fn format_perf_history(states: &[(StateId, &StateAnnotation)]) -> String {
    let mut output = String::new();
    for kind in PerfKind::ALL {
        for (id, ann) in states {
            let history = ann.perf.history(kind);
            if history.is_empty() {
                continue;
            }
            let joined = history
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            output.push_str(&format!("State {id} {kind} {joined}\n"));
        }
    }
    output
}

/// Format a state's I/O tag map, one numbered line per tag.
pub fn format_io_map(id: StateId, ann: &StateAnnotation) -> String {
    let mut output = String::new();
    output.push_str(&format!("[State {id}] io map, {} tags:\n", ann.io_map.len()));
    for (counter, (tag, stack)) in ann.io_map.iter().enumerate() {
        output.push_str(&format!("{}, tag: {tag} --> {stack}\n", counter + 1));
    }
    output
}

/// Format a state's open span stack, innermost last.
pub fn format_span_stack(id: StateId, ann: &StateAnnotation) -> String {
    let names: Vec<&str> = ann.span_stack.iter().map(|code| code.name()).collect();
    format!("State {id} {}", names.join(", "))
}

/// Per-function block coverage, serializable for the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCoverage {
    pub function: String,
    pub total_blocks: i64,
    pub touched_blocks: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageSummary {
    pub functions: Vec<FunctionCoverage>,
    pub fully_covered: usize,
    pub untouched: usize,
}

/// Summarize block coverage across all annotated functions.
pub fn coverage_summary(coverage: &BlockCoverage) -> CoverageSummary {
    let mut functions = Vec::new();
    let mut fully_covered = 0;
    let mut untouched = 0;
    for (name, record) in coverage.iter() {
        let touched = record.touched.len();
        if touched == 0 {
            untouched += 1;
        }
        if record.total_blocks > 0 && touched as i64 >= record.total_blocks {
            fully_covered += 1;
        }
        functions.push(FunctionCoverage {
            function: name.to_string(),
            total_blocks: record.total_blocks,
            touched_blocks: touched,
            percent: record.percent(),
        });
    }
    CoverageSummary {
        functions,
        fully_covered,
        untouched,
    }
}

/// Format a coverage summary for human consumption.
pub fn format_coverage_summary(summary: &CoverageSummary) -> String {
    let mut output = String::new();

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");
    output.push_str("  BLOCK COVERAGE REPORT\n");
    output.push_str("═══════════════════════════════════════════════════════════════════════\n\n");

    output.push_str(&format!(
        "Functions annotated:    {}\n",
        summary.functions.len()
    ));
    output.push_str(&format!(
        "Fully covered:          {}\n",
        summary.fully_covered
    ));
    output.push_str(&format!("Untouched:              {}\n", summary.untouched));
    output.push_str("\n");

    if !summary.functions.is_empty() {
        output.push_str("─── Per Function ──────────────────────────────────────────────────────\n");
        for fc in &summary.functions {
            output.push_str(&format!(
                "{:<32} {:>4}/{:<4} {:>6.1}%\n",
                fc.function, fc.touched_blocks, fc.total_blocks, fc.percent
            ));
        }
        output.push('\n');
    }

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");

    output
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use pathsteer_protocol::SpanCode;

    #[test]
    fn test_priority_snapshot_lines() {
        let mut a = StateAnnotation::new();
        a.priority_change = 1000;
        a.metric = 5;
        a.success_path = 2;
        a.driver_call_stack = 1;
        a.last_pc = 0x1234;
        a.perf.bump(PerfKind::Block);
        a.perf.bump(PerfKind::Block);
        let mut b = StateAnnotation::new();
        b.metric_valid = false;

        let states = [(StateId(1), &a), (StateId(2), &b)];
        let formatted = format_priority_snapshot("probe:10 -> ", &states);
        assert!(formatted.starts_with(&"=".repeat(50)));
        assert!(formatted.contains("probe:10 -> "));
        assert!(formatted.contains(
            "[State 1] pChg:1000 met:5t sPth:2 cDep:1 IP:0x1234 BB:2 I:0"
        ));
        assert!(formatted.contains("[State 2] pChg:0 met:0f"));
        assert!(formatted.ends_with(&format!("{}\n", "=".repeat(50))));
    }

    #[test]
    fn test_perf_history_skips_empty_kinds() {
        let mut ann = StateAnnotation::new();
        ann.perf.bump(PerfKind::Block);
        ann.perf.store();
        ann.perf.reset_current();
        ann.perf.bump(PerfKind::Block);
        ann.perf.bump(PerfKind::Block);
        ann.perf.store();

        let states = [(StateId(7), &ann)];
        let formatted = format_perf_history(&states);
        assert!(formatted.contains("State 7 BB 1, 2"));
        // Kinds that never counted produce no line.
        assert!(!formatted.contains("INST"));
        assert!(!formatted.contains("PIO_Read"));
    }

    #[test]
    fn test_io_map_numbering() {
        let mut ann = StateAnnotation::new();
        ann.io_map
            .insert("port_0x3f8".to_string(), "probe:10 -> ".to_string());
        ann.io_map
            .insert("mmio_bar0".to_string(), "reset:44 -> ".to_string());

        let formatted = format_io_map(StateId(3), &ann);
        assert!(formatted.contains("[State 3] io map, 2 tags:"));
        // BTreeMap order: mmio before port.
        assert!(formatted.contains("1, tag: mmio_bar0 --> reset:44 -> "));
        assert!(formatted.contains("2, tag: port_0x3f8 --> probe:10 -> "));
    }

    #[test]
    fn test_span_stack_names() {
        let mut ann = StateAnnotation::new();
        ann.span_stack.push(SpanCode::StartAuto);
        ann.span_stack.push(SpanCode::PauseProbe);
        assert_eq!(
            format_span_stack(StateId(3), &ann),
            "State 3 start-auto, pause-probe"
        );
        assert_eq!(format_span_stack(StateId(4), &StateAnnotation::new()), "State 4 ");
    }

    #[test]
    fn test_coverage_summary_and_format() {
        let mut coverage = BlockCoverage::new();
        coverage.record("probe", 4, 0);
        coverage.record("probe", 4, 1);
        coverage.record("reset", 1, 0);

        let summary = coverage_summary(&coverage);
        assert_eq!(summary.functions.len(), 2);
        assert_eq!(summary.fully_covered, 1);
        assert_eq!(summary.untouched, 0);

        let formatted = format_coverage_summary(&summary);
        assert!(formatted.contains("BLOCK COVERAGE REPORT"));
        assert!(formatted.contains("Functions annotated:    2"));
        assert!(formatted.contains("Fully covered:          1"));
        assert!(formatted.contains("─── Per Function ───"));
        assert!(formatted.contains("2/4"));
        assert!(formatted.contains("50.0%"));
        assert!(formatted.contains("100.0%"));
    }

    #[test]
    fn test_coverage_summary_serializes() {
        let mut coverage = BlockCoverage::new();
        coverage.record("probe", 2, 0);
        let summary = coverage_summary(&coverage);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"function\":\"probe\""));
        assert!(json.contains("\"fully_covered\":0"));
    }
}
