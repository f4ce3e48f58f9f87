//! CLI binary for the PathSteer scheduler.
//!
//! Replays scheduling scenarios from a JSON script without a live
//! execution engine attached, and inspects basic-block listings.
//!
//! # Usage
//!
//! ```bash
//! # Replay a scheduling scenario
//! pathsteer-sched simulate --script scenario.json
//!
//! # Replay against real block listings, saving artifacts
//! pathsteer-sched simulate --script scenario.json --covdb covdb/ \
//!     --trace-out trace.json --coverage-out coverage.json
//!
//! # Inspect one module's block listing
//! pathsteer-sched covdb --dir covdb/ --module mydriver.ko
//! ```
//!
//! # Script Format
//!
//! A scenario declares the module layout and a step sequence:
//!
//! ```json
//! {
//!   "modules": [{ "name": "mydriver.ko", "base": 4096, "primary": true }],
//!   "steps": [
//!     { "kind": "add_state", "state": 1, "pc": 4112 },
//!     { "kind": "annotate", "state": 1, "op": "prioritize", "line": 10 },
//!     { "kind": "select" }
//!   ]
//! }
//! ```
//!
//! Annotation steps name their operation the way [`AnnotationOp`] spells
//! it ("prioritize", "loop-body", "enable-trackperf", ...). Without a
//! `--covdb` directory the module layout is ignored and every state's
//! coverage metric stays invalid, which still exercises the priority
//! machinery.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use pathsteer_protocol::{
    encode_name, AnnotationOp, AnnotationPage, OP_RANGE_FIRST, OP_RANGE_LAST,
};
use pathsteer_sched::covdb::DEFAULT_GAP_MARKER;
use pathsteer_sched::report::{coverage_summary, format_coverage_summary};
use pathsteer_sched::{
    ExecutionHost, HostCtx, LoadedModule, ModuleMap, Scheduler, SchedulerConfig, StateId,
};
use pathsteer_trace::records::AccessKind;
use pathsteer_trace::sink::{MemorySink, TraceLog};

#[derive(Parser)]
#[command(name = "pathsteer-sched")]
#[command(about = "Priority-driven state scheduling for PathSteer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scheduling scenario from a JSON script.
    Simulate {
        /// Path to the scenario script (JSON).
        #[arg(short, long)]
        script: String,

        /// Directory holding per-module block listings.
        #[arg(short, long)]
        covdb: Option<String>,

        /// Random seed for reproducibility.
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Hard cap on live states.
        #[arg(long, default_value = "100")]
        max_states: usize,

        /// Log each state's I/O tag map when it is forgotten.
        #[arg(long)]
        dump_io_map: bool,

        /// Save the collected trace records here (JSON).
        #[arg(long)]
        trace_out: Option<String>,

        /// Save the block coverage summary here (JSON).
        #[arg(long)]
        coverage_out: Option<String>,
    },

    /// Inspect a basic-block listing.
    Covdb {
        /// Directory holding per-module block listings.
        #[arg(short, long)]
        dir: String,

        /// Module name (the listing is {dir}/{module}.bblist).
        #[arg(short, long)]
        module: String,

        /// Marker naming untracked gaps in the listing.
        #[arg(long, default_value = DEFAULT_GAP_MARKER)]
        gap_marker: String,
    },
}

#[derive(Debug, Deserialize)]
struct Script {
    #[serde(default)]
    modules: Vec<ScriptModule>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct ScriptModule {
    name: String,
    base: u64,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Step {
    AddState {
        state: u64,
        pc: u64,
    },
    RemoveState {
        state: u64,
    },
    Fork {
        parent: u64,
        children: Vec<u64>,
    },
    Annotate {
        state: u64,
        op: String,
        #[serde(default)]
        line: u32,
        #[serde(default)]
        args: Vec<i64>,
        #[serde(default)]
        name: Option<String>,
    },
    BlockBoundary {
        state: u64,
        block: u64,
        next: u64,
    },
    BlockStart {
        state: u64,
        pc: u64,
    },
    Instruction {
        state: u64,
        pc: u64,
    },
    Access {
        state: u64,
        access: String,
        #[serde(default)]
        write: bool,
        #[serde(default)]
        virt: Option<u64>,
        #[serde(default)]
        value: Option<u64>,
        #[serde(default = "default_access_size")]
        size: u8,
    },
    IoTag {
        state: u64,
        tag: String,
    },
    Tick {
        #[serde(default = "default_tick_count")]
        count: u64,
    },
    Select,
}

fn default_access_size() -> u8 {
    4
}

fn default_tick_count() -> u64 {
    1
}

/// Records engine calls instead of driving a real engine.
struct ScriptHost {
    terminated: usize,
    reschedules: usize,
}

impl ScriptHost {
    fn new() -> Self {
        Self {
            terminated: 0,
            reschedules: 0,
        }
    }
}

impl ExecutionHost for ScriptHost {
    fn terminate_state(&mut self, id: StateId, reason: &str) {
        println!("[engine] terminate state {id}: {reason}");
        self.terminated += 1;
    }

    fn concretize_all(&mut self, id: StateId) {
        println!("[engine] concretize all symbolic data in state {id}");
    }

    fn request_reschedule(&mut self) {
        self.reschedules += 1;
    }

    fn set_memory_tracing(&mut self, enabled: bool) {
        println!(
            "[engine] memory tracing {}",
            if enabled { "on" } else { "off" }
        );
    }

    fn cost_weight(&self, _id: StateId) -> u64 {
        1
    }

    fn physical_address(&self, _id: StateId, virt: u64) -> u64 {
        virt
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            script,
            covdb,
            seed,
            max_states,
            dump_io_map,
            trace_out,
            coverage_out,
        } => cmd_simulate(
            script,
            covdb,
            seed,
            max_states,
            dump_io_map,
            trace_out,
            coverage_out,
        ),
        Commands::Covdb {
            dir,
            module,
            gap_marker,
        } => cmd_covdb(dir, module, gap_marker),
    }
}

fn cmd_simulate(
    script: String,
    covdb: Option<String>,
    seed: u64,
    max_states: usize,
    dump_io_map: bool,
    trace_out: Option<String>,
    coverage_out: Option<String>,
) {
    // Validate inputs
    if !Path::new(&script).exists() {
        eprintln!("Error: script file not found: {}", script);
        std::process::exit(1);
    }

    let text = match fs::read_to_string(&script) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error: failed to read script: {}", e);
            std::process::exit(1);
        }
    };

    let scenario: Script = match serde_json::from_str(&text) {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("Error: failed to parse script: {}", e);
            std::process::exit(1);
        }
    };

    // Load the module layout when block listings are available
    let mut modules = ModuleMap::new();
    if let Some(ref dir) = covdb {
        let dir_path = Path::new(dir);
        if !dir_path.is_dir() {
            eprintln!("Error: covdb directory not found: {}", dir);
            std::process::exit(1);
        }
        for entry in &scenario.modules {
            match LoadedModule::load(dir_path, &entry.name, DEFAULT_GAP_MARKER) {
                Ok(module) => modules.insert(module, entry.base, entry.primary),
                Err(e) => {
                    eprintln!("Error: failed to load module {}: {}", entry.name, e);
                    std::process::exit(1);
                }
            }
        }
    }

    eprintln!("═══════════════════════════════════════════════════════════════════════");
    eprintln!("  PathSteer Scheduling Simulation");
    eprintln!("═══════════════════════════════════════════════════════════════════════");
    eprintln!();
    eprintln!("Configuration:");
    eprintln!("  Script:         {}", script);
    eprintln!("  Steps:          {}", scenario.steps.len());
    eprintln!("  Seed:           {}", seed);
    eprintln!("  Max states:     {}", max_states);
    if let Some(ref dir) = covdb {
        eprintln!("  Covdb:          {}", dir);
    }
    eprintln!("  Modules:        {}", modules.len());
    if dump_io_map {
        eprintln!("  Dump io maps:   yes");
    }
    if let Some(ref path) = trace_out {
        eprintln!("  Trace out:      {}", path);
    }
    if let Some(ref path) = coverage_out {
        eprintln!("  Coverage out:   {}", path);
    }
    eprintln!();
    eprintln!("Running simulation...");
    eprintln!();

    let mut sched = Scheduler::new(SchedulerConfig {
        seed,
        max_states,
        dump_io_map,
        ..Default::default()
    });
    let mut host = ScriptHost::new();
    let mut sink = MemorySink::new();

    for (index, step) in scenario.steps.iter().enumerate() {
        if let Err(e) = run_step(&mut sched, &mut host, &modules, &mut sink, step) {
            eprintln!("Error: step {}: {}", index + 1, e);
            std::process::exit(1);
        }
    }

    eprintln!();
    eprintln!(
        "Simulation complete: {} steps, {} states live, {} terminations, \
         {} reschedule requests",
        scenario.steps.len(),
        sched.num_states(),
        host.terminated,
        host.reschedules
    );
    eprintln!();

    println!("Final states (best first):");
    for id in sched.states() {
        if let Some(ann) = sched.annotation(id) {
            println!(
                "  [State {id}] priority {} metric {}{} success {}",
                ann.priority_change,
                ann.metric,
                if ann.metric_valid { "" } else { " (invalid)" },
                ann.success_path
            );
        }
    }
    println!();
    let summary = coverage_summary(sched.block_coverage());
    println!("{}", format_coverage_summary(&summary));

    // Trace summary and artifacts
    let session = Path::new(&script)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("simulation");
    let log = TraceLog::new(session, sink.drain());
    let mut counts: Vec<(String, usize)> = log.summary().into_iter().collect();
    counts.sort();
    eprintln!("Trace records: {}", log.len());
    for (kind, count) in counts {
        eprintln!("  {}: {}", kind, count);
    }

    if let Some(path) = trace_out {
        if let Err(e) = log.save(&path) {
            eprintln!("Warning: failed to save trace: {}", e);
        } else {
            eprintln!("Saved trace to: {}", path);
        }
    }

    if let Some(path) = coverage_out {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    eprintln!("Warning: failed to save coverage summary: {}", e);
                } else {
                    eprintln!("Saved coverage summary to: {}", path);
                }
            }
            Err(e) => eprintln!("Warning: failed to encode coverage summary: {}", e),
        }
    }
}

fn run_step(
    sched: &mut Scheduler,
    host: &mut ScriptHost,
    modules: &ModuleMap,
    sink: &mut MemorySink,
    step: &Step,
) -> Result<(), String> {
    let mut ctx = HostCtx {
        engine: host,
        resolver: modules,
        trace: sink,
    };
    match step {
        Step::AddState { state, pc } => {
            sched.on_states_updated(&[(StateId(*state), *pc)], &[], &mut ctx);
        }
        Step::RemoveState { state } => {
            sched.on_states_updated(&[], &[StateId(*state)], &mut ctx);
        }
        Step::Fork { parent, children } => {
            let children: Vec<StateId> = children.iter().copied().map(StateId).collect();
            sched
                .on_fork(StateId(*parent), &children, &mut ctx)
                .map_err(|e| e.to_string())?;
        }
        Step::Annotate {
            state,
            op,
            line,
            args,
            name,
        } => {
            let Some(op) = parse_op(op) else {
                return Err(format!("unknown annotation name {op:?}"));
            };
            if args.len() > 3 {
                return Err(format!("{} takes at most 3 arguments", op.name()));
            }
            let Some(page) = build_page(op, *line, args, name.as_deref()) else {
                return Err(format!("function name too long for {}", op.name()));
            };
            sched
                .handle_annotation(StateId(*state), &page, &mut ctx)
                .map_err(|e| e.to_string())?;
        }
        Step::BlockBoundary { state, block, next } => {
            sched.on_block_boundary(StateId(*state), *block, *next, &mut ctx);
        }
        Step::BlockStart { state, pc } => {
            sched.on_block_start(StateId(*state), *pc, &mut ctx);
        }
        Step::Instruction { state, pc } => {
            sched.on_instruction(StateId(*state), *pc, &mut ctx);
        }
        Step::Access {
            state,
            access,
            write,
            virt,
            value,
            size,
        } => {
            let kind = parse_access(access)?;
            sched
                .on_memory_access(StateId(*state), kind, *write, *virt, *value, *size, &mut ctx)
                .map_err(|e| e.to_string())?;
        }
        Step::IoTag { state, tag } => {
            sched.on_io_tag(StateId(*state), tag);
        }
        Step::Tick { count } => {
            for _ in 0..*count {
                sched.on_timer_tick();
            }
        }
        Step::Select => {
            let id = sched.select_next().map_err(|e| e.to_string())?;
            println!("[select] state {id}");
        }
    }
    Ok(())
}

/// Map a kebab-case annotation name back to its opcode.
fn parse_op(name: &str) -> Option<AnnotationOp> {
    (OP_RANGE_FIRST..=OP_RANGE_LAST)
        .filter_map(AnnotationOp::from_code)
        .find(|op| op.name() == name)
}

fn parse_access(name: &str) -> Result<AccessKind, String> {
    match name {
        "port" | "pio" => Ok(AccessKind::Port),
        "mmio" => Ok(AccessKind::Mmio),
        "dma" => Ok(AccessKind::Dma),
        other => Err(format!(
            "unknown access kind {other:?}, use port, mmio, or dma"
        )),
    }
}

fn build_page(
    op: AnnotationOp,
    line: u32,
    args: &[i64],
    name: Option<&str>,
) -> Option<AnnotationPage> {
    let mut page = AnnotationPage::zeroed();
    page.op = op as u8;
    page.line = line;
    for (idx, &value) in args.iter().enumerate() {
        page.set_arg(idx, value);
    }
    if let Some(name) = name {
        let written = encode_name(&mut page.payload, name)?;
        page.payload_len = written as u16;
    }
    Some(page)
}

fn cmd_covdb(dir: String, module: String, gap_marker: String) {
    if !Path::new(&dir).is_dir() {
        eprintln!("Error: covdb directory not found: {}", dir);
        std::process::exit(1);
    }

    let loaded = match LoadedModule::load(Path::new(&dir), &module, &gap_marker) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("═══════════════════════════════════════════════════════════════════════");
    println!("  BLOCK LISTING: {}", loaded.name());
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("Blocks:                 {}", loaded.num_blocks());
    println!("Functions:              {}", loaded.num_functions());
    println!(
        "Gaps:                   {} ({} bytes)",
        loaded.num_gaps(),
        loaded.bytes_in_gaps()
    );
    println!("Bytes listed:           {}", loaded.bytes_total());
    println!("Extent:                 {:#x}", loaded.extent());
    println!();
    println!("Per function block counts:");
    let mut functions: Vec<(&str, u64)> = loaded.functions().collect();
    functions.sort();
    for (function, blocks) in functions {
        println!("  {:<32} {:>6}", function, blocks);
    }
}
