//! Annotation vocabulary shared between instrumented programs and the
//! pathsteer scheduler.
//!
//! This crate defines the operation codes, span codes, flag values, and the
//! [`AnnotationPage`] layout used to deliver scheduling hints from an
//! instrumented program to the host-side scheduler.  It is
//! `no_std`-compatible with zero dependencies.
//!
//! # Transport
//!
//! An annotation is a call compiled into the analyzed program.  When the
//! execution engine traps one, it fills an [`AnnotationPage`]:
//!
//! 1. The operation code (one of `OP_*`) and the call-site line
//! 2. Up to three integer arguments, with a validity bit per argument —
//!    an argument whose concrete value the engine could not resolve is
//!    delivered with its bit clear
//! 3. An optional string payload (function or module name)
//!
//! The scheduler dispatches on the operation code and never acknowledges;
//! results flow back to the program only through scheduling behavior.

#![cfg_attr(not(feature = "std"), no_std)]

// ═══════════════════════════════════════════════════════════════════════
//  Operation codes
// ═══════════════════════════════════════════════════════════════════════
//
// The code space 0xB3..=0xCB is carved out of the engine's
// custom-instruction range.  Holes (0xBD, 0xBF, 0xC4) belong to other
// subsystems and are never dispatched here.

/// Raise the invoking state's priority by the standard boost.
pub const OP_PRIORITIZE: u8 = 0xB3;
/// Lower the invoking state's priority; argument 0 selects the directive
/// (see [`DeprioritizeDirective`]).
pub const OP_DEPRIORITIZE: u8 = 0xB4;
/// Mark entry into an instrumented loop.  Argument 0 = loop call-site id.
pub const OP_LOOP_BEFORE: u8 = 0xB5;
/// Mark one iteration of an instrumented loop.  Argument 0 = call-site id.
pub const OP_LOOP_BODY: u8 = 0xB6;
/// Mark exit from an instrumented loop.  Argument 0 = call-site id.
pub const OP_LOOP_AFTER: u8 = 0xB7;
/// Concretize the invoking state and kill all others (unless inside a
/// tracked call stack).
pub const OP_CONCRETIZE_KILL: u8 = 0xB8;
/// Concretize the invoking state's address space.
pub const OP_CONCRETIZE_ALL: u8 = 0xB9;
/// Terminate every registered state except the invoker.
pub const OP_KILL_ALL_OTHERS: u8 = 0xBA;
/// Report the tracked call-stack depth.  Argument 0 = depth.
pub const OP_DRIVER_CALL_STACK: u8 = 0xBB;
/// Toggle the favor-successful selection policy.  Argument 0 = flag.
pub const OP_FAVOR_SUCCESSFUL: u8 = 0xBC;
/// Zero every state's priority bonus and loop markers.
pub const OP_RESET_PRIORITIES: u8 = 0xBE;
/// Connect the memory-access trace subscription.
pub const OP_ENABLE_TRACING: u8 = 0xC0;
/// Disconnect the memory-access trace subscription.
pub const OP_DISABLE_TRACING: u8 = 0xC1;
/// Push a function onto the invoking state's call stack.  Argument 0 =
/// wrapper kind ([`FN_KIND_STUB_WRAPPER`] inverts push/pop); payload = name.
pub const OP_ENTER_FUNCTION: u8 = 0xC2;
/// Pop a function from the invoking state's call stack.  Same arguments
/// as [`OP_ENTER_FUNCTION`].
pub const OP_EXIT_FUNCTION: u8 = 0xC3;
/// Adjust the success-path counter.  Argument 0 = delta in -1..=1;
/// payload = reporting function name.
pub const OP_SUCCESS_PATH: u8 = 0xC5;
/// Record a touched basic block.  Argument 0 = total blocks in the
/// function, argument 1 = block index; payload = function name.
pub const OP_ENTER_BLOCK: u8 = 0xC6;
/// Register a function of interest for selection.  Payload = name.
pub const OP_PRIMARY_FN: u8 = 0xC7;
/// Start or resume a performance-tracking span, or set the IRQ tracking
/// mode.  Argument 0 = span code or [`IrqTrackMode`] value.
pub const OP_ENABLE_TRACKPERF: u8 = 0xC8;
/// Pause, stop, or discard a performance-tracking span.  Argument 0 =
/// span code.
pub const OP_DISABLE_TRACKPERF: u8 = 0xC9;
/// Register a function for performance attribution.  Argument 0 =
/// [`TrackedFnKind`] value; payload = name.
pub const OP_TRACKPERF_FN: u8 = 0xCA;
/// Record an I/O region map/unmap.  Argument 0 = [`IoRegionKind`] value,
/// argument 1 = address, argument 2 = size.
pub const OP_IO_REGION: u8 = 0xCB;

/// First operation code in the annotation range.
pub const OP_RANGE_FIRST: u8 = 0xB3;
/// Last operation code in the annotation range.
pub const OP_RANGE_LAST: u8 = 0xCB;

/// Annotation operation, decoded from an `OP_*` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AnnotationOp {
    Prioritize = OP_PRIORITIZE,
    Deprioritize = OP_DEPRIORITIZE,
    LoopBefore = OP_LOOP_BEFORE,
    LoopBody = OP_LOOP_BODY,
    LoopAfter = OP_LOOP_AFTER,
    ConcretizeKill = OP_CONCRETIZE_KILL,
    ConcretizeAll = OP_CONCRETIZE_ALL,
    KillAllOthers = OP_KILL_ALL_OTHERS,
    DriverCallStack = OP_DRIVER_CALL_STACK,
    FavorSuccessful = OP_FAVOR_SUCCESSFUL,
    ResetPriorities = OP_RESET_PRIORITIES,
    EnableTracing = OP_ENABLE_TRACING,
    DisableTracing = OP_DISABLE_TRACING,
    EnterFunction = OP_ENTER_FUNCTION,
    ExitFunction = OP_EXIT_FUNCTION,
    SuccessPath = OP_SUCCESS_PATH,
    EnterBlock = OP_ENTER_BLOCK,
    PrimaryFn = OP_PRIMARY_FN,
    EnableTrackperf = OP_ENABLE_TRACKPERF,
    DisableTrackperf = OP_DISABLE_TRACKPERF,
    TrackperfFn = OP_TRACKPERF_FN,
    IoRegion = OP_IO_REGION,
}

impl AnnotationOp {
    /// Decode an operation code, `None` for holes and out-of-range values.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            OP_PRIORITIZE => Self::Prioritize,
            OP_DEPRIORITIZE => Self::Deprioritize,
            OP_LOOP_BEFORE => Self::LoopBefore,
            OP_LOOP_BODY => Self::LoopBody,
            OP_LOOP_AFTER => Self::LoopAfter,
            OP_CONCRETIZE_KILL => Self::ConcretizeKill,
            OP_CONCRETIZE_ALL => Self::ConcretizeAll,
            OP_KILL_ALL_OTHERS => Self::KillAllOthers,
            OP_DRIVER_CALL_STACK => Self::DriverCallStack,
            OP_FAVOR_SUCCESSFUL => Self::FavorSuccessful,
            OP_RESET_PRIORITIES => Self::ResetPriorities,
            OP_ENABLE_TRACING => Self::EnableTracing,
            OP_DISABLE_TRACING => Self::DisableTracing,
            OP_ENTER_FUNCTION => Self::EnterFunction,
            OP_EXIT_FUNCTION => Self::ExitFunction,
            OP_SUCCESS_PATH => Self::SuccessPath,
            OP_ENTER_BLOCK => Self::EnterBlock,
            OP_PRIMARY_FN => Self::PrimaryFn,
            OP_ENABLE_TRACKPERF => Self::EnableTrackperf,
            OP_DISABLE_TRACKPERF => Self::DisableTrackperf,
            OP_TRACKPERF_FN => Self::TrackperfFn,
            OP_IO_REGION => Self::IoRegion,
            _ => return None,
        })
    }

    /// Human-readable operation name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Prioritize => "prioritize",
            Self::Deprioritize => "deprioritize",
            Self::LoopBefore => "loop-before",
            Self::LoopBody => "loop-body",
            Self::LoopAfter => "loop-after",
            Self::ConcretizeKill => "concretize-kill",
            Self::ConcretizeAll => "concretize-all",
            Self::KillAllOthers => "kill-all-others",
            Self::DriverCallStack => "driver-call-stack",
            Self::FavorSuccessful => "favor-successful",
            Self::ResetPriorities => "reset-priorities",
            Self::EnableTracing => "enable-tracing",
            Self::DisableTracing => "disable-tracing",
            Self::EnterFunction => "enter-function",
            Self::ExitFunction => "exit-function",
            Self::SuccessPath => "success-path",
            Self::EnterBlock => "enter-block",
            Self::PrimaryFn => "primary-fn",
            Self::EnableTrackperf => "enable-trackperf",
            Self::DisableTrackperf => "disable-trackperf",
            Self::TrackperfFn => "trackperf-fn",
            Self::IoRegion => "io-region",
        }
    }
}

impl core::fmt::Display for AnnotationOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Annotation page layout
// ═══════════════════════════════════════════════════════════════════════

/// Size of the annotation page in bytes.
pub const ANNOTATION_PAGE_SIZE: usize = 4096;

/// Offset of the payload area within the annotation page.
pub const PAYLOAD_OFFSET: usize = 40;

/// Maximum payload size in bytes.
pub const PAYLOAD_MAX: usize = ANNOTATION_PAGE_SIZE - PAYLOAD_OFFSET;

/// Validity bit for argument 0.
pub const ARG0_VALID: u8 = 1 << 0;
/// Validity bit for argument 1.
pub const ARG1_VALID: u8 = 1 << 1;
/// Validity bit for argument 2.
pub const ARG2_VALID: u8 = 1 << 2;

/// Fixed-layout annotation call delivered by the execution engine.
///
/// The engine fills request fields from the trapped call; the scheduler
/// only reads.  An argument whose validity bit is clear could not be
/// resolved to a concrete value (it was symbolic at the call site).
///
/// Total size: 4096 bytes (one page).
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    1     op
/// 0x01    1     arg_flags     ← ARG*_VALID bits
/// 0x02    2     (reserved)
/// 0x04    4     line          ← call-site line
/// 0x08    24    args[3]
/// 0x20    2     payload_len
/// 0x22    6     (reserved)
/// 0x28    4056  payload       ← length-prefixed name string
/// ```
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct AnnotationPage {
    /// Operation code (one of `OP_*`).
    pub op: u8,
    /// Argument validity bits (`ARG*_VALID`).
    pub arg_flags: u8,
    pub _reserved0: [u8; 2],
    /// Call-site line in the instrumented source.
    pub line: u32,
    /// Integer arguments; meaning depends on `op`.
    pub args: [i64; 3],
    /// Length of the payload in bytes.
    pub payload_len: u16,
    pub _reserved1: [u8; 6],
    /// Variable-length payload (function or module name).
    pub payload: [u8; PAYLOAD_MAX],
}

// Compile-time size check.
const _: () = assert!(core::mem::size_of::<AnnotationPage>() == ANNOTATION_PAGE_SIZE);

impl AnnotationPage {
    /// Create a zeroed annotation page.
    pub const fn zeroed() -> Self {
        Self {
            op: 0,
            arg_flags: 0,
            _reserved0: [0; 2],
            line: 0,
            args: [0; 3],
            payload_len: 0,
            _reserved1: [0; 6],
            payload: [0; PAYLOAD_MAX],
        }
    }

    /// Read argument `idx`, `None` if its validity bit is clear.
    pub const fn arg(&self, idx: usize) -> Option<i64> {
        if idx >= 3 || self.arg_flags & (1 << idx) == 0 {
            return None;
        }
        Some(self.args[idx])
    }

    /// Set argument `idx` and mark it valid.
    pub fn set_arg(&mut self, idx: usize, value: i64) {
        if idx < 3 {
            self.args[idx] = value;
            self.arg_flags |= 1 << idx;
        }
    }

    /// Clear argument `idx`'s validity bit (unresolvable argument).
    pub fn clear_arg(&mut self, idx: usize) {
        if idx < 3 {
            self.arg_flags &= !(1 << idx);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Deprioritize directives
// ═══════════════════════════════════════════════════════════════════════

/// How a deprioritize operation should apply its penalty.
///
/// The wire encoding is a sign convention on argument 0: negative selects
/// force-reschedule (the magnitude is the call-site line, informational),
/// zero selects the minimal penalty, and a positive value selects a
/// decaying penalty keyed by that call-site id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeprioritizeDirective {
    /// Drop strictly below every other state and request a reschedule.
    ForceReschedule,
    /// Force the priority bonus to the standard negative boost.
    Minimal,
    /// Penalize with a per-call-site budget that runs out.
    Decaying { site: i64 },
}

impl DeprioritizeDirective {
    /// Decode the sign convention.
    pub const fn from_raw(v: i64) -> Self {
        if v < 0 {
            Self::ForceReschedule
        } else if v == 0 {
            Self::Minimal
        } else {
            Self::Decaying { site: v }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Performance-tracking span codes
// ═══════════════════════════════════════════════════════════════════════

/// Span bracket codes pushed/popped on a state's trackperf stack.
///
/// `Start*` and `Pause*` codes push; `Continue*`, `Stop*`, and `Discard*`
/// codes pop their [`resume_target`](Self::resume_target) counterpart.
/// `StartFn`/`StopFn` never sit on the stack themselves; they tag
/// tracked-function recomputation and the trace events it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SpanCode {
    PauseProbe = 11,
    ContinueProbe = 12,
    PauseStub = 21,
    ContinueStub = 22,
    PauseIrq = 31,
    ContinueIrq = 32,
    StartAuto = 40,
    PauseAuto = 41,
    ContinueAuto = 42,
    StopAuto = 43,
    DiscardAuto = 44,
    StartManual = 50,
    PauseManual = 51,
    ContinueManual = 52,
    StopManual = 53,
    DiscardManual = 54,
    StartFn = 60,
    StopFn = 61,
}

impl SpanCode {
    /// Decode a raw span code.
    pub const fn from_raw(v: i64) -> Option<Self> {
        Some(match v {
            11 => Self::PauseProbe,
            12 => Self::ContinueProbe,
            21 => Self::PauseStub,
            22 => Self::ContinueStub,
            31 => Self::PauseIrq,
            32 => Self::ContinueIrq,
            40 => Self::StartAuto,
            41 => Self::PauseAuto,
            42 => Self::ContinueAuto,
            43 => Self::StopAuto,
            44 => Self::DiscardAuto,
            50 => Self::StartManual,
            51 => Self::PauseManual,
            52 => Self::ContinueManual,
            53 => Self::StopManual,
            54 => Self::DiscardManual,
            60 => Self::StartFn,
            61 => Self::StopFn,
            _ => return None,
        })
    }

    /// The code this pop must find on the span stack, `None` for codes
    /// that push or do not touch the stack.
    pub const fn resume_target(&self) -> Option<Self> {
        Some(match self {
            Self::ContinueProbe => Self::PauseProbe,
            Self::ContinueStub => Self::PauseStub,
            Self::ContinueIrq => Self::PauseIrq,
            Self::ContinueAuto => Self::PauseAuto,
            Self::ContinueManual => Self::PauseManual,
            Self::StopAuto | Self::DiscardAuto => Self::StartAuto,
            Self::StopManual | Self::DiscardManual => Self::StartManual,
            _ => return None,
        })
    }

    /// Human-readable span code name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PauseProbe => "pause-probe",
            Self::ContinueProbe => "continue-probe",
            Self::PauseStub => "pause-stub",
            Self::ContinueStub => "continue-stub",
            Self::PauseIrq => "pause-irq",
            Self::ContinueIrq => "continue-irq",
            Self::StartAuto => "start-auto",
            Self::PauseAuto => "pause-auto",
            Self::ContinueAuto => "continue-auto",
            Self::StopAuto => "stop-auto",
            Self::DiscardAuto => "discard-auto",
            Self::StartManual => "start-manual",
            Self::PauseManual => "pause-manual",
            Self::ContinueManual => "continue-manual",
            Self::StopManual => "stop-manual",
            Self::DiscardManual => "discard-manual",
            Self::StartFn => "start-fn",
            Self::StopFn => "stop-fn",
        }
    }
}

impl core::fmt::Display for SpanCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// IRQ attribution mode, set through [`OP_ENABLE_TRACKPERF`].
///
/// The value range is disjoint from [`SpanCode`] so both can travel in
/// the same argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IrqTrackMode {
    /// Never attribute work performed inside an interrupt handler.
    None = 1000,
    /// Attribute handler work only when a tracked function called into it.
    OnlyCalled = 1001,
    /// Attribute handler work unconditionally.
    All = 1002,
}

impl IrqTrackMode {
    /// Decode a raw mode value.
    pub const fn from_raw(v: i64) -> Option<Self> {
        match v {
            1000 => Some(Self::None),
            1001 => Some(Self::OnlyCalled),
            1002 => Some(Self::All),
            _ => None,
        }
    }
}

/// How a tracked function participates in performance attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TrackedFnKind {
    /// Counts only while it is the innermost frame.
    NonTransitive = 0,
    /// Counts while anywhere on the call stack.
    Transitive = 1,
    /// Marks an interrupt handler; gates attribution per [`IrqTrackMode`].
    IrqHandler = 1000,
}

impl TrackedFnKind {
    /// Decode a raw kind value.
    pub const fn from_raw(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::NonTransitive),
            1 => Some(Self::Transitive),
            1000 => Some(Self::IrqHandler),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Function and I/O region flags
// ═══════════════════════════════════════════════════════════════════════

/// Wrapper kind for [`OP_ENTER_FUNCTION`]/[`OP_EXIT_FUNCTION`] marking a
/// stub wrapper, which brackets a call *out* of the instrumented code and
/// therefore inverts push/pop.  Any other value marks an ordinary function.
pub const FN_KIND_STUB_WRAPPER: i64 = 0;

/// Kind of I/O region event reported by [`OP_IO_REGION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IoRegionKind {
    MemMap = 1,
    MemUnmap = 2,
    PortMap = 3,
    PortUnmap = 4,
}

impl IoRegionKind {
    /// Decode a raw region-kind value.
    pub const fn from_raw(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::MemMap),
            2 => Some(Self::MemUnmap),
            3 => Some(Self::PortMap),
            4 => Some(Self::PortUnmap),
            _ => None,
        }
    }

    /// Human-readable region-kind name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MemMap => "mem-map",
            Self::MemUnmap => "mem-unmap",
            Self::PortMap => "port-map",
            Self::PortUnmap => "port-unmap",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Payload encoding / decoding
// ═══════════════════════════════════════════════════════════════════════

/// Encode a name string into a payload buffer.
///
/// Returns the number of bytes written, or `None` if the buffer is too
/// small.
///
/// # Wire format
///
/// ```text
/// [u16 name_len] [name bytes]
/// ```
pub fn encode_name(buf: &mut [u8], name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    let len = bytes.len();
    if len > u16::MAX as usize {
        return None;
    }
    if 2 + len > buf.len() {
        return None;
    }
    buf[..2].copy_from_slice(&(len as u16).to_le_bytes());
    buf[2..2 + len].copy_from_slice(bytes);
    Some(2 + len)
}

#[cfg(feature = "std")]
extern crate alloc;

/// Decode a name string from a payload buffer.
///
/// Only available with the `std` feature (requires heap allocation).
#[cfg(feature = "std")]
pub fn decode_name(buf: &[u8]) -> Option<alloc::string::String> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if 2 + len > buf.len() {
        return None;
    }
    Some(alloc::string::String::from_utf8_lossy(&buf[2..2 + len]).into_owned())
}
