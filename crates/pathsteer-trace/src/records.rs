//! Typed trace records emitted by the scheduler.
//!
//! Each record carries the emitting state's id and program counter plus a
//! [`RecordKind`] payload.  Records are fire-and-forget: the scheduler
//! appends them to a [`crate::sink::TraceSink`] and never reads them back
//! during a session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of call-stack functions attributed to a hardware access.
pub const HW_ATTRIBUTED_FNS: usize = 3;

// ═══════════════════════════════════════════════════════════════════════
//  Record type discriminants
// ═══════════════════════════════════════════════════════════════════════

/// Record type discriminants, stable across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum RecordType {
    Instruction = 1,
    Block = 2,
    Event = 3,
    SuccessPath = 4,
    IoRegion = 5,
    HwAccess = 6,
}

impl RecordType {
    /// Convert a `u32` discriminant to a [`RecordType`], if valid.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Instruction),
            2 => Some(Self::Block),
            3 => Some(Self::Event),
            4 => Some(Self::SuccessPath),
            5 => Some(Self::IoRegion),
            6 => Some(Self::HwAccess),
            _ => None,
        }
    }

    /// Return the human-readable record type name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Block => "block",
            Self::Event => "event",
            Self::SuccessPath => "success-path",
            Self::IoRegion => "io-region",
            Self::HwAccess => "hw-access",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Records
// ═══════════════════════════════════════════════════════════════════════

/// Hardware access kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Port,
    Mmio,
    Dma,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port => write!(f, "PIO"),
            Self::Mmio => write!(f, "MMIO"),
            Self::Dma => write!(f, "DMA"),
        }
    }
}

/// A single trace record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Id of the emitting exploration state.
    pub state_id: u64,
    /// Program counter at the emission point.
    pub pc: u64,
    /// Typed payload.
    pub kind: RecordKind,
}

/// Typed record payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// One instruction executed inside an attributed region.
    Instruction {
        /// Module-relative program counter.
        delta: u64,
        /// Function the instruction belongs to.
        function: String,
    },
    /// One block executed inside an attributed region.
    Block {
        /// Module-relative program counter of the block start.
        delta: u64,
        /// Function the block belongs to.
        function: String,
    },
    /// Generic span event (trackperf push/pop, tracked-function match).
    Event {
        /// Raw span code (see `pathsteer_protocol::SpanCode`).
        code: i64,
    },
    /// Success-path counter update.
    SuccessPath {
        /// Reporting function.
        function: String,
        /// Counter value after the update.
        value: i64,
    },
    /// I/O region map/unmap.
    IoRegion {
        /// Raw region kind (see `pathsteer_protocol::IoRegionKind`).
        region: u32,
        address: u64,
        size: u64,
    },
    /// Hardware access (port, MMIO, or DMA).
    HwAccess {
        kind: AccessKind,
        write: bool,
        virt_address: u64,
        phys_address: u64,
        address_symbolic: bool,
        value: u64,
        value_symbolic: bool,
        size: u8,
        /// Most recent non-accessor call-stack functions, innermost first;
        /// at most [`HW_ATTRIBUTED_FNS`].
        functions: Vec<String>,
    },
}

impl TraceRecord {
    /// Get the record type.
    pub fn record_type(&self) -> RecordType {
        match &self.kind {
            RecordKind::Instruction { .. } => RecordType::Instruction,
            RecordKind::Block { .. } => RecordType::Block,
            RecordKind::Event { .. } => RecordType::Event,
            RecordKind::SuccessPath { .. } => RecordType::SuccessPath,
            RecordKind::IoRegion { .. } => RecordType::IoRegion,
            RecordKind::HwAccess { .. } => RecordType::HwAccess,
        }
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[state {:>4}] pc={:#010x} ", self.state_id, self.pc)?;
        match &self.kind {
            RecordKind::Instruction { delta, function } => {
                write!(f, "INSTR delta={:#x} fn={}", delta, function)
            }
            RecordKind::Block { delta, function } => {
                write!(f, "BLOCK delta={:#x} fn={}", delta, function)
            }
            RecordKind::Event { code } => {
                write!(f, "EVENT code={}", code)
            }
            RecordKind::SuccessPath { function, value } => {
                write!(f, "SPATH fn={} value={}", function, value)
            }
            RecordKind::IoRegion {
                region,
                address,
                size,
            } => {
                write!(f, "IOREG kind={} addr={:#x} size={:#x}", region, address, size)
            }
            RecordKind::HwAccess {
                kind,
                write,
                virt_address,
                value,
                size,
                functions,
                ..
            } => {
                write!(
                    f,
                    "HW    {} {} addr={:#x} val={:#x} size={} fns={:?}",
                    kind,
                    if *write { "W" } else { "R" },
                    virt_address,
                    value,
                    size,
                    functions,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_roundtrip() {
        for t in 1..=6 {
            let rt = RecordType::from_u32(t).unwrap();
            assert_eq!(rt as u32, t);
        }
        assert!(RecordType::from_u32(0).is_none());
        assert!(RecordType::from_u32(7).is_none());
    }

    #[test]
    fn record_type_mapping() {
        let rec = TraceRecord {
            state_id: 3,
            pc: 0x1000,
            kind: RecordKind::Event { code: 40 },
        };
        assert_eq!(rec.record_type(), RecordType::Event);

        let rec = TraceRecord {
            state_id: 3,
            pc: 0x1000,
            kind: RecordKind::Block {
                delta: 0x20,
                function: "probe".into(),
            },
        };
        assert_eq!(rec.record_type(), RecordType::Block);
    }

    #[test]
    fn display_success_path() {
        let rec = TraceRecord {
            state_id: 7,
            pc: 0xc0de,
            kind: RecordKind::SuccessPath {
                function: "ath5k_init".into(),
                value: 2,
            },
        };
        let s = rec.to_string();
        assert!(s.contains("SPATH"));
        assert!(s.contains("ath5k_init"));
        assert!(s.contains("value=2"));
    }

    #[test]
    fn serde_roundtrip() {
        let rec = TraceRecord {
            state_id: 1,
            pc: 0x2000,
            kind: RecordKind::HwAccess {
                kind: AccessKind::Mmio,
                write: true,
                virt_address: 0xf000_0000,
                phys_address: 0x8000_0000,
                address_symbolic: false,
                value: 0xff,
                value_symbolic: true,
                size: 4,
                functions: vec!["hw_reset".into()],
            },
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: TraceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
