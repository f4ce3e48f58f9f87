//! Trace sinks: where records go.
//!
//! The scheduler emits through the [`TraceSink`] trait and never waits for
//! an acknowledgment.  [`MemorySink`] keeps records in memory (tests,
//! simulation), [`JsonlSink`] appends one JSON object per line to a file,
//! [`NullSink`] drops everything.

use crate::records::TraceRecord;
use log::warn;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Fire-and-forget record sink.
///
/// Emission order per state is preserved by the caller; nothing else is
/// guaranteed.  Implementations must not fail the caller: delivery
/// problems are logged and the record is dropped.
pub trait TraceSink {
    /// Append one record.
    fn emit(&mut self, record: TraceRecord);
}

// ═══════════════════════════════════════════════════════════════════════
//  In-memory sink
// ═══════════════════════════════════════════════════════════════════════

/// Sink that collects records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<TraceRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all collected records, clearing the sink.
    pub fn drain(&mut self) -> Vec<TraceRecord> {
        std::mem::take(&mut self.records)
    }

    /// Snapshot of collected records without clearing.
    pub fn peek(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl TraceSink for MemorySink {
    fn emit(&mut self, record: TraceRecord) {
        self.records.push(record);
    }
}

/// Sink that discards every record.
#[derive(Debug, Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn emit(&mut self, _record: TraceRecord) {}
}

// ═══════════════════════════════════════════════════════════════════════
//  JSON-lines file sink
// ═══════════════════════════════════════════════════════════════════════

/// Sink that appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlSink {
    writer: BufWriter<File>,
    written: u64,
    dropped: u64,
}

impl JsonlSink {
    /// Create (truncating) the sink file.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            written: 0,
            dropped: 0,
        })
    }

    /// Number of records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Number of records dropped due to write errors.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Flush buffered records to disk.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl TraceSink for JsonlSink {
    fn emit(&mut self, record: TraceRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("trace record not serializable, dropping: {}", e);
                self.dropped += 1;
                return;
            }
        };
        if let Err(e) = writeln!(self.writer, "{}", line) {
            warn!("trace write failed, dropping record: {}", e);
            self.dropped += 1;
            return;
        }
        self.written += 1;
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session log (save / load / summarize)
// ═══════════════════════════════════════════════════════════════════════

/// A recorded session trace: every record emitted during one exploration.
///
/// Used for offline inspection and for comparing two sessions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TraceLog {
    /// Session label (module under test, typically).
    pub session: String,
    /// All records in emission order.
    pub records: Vec<TraceRecord>,
    /// Host info for reproducibility checking.
    pub metadata: TraceMetadata,
}

/// Metadata about the trace environment.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TraceMetadata {
    /// Kernel version string.
    pub kernel_version: String,
    /// Timestamp when the session started (wall clock).
    pub start_time: String,
}

impl TraceMetadata {
    /// Gather metadata from the current system.
    pub fn gather() -> Self {
        let kernel_version = std::fs::read_to_string("/proc/version")
            .unwrap_or_default()
            .trim()
            .to_string();
        let start_time = match std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
        {
            Ok(d) => format!("{}s_{}ns", d.as_secs(), d.subsec_nanos()),
            Err(_) => String::from("unknown"),
        };
        Self {
            kernel_version,
            start_time,
        }
    }
}

impl TraceLog {
    /// Create a new trace log from collected records.
    pub fn new(session: impl Into<String>, records: Vec<TraceRecord>) -> Self {
        Self {
            session: session.into(),
            records,
            metadata: TraceMetadata::gather(),
        }
    }

    /// Save the log to a JSON file.
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Load a log from a JSON file.
    pub fn load(path: &str) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(std::io::Error::other)
    }

    /// Number of records in the log.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Summary statistics about record types.
    pub fn summary(&self) -> std::collections::HashMap<String, usize> {
        let mut counts = std::collections::HashMap::new();
        for record in &self.records {
            *counts
                .entry(record.record_type().name().to_string())
                .or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordKind;

    fn event(state_id: u64, code: i64) -> TraceRecord {
        TraceRecord {
            state_id,
            pc: 0x1000,
            kind: RecordKind::Event { code },
        }
    }

    #[test]
    fn memory_sink_collects_in_order() {
        let mut sink = MemorySink::new();
        sink.emit(event(1, 40));
        sink.emit(event(1, 43));
        assert_eq!(sink.len(), 2);
        let records = sink.drain();
        assert!(matches!(records[0].kind, RecordKind::Event { code: 40 }));
        assert!(matches!(records[1].kind, RecordKind::Event { code: 43 }));
        assert!(sink.is_empty());
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");

        let mut sink = JsonlSink::create(&path).unwrap();
        sink.emit(event(1, 40));
        sink.emit(event(2, 53));
        sink.flush().unwrap();
        assert_eq!(sink.written(), 2);
        assert_eq!(sink.dropped(), 0);
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: TraceRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.state_id, 1);
    }

    #[test]
    fn trace_log_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        let path = path.to_str().unwrap();

        let log = TraceLog::new("ath5k", vec![event(1, 40), event(1, 61)]);
        log.save(path).unwrap();

        let loaded = TraceLog::load(path).unwrap();
        assert_eq!(loaded.session, "ath5k");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn trace_log_summary_counts_by_type() {
        let records = vec![
            event(1, 40),
            event(1, 43),
            TraceRecord {
                state_id: 1,
                pc: 0,
                kind: RecordKind::SuccessPath {
                    function: "f".into(),
                    value: 1,
                },
            },
        ];
        let log = TraceLog::new("s", records);
        let summary = log.summary();
        assert_eq!(summary.get("event"), Some(&2));
        assert_eq!(summary.get("success-path"), Some(&1));
    }
}
