//! Trace records and sinks for pathsteer exploration sessions.
//!
//! The scheduler narrates an exploration session as a stream of typed
//! records: instructions and blocks executed inside attributed regions,
//! span events, success-path updates, I/O region changes, and hardware
//! accesses.  This crate defines the records and the sinks they flow into.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  pathsteer-sched                    │
//! │  (annotation dispatch, callbacks)   │
//! └──────────────┬──────────────────────┘
//!                │ TraceSink::emit
//! ┌──────────────▼──────────────────────┐
//! │  MemorySink   → in-process access   │
//! │  JsonlSink    → one JSON per line   │
//! │  TraceLog     → save/load/summary   │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use pathsteer_trace::records::{RecordKind, TraceRecord};
//! use pathsteer_trace::sink::{MemorySink, TraceSink};
//!
//! let mut sink = MemorySink::new();
//! sink.emit(TraceRecord {
//!     state_id: 1,
//!     pc: 0x1000,
//!     kind: RecordKind::Event { code: 40 },
//! });
//! assert_eq!(sink.len(), 1);
//! ```
//!
//! ## Offline inspection
//!
//! ```no_run
//! use pathsteer_trace::sink::TraceLog;
//!
//! let log = TraceLog::load("session.json").unwrap();
//! for (kind, count) in log.summary() {
//!     println!("{:>12}: {}", kind, count);
//! }
//! ```

pub mod records;
pub mod sink;
