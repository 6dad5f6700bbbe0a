//! shelltrace-core: agent-side collection engine for instrumented shell
//! processes.
//!
//! Instrumented scripts write newline-delimited trace lines into a
//! per-process channel. This crate decodes them, retains them in bounded
//! per-instance stores, and exposes the instance domain and per-instance
//! values to a collector.
//!
//! # Architecture
//!
//! ```text
//! trace channel → ingest task → decoder → engine (registry/stores/budget)
//!                                              ↓
//!                   collector ← snapshot / fetch / refresh
//! ```
//!
//! # Modules
//!
//! - `engine`: orchestration; attach, admission, refresh, fetch
//! - `decoder`: bounded field extraction for trace lines
//! - `version`: handshake negotiation
//! - `ingest`: per-instance channel reader task
//! - `registry`: instance table, id allocation, enumeration
//! - `lifecycle`: polling exit detection with a one-cycle grace period
//! - `liveness`: pluggable process probes (procfs and fake)
//! - `store`: per-instance FIFO of retained records
//! - `budget`: global memory ceiling and eviction accounting
//! - `gate`: restricted-store access policy
//! - `record`: record type, flags, field capacity constants
//! - `config`: TOML configuration with full defaults
//! - `logging`: tracing setup (pretty or JSON)
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod budget;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod gate;
mod ingest;
pub mod lifecycle;
pub mod liveness;
pub mod logging;
pub mod record;
pub mod registry;
pub mod store;
pub mod version;

pub use budget::BudgetSummary;
pub use config::{CollectConfig, DaemonConfig, EngineConfig};
pub use decoder::{DecodedLine, decode_trace_line};
pub use engine::{MetricKind, MetricValue, TraceEngine};
pub use error::{Error, Result};
pub use lifecycle::RefreshReport;
pub use liveness::{FakeLiveness, Liveness, LivenessProbe, ProcLiveness};
pub use record::{InstanceId, RecordFlags, TraceRecord};
pub use registry::InstanceState;
pub use version::{Handshake, MAXIMUM_VERSION, MINIMUM_VERSION};

/// Crate version, from Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
