//! Process liveness probing.
//!
//! Traced processes are not children of this agent, so exit detection must
//! poll rather than reap. On Linux the probe reads `/proc/<pid>/stat` and
//! extracts the kernel's start time for the pid; comparing that against the
//! start time recorded at registration distinguishes the original process
//! from a later one that happens to reuse the pid.
//!
//! The probe is a trait so the lifecycle monitor can be driven in tests by
//! a fake that simulates process death and pid reuse without real
//! processes.

use std::collections::HashMap;
use std::sync::Mutex;

/// Result of probing one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists; `start_time` is its kernel start time in clock
    /// ticks since boot (opaque identity token, only compared for equality).
    Alive { start_time: u64 },
    /// No such process.
    Gone,
}

/// Pluggable liveness check.
pub trait LivenessProbe: Send + Sync {
    /// Probe whether `pid` currently names a live process.
    fn probe(&self, pid: u32) -> Liveness;
}

// =============================================================================
// procfs implementation
// =============================================================================

/// Liveness probe backed by `/proc` (Linux). On platforms without procfs
/// every pid reads as gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcLiveness;

impl LivenessProbe for ProcLiveness {
    fn probe(&self, pid: u32) -> Liveness {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => parse_stat_start_time(&stat)
                .map_or(Liveness::Gone, |start_time| Liveness::Alive { start_time }),
            Err(_) => Liveness::Gone,
        }
    }
}

/// Extract the `starttime` field (field 22) from `/proc/<pid>/stat`.
///
/// The comm field (2) is parenthesized and may itself contain spaces or
/// parentheses, so parsing starts after the last `)`.
fn parse_stat_start_time(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // Fields 3..; starttime is field 22 overall.
    after_comm
        .split_ascii_whitespace()
        .nth(19)?
        .parse::<u64>()
        .ok()
}

// =============================================================================
// Fake probe for tests and embedders
// =============================================================================

/// In-memory probe that simulates process lifetimes.
#[derive(Debug, Default)]
pub struct FakeLiveness {
    table: Mutex<HashMap<u32, u64>>,
}

impl FakeLiveness {
    /// Create a probe with no live processes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `pid` as running with the given start time.
    pub fn set_running(&self, pid: u32, start_time: u64) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, start_time);
    }

    /// Mark `pid` as exited.
    pub fn kill(&self, pid: u32) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }
}

impl LivenessProbe for FakeLiveness {
    fn probe(&self, pid: u32) -> Liveness {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .map_or(Liveness::Gone, |&start_time| Liveness::Alive { start_time })
    }
}
