//! Data model: trace records and the protocol's fixed field bounds.
//!
//! The bounds are contract constants of the control-channel line protocol,
//! not per-connection negotiable values. They bound how many source bytes a
//! decoded field may retain; the decoder enforces them structurally.

use serde::{Deserialize, Serialize};

/// Small dense instance identifier. Unique among non-reclaimed instances;
/// reused after reclamation.
pub type InstanceId = u32;

/// Maximum retained bytes of a function-name field.
pub const FUNCTION_MAX: usize = 64;
/// Maximum retained bytes of a command-text field.
pub const COMMAND_MAX: usize = 512;
/// Maximum retained bytes of the traced script path.
pub const SCRIPT_MAX: usize = 256;
/// Maximum length of an instance basename (pid rendered as a string).
pub const BASENAME_MAX: usize = 16;
/// Hard cap on a raw protocol line. Longer lines are truncated at the
/// transport layer and the surviving record is flagged.
pub const LINE_MAX: usize = 1024;

// =============================================================================
// Record flags
// =============================================================================

/// Per-record condition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// A field exceeded its destination bound and only the prefix was kept.
    pub const TRUNCATED: Self = Self(1 << 0);
    /// The raw line was cut at the transport cap before decoding.
    pub const PARSE_WARNING: Self = Self(1 << 1);

    /// Whether all flags in `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of this set and `other`.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether no flags are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// Trace record
// =============================================================================

/// One decoded execution-trace line from an instrumented shell process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Instance that produced this record.
    pub owner: InstanceId,
    /// Global arrival sequence number, strictly increasing across the
    /// whole engine. Drives globally-oldest-first eviction.
    pub seq: u64,
    /// Condition flags (truncation, transport warnings).
    pub flags: RecordFlags,
    /// Producer-reported timestamp in unix milliseconds.
    pub timestamp_ms: u64,
    /// Source line number within the traced script.
    pub source_line: u32,
    /// Function name, at most [`FUNCTION_MAX`] source bytes.
    pub function: String,
    /// Command text, at most [`COMMAND_MAX`] source bytes.
    pub command: String,
}

impl TraceRecord {
    /// Bytes this record charges against the global memory budget.
    #[must_use]
    pub fn cost(&self) -> usize {
        std::mem::size_of::<Self>() + self.function.len() + self.command.len()
    }
}
