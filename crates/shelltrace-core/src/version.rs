//! Version negotiation for newly attached producers.
//!
//! The first line a producer writes on its control channel declares the
//! protocol version it speaks:
//!
//! ```text
//! version:<n>[,script:<path>]
//! ```
//!
//! A version outside the supported range means the instance never becomes
//! active: the channel is closed and no registry entry persists.

use crate::decoder::{INT_SCAN_LIMIT, extract_int};
use crate::error::{Error, Result};
use crate::record::SCRIPT_MAX;

/// Oldest producer protocol version this engine accepts.
pub const MINIMUM_VERSION: u64 = 1;
/// Newest producer protocol version this engine accepts.
pub const MAXIMUM_VERSION: u64 = 1;

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Validated protocol version, within the supported range.
    pub version: u64,
    /// Producer-declared script path, bounded to [`SCRIPT_MAX`] bytes.
    pub script: Option<String>,
}

/// Validate a producer's first line against the supported version range.
pub fn negotiate(first_line: &[u8]) -> Result<Handshake> {
    let line = trim_eol(first_line);
    let rest = line
        .strip_prefix(b"version:")
        .ok_or_else(|| Error::Parse("handshake must start with version field".to_string()))?;

    // The version field ends at ',' or end of line.
    let (version, consumed) = match memchr::memchr(b',', rest) {
        Some(_) => extract_int(rest, INT_SCAN_LIMIT, b',')?,
        None => {
            let mut with_terminator = rest.to_vec();
            with_terminator.push(b',');
            let (value, consumed) = extract_int(&with_terminator, INT_SCAN_LIMIT, b',')?;
            (value, consumed - 1)
        }
    };

    if !(MINIMUM_VERSION..=MAXIMUM_VERSION).contains(&version) {
        return Err(Error::UnsupportedVersion { declared: version });
    }

    let script = rest[consumed.min(rest.len())..]
        .strip_prefix(b"script:")
        .map(|path| {
            let bounded = &path[..path.len().min(SCRIPT_MAX)];
            String::from_utf8_lossy(bounded).into_owned()
        });

    Ok(Handshake { version, script })
}

fn trim_eol(src: &[u8]) -> &[u8] {
    let src = src.strip_suffix(b"\n").unwrap_or(src);
    src.strip_suffix(b"\r").unwrap_or(src)
}
