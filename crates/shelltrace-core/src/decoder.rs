//! Bounded line decoder for the control-channel trace protocol.
//!
//! This is the protocol's security boundary: input comes from an external,
//! not-fully-trusted producer. Every field extraction takes an explicit
//! destination bound and checks source slice lengths before copying — a
//! 600-byte command offered to a 512-byte bound yields a 512-byte prefix
//! flagged as truncated, never an overrun.
//!
//! Trace line shape:
//!
//! ```text
//! time:<unix_ms>,line:<n>,func:<name>,cmd:<text>
//! ```
//!
//! `cmd` is the final field and runs to end of line, so embedded `,` or `:`
//! in command text cannot corrupt the parse of earlier fields.

use memchr::memchr;

use crate::error::{Error, Result};
use crate::record::{COMMAND_MAX, FUNCTION_MAX};

/// Maximum digits scanned for an integer field (fits any u64).
pub const INT_SCAN_LIMIT: usize = 20;

/// One successfully decoded trace line, before budget/gate checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    /// Producer-reported timestamp in unix milliseconds.
    pub timestamp_ms: u64,
    /// Source line number within the traced script.
    pub source_line: u32,
    /// Function name, bounded to [`FUNCTION_MAX`] bytes.
    pub function: String,
    /// Command text, bounded to [`COMMAND_MAX`] bytes.
    pub command: String,
    /// Whether any field exceeded its bound and was prefix-truncated.
    pub truncated: bool,
}

/// Extract an unsigned integer terminated by `terminator`.
///
/// Scans at most `min(limit, src.len())` bytes for the terminator; the bytes
/// before it must be a non-empty ASCII numeral. Returns the value and the
/// number of bytes consumed including the terminator.
pub fn extract_int(src: &[u8], limit: usize, terminator: u8) -> Result<(u64, usize)> {
    let window = &src[..src.len().min(limit.saturating_add(1))];
    let end = memchr(terminator, window)
        .ok_or_else(|| Error::Parse(format!("no '{}' terminator for integer field", terminator as char)))?;
    let digits = &window[..end];
    if digits.is_empty() {
        return Err(Error::Parse("empty integer field".to_string()));
    }
    let mut value: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(Error::Parse(format!("non-digit byte 0x{b:02x} in integer field")));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| Error::Parse("integer field overflows u64".to_string()))?;
    }
    Ok((value, end + 1))
}

/// Extract a string field terminated by `terminator`, copying at most
/// `capacity` source bytes.
///
/// Returns the (possibly prefix-truncated) value, whether truncation
/// happened, and the bytes consumed including the terminator.
pub fn extract_str(src: &[u8], capacity: usize, terminator: u8) -> Result<(String, bool, usize)> {
    let end = memchr(terminator, src)
        .ok_or_else(|| Error::Parse(format!("no '{}' terminator for string field", terminator as char)))?;
    let (value, truncated) = bounded_lossy(&src[..end], capacity);
    Ok((value, truncated, end + 1))
}

/// Extract the terminal command field: the remainder of the line, copying at
/// most `capacity` source bytes. Embedded delimiter bytes are data here, not
/// field separators.
#[must_use]
pub fn extract_cmd(src: &[u8], capacity: usize) -> (String, bool) {
    bounded_lossy(src, capacity)
}

/// Copy at most `capacity` bytes of `src` into an owned string.
fn bounded_lossy(src: &[u8], capacity: usize) -> (String, bool) {
    let truncated = src.len() > capacity;
    let bounded = if truncated { &src[..capacity] } else { src };
    (String::from_utf8_lossy(bounded).into_owned(), truncated)
}

/// Decode one raw trace line into typed fields.
///
/// A trailing newline (and optional carriage return) is stripped first.
pub fn decode_trace_line(raw: &[u8]) -> Result<DecodedLine> {
    let mut rest = strip_eol(raw);

    rest = expect_tag(rest, b"time:")?;
    let (timestamp_ms, consumed) = extract_int(rest, INT_SCAN_LIMIT, b',')?;
    rest = &rest[consumed..];

    rest = expect_tag(rest, b"line:")?;
    let (line_value, consumed) = extract_int(rest, INT_SCAN_LIMIT, b',')?;
    rest = &rest[consumed..];
    let source_line = u32::try_from(line_value)
        .map_err(|_| Error::Parse(format!("source line {line_value} out of range")))?;

    rest = expect_tag(rest, b"func:")?;
    let (function, func_truncated, consumed) = extract_str(rest, FUNCTION_MAX, b',')?;
    rest = &rest[consumed..];

    rest = expect_tag(rest, b"cmd:")?;
    let (command, cmd_truncated) = extract_cmd(rest, COMMAND_MAX);

    Ok(DecodedLine {
        timestamp_ms,
        source_line,
        function,
        command,
        truncated: func_truncated || cmd_truncated,
    })
}

/// Require `tag` as a prefix of `src` and return the remainder.
fn expect_tag<'a>(src: &'a [u8], tag: &'static [u8]) -> Result<&'a [u8]> {
    src.strip_prefix(tag).ok_or_else(|| {
        Error::Parse(format!(
            "expected field tag {:?}",
            String::from_utf8_lossy(tag)
        ))
    })
}

/// Strip a single trailing `\n` or `\r\n`.
fn strip_eol(src: &[u8]) -> &[u8] {
    let src = src.strip_suffix(b"\n").unwrap_or(src);
    src.strip_suffix(b"\r").unwrap_or(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ---- extract_int ----

    #[test]
    fn int_parses_terminated_numeral() {
        let (value, consumed) = extract_int(b"12345,rest", INT_SCAN_LIMIT, b',').unwrap();
        assert_eq!(value, 12345);
        assert_eq!(consumed, 6);
    }

    #[test]
    fn int_requires_terminator_within_limit() {
        let err = extract_int(b"123456789", 4, b',').unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn int_rejects_empty_field() {
        assert!(extract_int(b",x", INT_SCAN_LIMIT, b',').is_err());
    }

    #[test]
    fn int_rejects_non_digit() {
        assert!(extract_int(b"12a4,", INT_SCAN_LIMIT, b',').is_err());
    }

    #[test]
    fn int_rejects_overflow() {
        assert!(extract_int(b"99999999999999999999,", INT_SCAN_LIMIT, b',').is_err());
    }

    // ---- extract_str / extract_cmd ----

    #[test]
    fn str_copies_terminated_field() {
        let (value, truncated, consumed) = extract_str(b"main,cmd:ls", 64, b',').unwrap();
        assert_eq!(value, "main");
        assert!(!truncated);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn str_truncates_at_capacity() {
        let src = b"abcdefgh,tail";
        let (value, truncated, consumed) = extract_str(src, 4, b',').unwrap();
        assert_eq!(value, "abcd");
        assert!(truncated);
        // Consumption still covers the whole source field.
        assert_eq!(consumed, 9);
    }

    #[test]
    fn str_without_terminator_is_parse_error() {
        assert!(extract_str(b"no-comma-here", 64, b',').is_err());
    }

    #[test]
    fn cmd_bounded_600_into_512() {
        let src = vec![b'x'; 600];
        let (value, truncated) = extract_cmd(&src, COMMAND_MAX);
        assert_eq!(value.len(), COMMAND_MAX);
        assert!(truncated);
    }

    #[test]
    fn cmd_tolerates_embedded_delimiters() {
        let (value, truncated) = extract_cmd(b"echo a,b:c,d", COMMAND_MAX);
        assert_eq!(value, "echo a,b:c,d");
        assert!(!truncated);
    }

    // ---- decode_trace_line ----

    #[test]
    fn decodes_well_formed_line() {
        let line = b"time:1700000000000,line:10,func:main,cmd:ls -l\n";
        let decoded = decode_trace_line(line).unwrap();
        assert_eq!(decoded.timestamp_ms, 1_700_000_000_000);
        assert_eq!(decoded.source_line, 10);
        assert_eq!(decoded.function, "main");
        assert_eq!(decoded.command, "ls -l");
        assert!(!decoded.truncated);
    }

    #[test]
    fn decodes_crlf_line() {
        let line = b"time:1,line:2,func:f,cmd:true\r\n";
        let decoded = decode_trace_line(line).unwrap();
        assert_eq!(decoded.command, "true");
    }

    #[test]
    fn command_with_commas_survives_intact() {
        let line = b"time:1,line:2,func:f,cmd:awk '{print $1,$2}'";
        let decoded = decode_trace_line(line).unwrap();
        assert_eq!(decoded.command, "awk '{print $1,$2}'");
    }

    #[test]
    fn oversized_command_is_flagged_not_fatal() {
        let mut line = b"time:1,line:2,func:f,cmd:".to_vec();
        line.extend(std::iter::repeat_n(b'z', 600));
        let decoded = decode_trace_line(&line).unwrap();
        assert_eq!(decoded.command.len(), COMMAND_MAX);
        assert!(decoded.truncated);
    }

    #[test]
    fn oversized_function_is_flagged_not_fatal() {
        let mut line = b"time:1,line:2,func:".to_vec();
        line.extend(std::iter::repeat_n(b'f', 100));
        line.extend_from_slice(b",cmd:true");
        let decoded = decode_trace_line(&line).unwrap();
        assert_eq!(decoded.function.len(), FUNCTION_MAX);
        assert!(decoded.truncated);
        assert_eq!(decoded.command, "true");
    }

    #[test]
    fn missing_tag_is_parse_error() {
        assert!(decode_trace_line(b"line:2,func:f,cmd:true").is_err());
    }

    #[test]
    fn missing_command_field_is_parse_error() {
        assert!(decode_trace_line(b"time:1,line:2,func:f").is_err());
    }

    #[test]
    fn source_line_over_u32_is_parse_error() {
        assert!(decode_trace_line(b"time:1,line:5000000000,func:f,cmd:x").is_err());
    }

    // ---- bounds under adversarial input ----

    proptest! {
        #[test]
        fn decode_never_panics_and_never_exceeds_bounds(noise in proptest::collection::vec(any::<u8>(), 0..2048)) {
            if let Ok(decoded) = decode_trace_line(&noise) {
                // Each retained char maps to at least one source byte, and at
                // most `capacity` source bytes are ever read per field.
                prop_assert!(decoded.function.chars().count() <= FUNCTION_MAX);
                prop_assert!(decoded.command.chars().count() <= COMMAND_MAX);
            }
        }

        #[test]
        fn extract_cmd_output_bounded(noise in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let (value, truncated) = extract_cmd(&noise, COMMAND_MAX);
            // Lossy UTF-8 replacement can widen bytes but never reads past
            // the capacity of source bytes.
            prop_assert_eq!(truncated, noise.len() > COMMAND_MAX);
            prop_assert!(value.chars().count() <= COMMAND_MAX);
        }
    }
}
