//! Per-instance ingestion task: reads the trace channel line by line,
//! negotiates the handshake, and commits decoded records to the engine.
//!
//! One task per instance. The channel is read with a bounded line reader so
//! a producer emitting an endless unterminated line cannot grow memory; the
//! overflow is discarded up to the next newline and the surviving prefix is
//! decoded with a truncation mark. End of file ends the task but does not
//! by itself mark the instance exited; exit is observed by the lifecycle
//! monitor, which is what keeps the grace-period accounting in one place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use memchr::memchr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, trace, warn};

use crate::engine::TraceEngine;
use crate::error::Error;
use crate::record::{InstanceId, LINE_MAX, RecordFlags};
use crate::version::negotiate;

/// One read from the bounded line reader.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    /// A complete line is in the buffer (newline stripped is the caller's
    /// job). `truncated` means the line exceeded the cap and its tail was
    /// discarded.
    Line { truncated: bool },
    /// Clean end of channel with no pending bytes.
    Eof,
}

/// Read one newline-terminated line into `buf`, retaining at most `cap`
/// bytes. Overflow past the cap is consumed and discarded up to and
/// including the next newline.
pub(crate) async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<LineRead> {
    buf.clear();
    let mut truncated = false;

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            // EOF. A non-empty buffer is a final unterminated line.
            if buf.is_empty() && !truncated {
                return Ok(LineRead::Eof);
            }
            return Ok(LineRead::Line { truncated });
        }

        match memchr(b'\n', chunk) {
            Some(pos) => {
                let take = if truncated {
                    0
                } else {
                    pos.min(cap - buf.len())
                };
                buf.extend_from_slice(&chunk[..take]);
                if take < pos {
                    truncated = true;
                }
                reader.consume(pos + 1);
                return Ok(LineRead::Line { truncated });
            }
            None => {
                let len = chunk.len();
                if !truncated {
                    let take = len.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < len {
                        truncated = true;
                    }
                }
                reader.consume(len);
            }
        }
    }
}

/// Drive one instance's channel until stop, EOF, or a fatal handshake
/// failure. Spawned by [`TraceEngine::attach`].
pub(crate) async fn run<R>(
    engine: Arc<TraceEngine>,
    id: InstanceId,
    channel: R,
    stop: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(channel);
    let mut buf = Vec::with_capacity(LINE_MAX);

    // Handshake: the first line must carry a supported version. A capped
    // handshake is never negotiated from its surviving prefix.
    match read_bounded_line(&mut reader, &mut buf, LINE_MAX).await {
        Ok(LineRead::Line { truncated: true }) => {
            warn!(instance = id, "handshake line over length cap, discarding instance");
            engine.discard(id);
            return;
        }
        Ok(LineRead::Line { truncated: false }) => match negotiate(&buf) {
            Ok(handshake) => {
                if let Err(err) = engine.activate(id, &handshake) {
                    warn!(instance = id, %err, "activation failed, detaching");
                    return;
                }
            }
            Err(err) => {
                warn!(instance = id, %err, "handshake rejected, discarding instance");
                engine.discard(id);
                return;
            }
        },
        Ok(LineRead::Eof) => {
            debug!(instance = id, "channel closed before handshake");
            engine.discard(id);
            return;
        }
        Err(err) => {
            warn!(instance = id, %err, "channel error before handshake");
            engine.discard(id);
            return;
        }
    }

    loop {
        if stop.load(Ordering::Relaxed) {
            debug!(instance = id, "stop requested, ending ingestion");
            break;
        }

        let transport_truncated = match read_bounded_line(&mut reader, &mut buf, LINE_MAX).await {
            Ok(LineRead::Line { truncated }) => truncated,
            Ok(LineRead::Eof) => {
                debug!(instance = id, "trace channel reached end of file");
                break;
            }
            Err(err) => {
                warn!(instance = id, %err, "trace channel read failed");
                break;
            }
        };

        if buf.is_empty() {
            continue;
        }

        match crate::decoder::decode_trace_line(&buf) {
            Ok(decoded) => {
                let mut flags = RecordFlags::NONE;
                if decoded.truncated {
                    flags = flags.with(RecordFlags::TRUNCATED);
                }
                if transport_truncated {
                    flags = flags.with(RecordFlags::TRUNCATED).with(RecordFlags::PARSE_WARNING);
                }
                trace!(
                    instance = id,
                    line = decoded.source_line,
                    func = %decoded.function,
                    "trace record decoded"
                );
                match engine.commit_record(id, &decoded, flags) {
                    Ok(()) => {}
                    Err(Error::BudgetExceeded { cost, ceiling }) => {
                        warn!(instance = id, cost, ceiling, "record dropped over budget");
                    }
                    Err(err) => {
                        warn!(instance = id, %err, "record rejected, ending ingestion");
                        break;
                    }
                }
            }
            Err(err) => {
                debug!(instance = id, %err, "malformed trace line");
                engine.note_parse_error(id);
            }
        }
    }

    engine.channel_closed(id);
}
