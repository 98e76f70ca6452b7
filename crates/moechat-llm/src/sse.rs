//! SSE line reassembly for upstream chunk streams.
//!
//! The backend speaks HTTP SSE: `data: <json>\n\n` events terminated by the
//! literal `data: [DONE]`. Network reads do not respect event boundaries, so
//! a single JSON payload may arrive across several reads. This module buffers
//! raw bytes, splits on newlines, and yields complete payload lines; JSON
//! decoding happens one layer up in [`crate::chunk`].

use bytes::BytesMut;
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::error::UpstreamError;

/// One meaningful line of an SSE body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseLine {
    /// Payload of a `data:` field, whitespace-trimmed.
    Data(String),
    /// The literal `[DONE]` terminal sentinel.
    Done,
}

/// Reassemble SSE lines from a raw byte stream.
///
/// Yields [`SseLine::Data`] for each non-empty `data:` payload and
/// [`SseLine::Done`] (then ends) for the `[DONE]` sentinel. Blank lines,
/// comment lines, and non-`data` fields produce nothing. A transport read
/// error or end-of-stream before `[DONE]` yields
/// [`UpstreamError::Disconnected`]; trailing buffered bytes at end-of-stream
/// are processed as a final line first.
pub fn parse_sse_lines<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<SseLine, UpstreamError>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), false),
        move |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }

            loop {
                // Check buffer for a complete line (\n)
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    // Split the line bytes out of the buffer (zero-copy split)
                    let mut line_bytes = buffer.split_to(newline_pos + 1);
                    // Remove trailing \n
                    line_bytes.truncate(line_bytes.len() - 1);
                    // Remove trailing \r if present
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.truncate(line_bytes.len() - 1);
                    }

                    let line = match std::str::from_utf8(&line_bytes) {
                        Ok(s) => s,
                        Err(_) => continue, // skip invalid UTF-8 lines
                    };

                    match classify_line(line) {
                        Some(SseLine::Done) => {
                            return Some((Ok(SseLine::Done), (stream, buffer, true)));
                        }
                        Some(data) => return Some((Ok(data), (stream, buffer, false))),
                        None => continue,
                    }
                }

                // Read next chunk — append raw bytes, no conversion
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream SSE read failed");
                        return Some((Err(UpstreamError::Disconnected), (stream, buffer, true)));
                    }
                    None => {
                        // Stream ended without [DONE]. Flush any trailing
                        // buffered line, then report the disconnect.
                        if !buffer.is_empty() {
                            let pending = match std::str::from_utf8(&buffer) {
                                Ok(s) => classify_line(s.trim()),
                                Err(_) => None,
                            };
                            buffer.clear();
                            if let Some(SseLine::Done) = pending {
                                return Some((Ok(SseLine::Done), (stream, buffer, true)));
                            }
                            if let Some(data) = pending {
                                // One more turn of the unfold reports the
                                // disconnect after this final payload.
                                return Some((Ok(data), (stream, buffer, false)));
                            }
                        }
                        return Some((Err(UpstreamError::Disconnected), (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

/// Classify one reassembled SSE line.
///
/// Returns `None` for blank lines, comments, non-`data` fields, and empty
/// payloads.
fn classify_line(line: &str) -> Option<SseLine> {
    let trimmed = line.trim();

    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?;
    let data = data.trim();

    if data == "[DONE]" {
        return Some(SseLine::Done);
    }
    if data.is_empty() {
        return None;
    }

    Some(SseLine::Data(data.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
