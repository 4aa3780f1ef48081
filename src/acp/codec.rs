//! Frame codec for ACP agent streams.
//!
//! Outbound messages are always written as `Content-Length` framed bodies:
//!
//! ```text
//! Content-Length: 27\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,..}
//! ```
//!
//! Inbound bytes are accepted in either of two shapes, auto-detected frame by
//! frame:
//!
//! - a header block terminated by `\r\n\r\n` carrying a `Content-Length`,
//!   followed by exactly that many body bytes;
//! - a single newline-terminated JSON line (NDJSON), for agents that never
//!   emit headers.
//!
//! The decoder is driven by [`tokio_util::codec::FramedRead`], which owns the
//! receive buffer and calls [`AcpCodec::decode`] whenever new bytes arrive, so
//! frames may be split or merged at arbitrary chunk boundaries.
//!
//! Recovery is lossy but never fatal: an unparseable header is dropped
//! together with its separator, and frames larger than [`MAX_FRAME_BYTES`]
//! are skipped without being buffered.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::{FramedRead, FramedWrite};
//! use acp_adapter::acp::codec::AcpCodec;
//!
//! let reader = FramedRead::new(child_stdout, AcpCodec::new());
//! let writer = FramedWrite::new(child_stdin, AcpCodec::new());
//! ```

use std::sync::LazyLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use regex::bytes::Regex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Maximum frame body accepted by the decoder: 16 MiB.
///
/// A `Content-Length` above this limit, or an unterminated line growing past
/// it, is discarded instead of buffered.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Separator between the header block and the body of a framed message.
pub const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

// Both patterns are compile-time constants.
#[allow(clippy::expect_used)]
static CONTENT_LENGTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Content-Length:\s*(\d+)").expect("valid Content-Length pattern")
});

#[allow(clippy::expect_used)]
static HEADER_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9-]*:").expect("valid header field pattern")
});

/// Bidirectional frame codec for ACP agent stdio.
///
/// # Decoder
///
/// Yields the raw body of each complete frame. Bodies are not parsed here;
/// JSON decoding and classification happen in
/// [`dispatcher`](crate::acp::dispatcher).
///
/// # Encoder
///
/// Prefixes each payload with `Content-Length: <n>\r\n\r\n`, where `n` is the
/// byte length of the payload. No trailing delimiter is added.
#[derive(Debug, Default)]
pub struct AcpCodec {
    /// Header length and body length of a frame whose header has been parsed
    /// but whose body is still arriving.
    awaiting: Option<(usize, usize)>,
    /// Body bytes of an oversized frame still to be thrown away.
    discard_remaining: usize,
    /// An oversized unterminated line is being dropped up to its newline.
    discarding_line: bool,
    /// How far the boundary search has already looked into the buffer.
    scan: Scan,
}

/// Boundary search progress over bytes that are still buffered.
///
/// Lets a frame that arrives in many chunks be scanned once overall instead
/// of once per chunk. Only valid while the buffer front is untouched; reset
/// whenever bytes are consumed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Scan {
    /// Prefix already searched for a header separator without a match.
    searched: usize,
    /// First newline in the buffer, once seen.
    newline: Option<usize>,
    /// End of the complete lines already known to look like header fields.
    fields_checked: usize,
}

/// Where the next frame boundary in the buffer lies.
#[derive(Debug, PartialEq, Eq)]
enum Boundary {
    /// A newline-delimited line ends at this index (the `\n`).
    Line(usize),
    /// A header block ends at this index (start of `\r\n\r\n`).
    Header(usize),
    /// No complete boundary yet.
    Incomplete,
}

impl AcpCodec {
    /// Create a codec with empty decoder state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Throw away buffered bytes that belong to a frame being skipped.
    ///
    /// Returns `true` once nothing is left to skip.
    fn skip_discarded(&mut self, src: &mut BytesMut) -> bool {
        if self.discard_remaining > 0 {
            let n = self.discard_remaining.min(src.len());
            src.advance(n);
            self.discard_remaining -= n;
            if self.discard_remaining > 0 {
                return false;
            }
        }

        if self.discarding_line {
            match src.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    src.advance(pos + 1);
                    self.discarding_line = false;
                }
                None => {
                    src.clear();
                    return false;
                }
            }
        }

        true
    }
}

impl Decoder for AcpCodec {
    type Item = Bytes;
    type Error = AppError;

    /// Decode the next complete frame body from `src`.
    ///
    /// Returns `Ok(None)` while no complete frame is buffered. Never returns
    /// an error: malformed input is logged and skipped.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if let Some((header_len, body_len)) = self.awaiting {
                if src.len() < header_len + body_len {
                    return Ok(None);
                }
                self.awaiting = None;
                src.advance(header_len);
                return Ok(Some(src.split_to(body_len).freeze()));
            }

            if !self.skip_discarded(src) || src.is_empty() {
                return Ok(None);
            }

            let boundary = locate_boundary(&mut self.scan, src);
            if boundary != Boundary::Incomplete {
                self.scan = Scan::default();
            }

            match boundary {
                Boundary::Incomplete => {
                    if src.len() > MAX_FRAME_BYTES {
                        warn!(
                            buffered = src.len(),
                            limit = MAX_FRAME_BYTES,
                            "acp codec: unterminated input exceeds frame limit, discarding"
                        );
                        src.clear();
                        self.scan = Scan::default();
                        self.discarding_line = true;
                    }
                    return Ok(None);
                }

                Boundary::Line(newline) => {
                    let line = src.split_to(newline + 1).freeze();
                    let trimmed = line[..newline].trim_ascii();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Ok(Some(line.slice_ref(trimmed)));
                }

                Boundary::Header(header_end) => {
                    let header_len = header_end + HEADER_SEPARATOR.len();
                    let Some(body_len) = content_length(&src[..header_end]) else {
                        warn!(
                            header = %String::from_utf8_lossy(&src[..header_end]),
                            "acp codec: unable to parse Content-Length header, dropping it"
                        );
                        src.advance(header_len);
                        continue;
                    };

                    if body_len > MAX_FRAME_BYTES {
                        warn!(
                            content_length = body_len,
                            limit = MAX_FRAME_BYTES,
                            "acp codec: frame exceeds size limit, discarding"
                        );
                        src.advance(header_len);
                        self.discard_remaining = body_len;
                        continue;
                    }

                    if src.len() < header_len + body_len {
                        src.reserve(header_len + body_len - src.len());
                        self.awaiting = Some((header_len, body_len));
                        return Ok(None);
                    }

                    src.advance(header_len);
                    return Ok(Some(src.split_to(body_len).freeze()));
                }
            }
        }
    }

    /// Decode what is left when the stream reaches EOF.
    ///
    /// A trailing JSON line without its final newline is still emitted; any
    /// other leftover bytes (a truncated frame, a partial header) are logged
    /// and dropped.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let rest = src.split().freeze();
        self.scan = Scan::default();
        let trimmed = rest.trim_ascii();
        if self.awaiting.is_none() && !self.discarding_line && starts_json(trimmed) {
            return Ok(Some(rest.slice_ref(trimmed)));
        }

        debug!(
            dropped = rest.len(),
            "acp codec: discarding incomplete frame at end of stream"
        );
        self.awaiting = None;
        self.discarding_line = false;
        Ok(None)
    }
}

impl Encoder<Bytes> for AcpCodec {
    type Error = AppError;

    /// Encode `item` as a `Content-Length` framed message into `dst`.
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        let header = format!("Content-Length: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&item);
        Ok(())
    }
}

/// Frame `payload` for the wire.
///
/// Equivalent to running [`AcpCodec`]'s encoder into a fresh buffer.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(payload.len() + 32);
    dst.put_slice(format!("Content-Length: {}\r\n\r\n", payload.len()).as_bytes());
    dst.put_slice(payload);
    dst.freeze()
}

/// Extract the `Content-Length` value from a header block.
///
/// Matching is case-insensitive and tolerates other header fields around it.
/// Returns `None` when no field is present or its value is not a decimal
/// number that fits in `usize`.
#[must_use]
pub fn content_length(header: &[u8]) -> Option<usize> {
    let caps = CONTENT_LENGTH.captures(header)?;
    let digits = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
    digits.parse().ok()
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Find the next frame boundary in `src`, resuming where `scan` left off.
///
/// A header block wins unless a complete JSON line precedes it. A line that
/// looks like a header field but has no separator after it yet is treated as
/// an incomplete header rather than a standalone message.
fn locate_boundary(scan: &mut Scan, src: &[u8]) -> Boundary {
    let searched = scan.searched.min(src.len());
    // A separator may straddle the previous end of the buffer.
    let resume = searched.saturating_sub(HEADER_SEPARATOR.len() - 1);
    let header_end = src[resume..]
        .windows(HEADER_SEPARATOR.len())
        .position(|w| w == HEADER_SEPARATOR)
        .map(|i| resume + i);
    let newline = scan.newline.or_else(|| {
        src[searched..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| searched + i)
    });

    scan.searched = src.len();
    scan.newline = newline;

    match (header_end, newline) {
        (Some(h), Some(n)) if n < h && starts_json(src[..n].trim_ascii()) => Boundary::Line(n),
        (Some(h), _) => Boundary::Header(h),
        (None, Some(_)) if awaits_separator(scan, src) => Boundary::Incomplete,
        (None, Some(n)) => Boundary::Line(n),
        (None, None) => Boundary::Incomplete,
    }
}

/// `true` when every complete line in `src` looks like a header field, i.e.
/// the buffer is most likely a header block whose separator has not arrived.
/// Lines before `scan.fields_checked` are not checked again.
fn awaits_separator(scan: &mut Scan, src: &[u8]) -> bool {
    let mut start = scan.fields_checked.min(src.len());
    while let Some(n) = src[start..].iter().position(|&b| b == b'\n') {
        if !HEADER_FIELD.is_match(src[start..start + n].trim_ascii()) {
            return false;
        }
        start += n + 1;
        scan.fields_checked = start;
    }
    true
}

fn starts_json(bytes: &[u8]) -> bool {
    matches!(bytes.first(), Some(b'{' | b'['))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
