//! HTTP/1.x message framing.
//!
//! Carves complete messages out of an accumulator: finds the header
//! terminator, resolves the body length from `Content-Length` or chunked
//! transfer coding, and skips `CONNECT` tunnel preambles. Every step returns
//! a tagged [`Carve`] result; nothing here panics or fails on bad input.

use memchr::memmem;

use crate::accumulator::ByteAccumulator;
use crate::flow::Side;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

// =============================================================================
// Carve Results
// =============================================================================

/// A complete message carved from an accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Direction the message was observed in.
    pub side: Side,
    /// Exact bytes consumed for this message, head and framed body.
    pub raw: Vec<u8>,
    /// Decoded header block without the terminator (start line included).
    pub head: String,
    /// Body payload, de-chunked when chunked coding was used.
    pub body: Option<Vec<u8>>,
    /// Status code for responses.
    pub status: Option<u16>,
}

impl RawMessage {
    /// Returns the start line.
    pub fn start_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    /// Iterates the header fields after the start line.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        header_fields(&self.head)
    }

    /// Returns the header lines after the start line, one per line.
    pub fn header_text(&self) -> String {
        self.head
            .split("\r\n")
            .skip(1)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.head, name)
    }
}

/// Why a byte range was consumed without producing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A `CONNECT` tunnel preamble.
    Tunnel,
    /// Structurally unusable bytes.
    Malformed(String),
}

/// Result of one carve step over the unparsed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Carve {
    /// A complete message.
    Complete(RawMessage),
    /// A tunnel preamble of `consumed` bytes; nothing is emitted.
    Tunnel { consumed: usize },
    /// `consumed` bytes could not be interpreted and are dropped.
    Malformed { consumed: usize, reason: String },
    /// The message is not complete yet; nothing is consumed.
    NeedMoreData,
}

/// Output of the carve loop, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Carved {
    /// A complete message.
    Message(RawMessage),
    /// A consumed range that produced no message.
    Skipped { bytes: Vec<u8>, reason: SkipReason },
}

// =============================================================================
// Parser
// =============================================================================

/// Runs one carve step over `data`, which starts at a message boundary.
pub fn carve_one(data: &[u8], side: Side) -> Carve {
    carve_from(data, side, &mut 0, false)
}

/// Carve step that starts the terminator search at `*scan` and, when the
/// message is incomplete, records how far the search got.
///
/// `answers_head` marks a response to a `HEAD` request, which carries no body
/// whatever its length headers say.
fn carve_from(data: &[u8], side: Side, scan: &mut usize, answers_head: bool) -> Carve {
    let from = (*scan).min(data.len());
    let Some(found) = memmem::find(&data[from..], HEADER_TERMINATOR) else {
        // A terminator split across appends starts at most three bytes back.
        *scan = data.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        return Carve::NeedMoreData;
    };
    let terminator = from + found;
    let header_end = terminator + HEADER_TERMINATOR.len();
    let head = decode_head(&data[..terminator], side);
    let start_line = head.lines().next().unwrap_or_default();

    if side == Side::Request && is_connect(start_line) {
        return Carve::Tunnel {
            consumed: header_end,
        };
    }

    let start = match side {
        Side::Request => parse_request_start(start_line).map(|_| None),
        Side::Response => parse_status_start(start_line).map(|(code, _)| Some(code)),
    };
    let status = start.as_ref().ok().copied().flatten();

    let rest = &data[header_end..];
    let (body, body_len) = match resolve_body(&head, side, status, answers_head, rest) {
        Body::Framed { body, len } => (body, len),
        Body::Incomplete => {
            *scan = terminator;
            return Carve::NeedMoreData;
        }
        Body::Misframed { len, reason } => {
            return Carve::Malformed {
                consumed: header_end + len,
                reason,
            };
        }
    };
    let consumed = header_end + body_len;

    let status = match start {
        Ok(status) => status,
        Err(reason) => return Carve::Malformed { consumed, reason },
    };

    Carve::Complete(RawMessage {
        side,
        raw: data[..consumed].to_vec(),
        head,
        body,
        status,
    })
}

/// Carves every complete message out of `acc`, then compacts it.
///
/// Stops at the first [`Carve::NeedMoreData`]. Tunnel and malformed ranges
/// are reported as [`Carved::Skipped`] so callers can account for every byte.
pub fn carve_all(acc: &mut ByteAccumulator, side: Side) -> Vec<Carved> {
    carve_all_with(acc, side, |_| false)
}

/// Like [`carve_all`], but asks `answers_head(n)` whether the `n`-th final
/// response carved by this call (counting from 0) answers a `HEAD` request.
pub fn carve_all_with(
    acc: &mut ByteAccumulator,
    side: Side,
    answers_head: impl Fn(usize) -> bool,
) -> Vec<Carved> {
    let mut carved = Vec::new();
    let mut finals = 0usize;

    loop {
        let mut scan = acc.head_scan();
        let head_only = side == Side::Response && answers_head(finals);
        match carve_from(acc.unparsed(), side, &mut scan, head_only) {
            Carve::NeedMoreData => {
                acc.set_head_scan(scan);
                break;
            }
            Carve::Complete(message) => {
                acc.take(message.raw.len());
                if message.status.is_some_and(|code| !is_interim(code)) {
                    finals += 1;
                }
                carved.push(Carved::Message(message));
            }
            Carve::Tunnel { consumed } => {
                carved.push(Carved::Skipped {
                    bytes: acc.take(consumed),
                    reason: SkipReason::Tunnel,
                });
            }
            Carve::Malformed { consumed, reason } => {
                tracing::debug!(side = side.as_str(), consumed, %reason, "Dropping malformed message");
                carved.push(Carved::Skipped {
                    bytes: acc.take(consumed),
                    reason: SkipReason::Malformed(reason),
                });
            }
        }
        if acc.is_empty() {
            break;
        }
    }

    acc.compact();
    carved
}

/// Returns true for 1xx responses that precede the final one. `101` ends the
/// exchange and is not interim.
pub fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}

// =============================================================================
// Overflow Recovery
// =============================================================================

/// What can still be learned from a message too large to buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    /// The message with its body removed, when the start line is usable.
    pub message: Option<RawMessage>,
    /// Total framed length, when a `Content-Length` delimits the body.
    pub framed_len: Option<usize>,
}

/// Inspects the incomplete message at the start of `data`.
///
/// Returns `None` while the header block itself is incomplete.
pub fn truncated_head(data: &[u8], side: Side) -> Option<Truncated> {
    let terminator = memmem::find(data, HEADER_TERMINATOR)?;
    let header_end = terminator + HEADER_TERMINATOR.len();
    let head = decode_head(&data[..terminator], side);
    let start_line = head.lines().next().unwrap_or_default();

    let status = match side {
        Side::Request => parse_request_start(start_line).map(|_| None),
        Side::Response => parse_status_start(start_line).map(|(code, _)| Some(code)),
    };
    let framed_len = if side == Side::Response && is_chunked(&head) {
        None
    } else {
        header_end.checked_add(content_length(&head))
    };

    let message = status.ok().map(|status| RawMessage {
        side,
        raw: data[..header_end].to_vec(),
        head,
        body: None,
        status,
    });
    Some(Truncated {
        message,
        framed_len,
    })
}

const REQUEST_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"TRACE ", b"CONNECT ",
];

/// Longest prefix [`find_message_start`] needs to recognise a start line.
pub const START_PREFIX_LEN: usize = 8;

/// Finds the first offset in `data` that looks like the start of a message:
/// offset 0 or the byte after a line feed, followed by `HTTP/1.` for
/// responses or a known method and a space for requests.
pub fn find_message_start(data: &[u8], side: Side) -> Option<usize> {
    std::iter::once(0)
        .chain(memchr::memchr_iter(b'\n', data).map(|idx| idx + 1))
        .find(|&pos| {
            let tail = &data[pos..];
            match side {
                Side::Response => tail.starts_with(b"HTTP/1."),
                Side::Request => REQUEST_METHODS.iter().any(|method| tail.starts_with(method)),
            }
        })
}

fn decode_head(bytes: &[u8], side: Side) -> String {
    match side {
        Side::Request => String::from_utf8_lossy(bytes).into_owned(),
        // Latin-1: one char per byte.
        Side::Response => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn is_connect(start_line: &str) -> bool {
    start_line
        .get(..7)
        .is_some_and(|method| method.eq_ignore_ascii_case("CONNECT"))
}

/// Splits a request line into method and target.
pub fn parse_request_start(line: &str) -> Result<(&str, &str), String> {
    let mut parts = line.split(' ');
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(format!("bad request method in {:?}", truncate(line)));
    }
    if target.is_empty() {
        return Err(format!("missing request target in {:?}", truncate(line)));
    }
    if !version.starts_with("HTTP/") {
        return Err(format!("bad request version in {:?}", truncate(line)));
    }
    Ok((method, target))
}

/// Splits a status line into code and reason phrase.
pub fn parse_status_start(line: &str) -> Result<(u16, &str), String> {
    let Some(rest) = line.strip_prefix("HTTP/") else {
        return Err(format!("bad status line {:?}", truncate(line)));
    };
    let mut parts = rest.splitn(3, ' ');
    let _version = parts.next();
    let code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| format!("bad status code in {:?}", truncate(line)))?;
    let reason = parts.next().unwrap_or_default().trim();
    Ok((code, reason))
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(64) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

enum Body {
    Framed { body: Option<Vec<u8>>, len: usize },
    Incomplete,
    Misframed { len: usize, reason: String },
}

/// Resolves the body that follows the header block and the number of framed
/// bytes it occupies.
fn resolve_body(
    head: &str,
    side: Side,
    status: Option<u16>,
    answers_head: bool,
    rest: &[u8],
) -> Body {
    if let Some(code) = status {
        if (100..200).contains(&code) || code == 204 || code == 304 || answers_head {
            return Body::Framed { body: None, len: 0 };
        }
    }

    if side == Side::Response && is_chunked(head) {
        return match decode_chunked(rest) {
            Chunked::Complete { body, consumed } => Body::Framed {
                body: (!body.is_empty()).then_some(body),
                len: consumed,
            },
            Chunked::Incomplete => Body::Incomplete,
            Chunked::Malformed { consumed, reason } => Body::Misframed {
                len: consumed,
                reason,
            },
        };
    }

    let len = content_length(head);
    if len == 0 {
        return Body::Framed { body: None, len: 0 };
    }
    if rest.len() < len {
        return Body::Incomplete;
    }
    Body::Framed {
        body: Some(rest[..len].to_vec()),
        len,
    }
}

fn is_chunked(head: &str) -> bool {
    header_fields(head).any(|(name, value)| {
        name.eq_ignore_ascii_case("transfer-encoding") && value.to_ascii_lowercase().contains("chunked")
    })
}

/// Declared `Content-Length`, or 0 when absent, unparsable, negative or
/// too large to address.
pub fn content_length(head: &str) -> usize {
    find_header(head, "content-length")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .and_then(|len| usize::try_from(len).ok())
        .unwrap_or(0)
}

// =============================================================================
// Chunked Transfer Coding
// =============================================================================

/// Result of decoding a chunked body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunked {
    /// The terminating zero-size chunk was seen.
    Complete { body: Vec<u8>, consumed: usize },
    /// More bytes are needed.
    Incomplete,
    /// A chunk is not followed by CRLF. `consumed` covers the framing up to
    /// and including the bad delimiter.
    Malformed { consumed: usize, reason: String },
}

/// Decodes a chunked body starting at `data[0]`.
///
/// Unparsable chunk sizes count as zero, which ends the body. Chunk
/// extensions after `;` are ignored. Trailer fields are not supported, so the
/// zero-size chunk must be followed by CRLF.
pub fn decode_chunked(data: &[u8]) -> Chunked {
    // Walk the framing first; the body is copied only once it is complete.
    let mut chunks: Vec<(usize, usize)> = Vec::new();
    let mut pos = 0usize;

    loop {
        let Some(line_len) = memmem::find(&data[pos..], CRLF) else {
            return Chunked::Incomplete;
        };
        let size = chunk_size(&data[pos..pos + line_len]);
        pos += line_len + CRLF.len();

        let Some(chunk_end) = pos.checked_add(size) else {
            return Chunked::Incomplete;
        };
        let Some(frame_end) = chunk_end.checked_add(CRLF.len()) else {
            return Chunked::Incomplete;
        };
        if data.len() < frame_end {
            return Chunked::Incomplete;
        }
        if &data[chunk_end..frame_end] != CRLF {
            return Chunked::Malformed {
                consumed: frame_end,
                reason: format!("chunk of {size} bytes not followed by CRLF at offset {chunk_end}"),
            };
        }

        if size == 0 {
            let body = chunks
                .iter()
                .flat_map(|&(start, end)| data[start..end].iter().copied())
                .collect();
            return Chunked::Complete {
                body,
                consumed: frame_end,
            };
        }
        chunks.push((pos, chunk_end));
        pos = frame_end;
    }
}

fn chunk_size(line: &[u8]) -> usize {
    let line = String::from_utf8_lossy(line);
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16).unwrap_or(0)
}

// =============================================================================
// Header Fields
// =============================================================================

fn header_fields(head: &str) -> impl Iterator<Item = (&str, &str)> {
    head.split("\r\n").skip(1).filter_map(|line| {
        let (name, value) = line.split_once(':')?;
        Some((name.trim(), value.trim()))
    })
}

fn find_header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    header_fields(head)
        .find(|(field, _)| field.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}
