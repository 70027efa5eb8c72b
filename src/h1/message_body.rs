//! HTTP/1.x message-body framing (RFC 7230 Section 3.3).
//!
//! Framing is selected once per request from the parsed headers and is
//! immutable for the request's lifetime.

use bytes::Bytes;

use crate::buf::RecvBuffer;
use crate::types::{BadRequest, HeaderMap, HttpVersion, Method, RejectionReason};

/// The four framing modes for an HTTP/1.x request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No payload.
    Zero,
    /// Exactly this many bytes follow the header section.
    ContentLength(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Raw passthrough after a protocol upgrade.
    Upgrade,
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get_all("connection")
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
}

/// Select the body framing mode for a parsed request.
pub fn select_body_mode(
    method: &Method,
    version: HttpVersion,
    headers: &HeaderMap,
) -> Result<BodyMode, BadRequest> {
    let content_length = parse_content_length(headers)?;

    // Transfer-Encoding takes precedence; the final coding must be chunked.
    let codings: Vec<String> = headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let has_transfer_encoding = !codings.is_empty();
    if has_transfer_encoding && codings.last().map(String::as_str) != Some("chunked") {
        return Err(BadRequest::new(
            RejectionReason::FinalTransferCodingNotChunked,
        ));
    }

    if is_upgrade_request(headers) {
        // An upgrade request must not carry a payload of its own.
        if has_transfer_encoding || content_length.unwrap_or(0) != 0 {
            return Err(BadRequest::new(
                RejectionReason::UpgradeRequestCannotHavePayload,
            ));
        }
        return Ok(BodyMode::Upgrade);
    }

    if has_transfer_encoding {
        return Ok(BodyMode::Chunked);
    }

    match content_length {
        Some(0) => Ok(BodyMode::Zero),
        Some(n) => Ok(BodyMode::ContentLength(n)),
        None => {
            if method.requires_length() {
                // Different status for HTTP/1.0 vs HTTP/1.1.
                let reason = match version {
                    HttpVersion::Http10 => RejectionReason::LengthRequiredHttp10,
                    _ => RejectionReason::LengthRequired,
                };
                Err(BadRequest::new(reason))
            } else {
                Ok(BodyMode::Zero)
            }
        }
    }
}

fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, BadRequest> {
    let mut values = headers.get_all("content-length");
    let first = match values.next() {
        Some(v) => v,
        None => return Ok(None),
    };
    if values.next().is_some() {
        return Err(BadRequest::new(RejectionReason::MultipleContentLengths));
    }
    let parsed = first
        .parse::<u64>()
        .map_err(|_| BadRequest::new(RejectionReason::InvalidContentLength))?;
    Ok(Some(parsed))
}

/// Progress of incremental chunked decoding.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkedProgress {
    /// A run of body bytes became available.
    Data(Bytes),
    /// The buffer is exhausted mid-element.
    NeedMore,
    /// Terminal chunk and trailer section fully consumed.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
    Done,
}

/// Incremental decoder for the chunked transfer coding. Feed it the receive
/// buffer whenever bytes arrive; it consumes what it understands.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

const MAX_CHUNK_SIZE_LINE: usize = 1024;

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn decode(&mut self, buf: &mut RecvBuffer) -> Result<ChunkedProgress, BadRequest> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let lf = match buf.find(0, b'\n') {
                        Some(lf) => lf,
                        None => {
                            if buf.len() > MAX_CHUNK_SIZE_LINE {
                                return Err(BadRequest::new(RejectionReason::BadChunkSizeData));
                            }
                            return Ok(ChunkedProgress::NeedMore);
                        }
                    };
                    if lf == 0 || buf.get(lf - 1) != Some(b'\r') {
                        return Err(BadRequest::new(RejectionReason::BadChunkSizeData));
                    }
                    let line = buf.slice(0, lf - 1);
                    let size = parse_chunk_size(&line)?;
                    buf.consume(lf + 1);
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(ChunkedProgress::NeedMore);
                    }
                    let take = (buf.len() as u64).min(remaining) as usize;
                    let data = buf.take(take);
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data { remaining: left }
                    };
                    return Ok(ChunkedProgress::Data(data));
                }
                ChunkState::DataCrlf => match buf.pair_at(0) {
                    None => return Ok(ChunkedProgress::NeedMore),
                    Some((b'\r', b'\n')) => {
                        buf.consume(2);
                        self.state = ChunkState::Size;
                    }
                    Some(_) => {
                        return Err(BadRequest::new(RejectionReason::InvalidChunkSuffix));
                    }
                },
                ChunkState::Trailers => {
                    let lf = match buf.find(0, b'\n') {
                        Some(lf) => lf,
                        None => return Ok(ChunkedProgress::NeedMore),
                    };
                    if lf == 0 || buf.get(lf - 1) != Some(b'\r') {
                        return Err(BadRequest::new(RejectionReason::InvalidChunkSuffix));
                    }
                    let blank = lf == 1;
                    buf.consume(lf + 1);
                    if blank {
                        self.state = ChunkState::Done;
                        return Ok(ChunkedProgress::Done);
                    }
                    // Trailer fields are consumed and discarded.
                }
                ChunkState::Done => return Ok(ChunkedProgress::Done),
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, BadRequest> {
    // Chunk extensions after ';' are tolerated and ignored.
    let digits = match line.iter().position(|&b| b == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    if digits.is_empty() || digits.len() > 16 {
        return Err(BadRequest::new(RejectionReason::InvalidChunkSize));
    }
    let mut size: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(BadRequest::new(RejectionReason::InvalidChunkSize)),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or_else(|| BadRequest::new(RejectionReason::InvalidChunkSize))?;
    }
    Ok(size)
}
