//! HTTP/1.x request-line and header parser.
//!
//! Operates on the segmented receive buffer: a line is located by scanning
//! for its LF across segment boundaries, so a CRLF split across two transport
//! reads never produces a false "incomplete". Discovered lines are surfaced
//! to the caller through handler callbacks; the parser consumes bytes from
//! the buffer as lines complete.

use bytes::Bytes;

use crate::buf::RecvBuffer;
use crate::types::{BadRequest, HttpVersion, Method, RejectionReason};

/// Known methods matched by fixed-length prefix, trailing space included so a
/// match also consumes the delimiter. Anything unmatched falls back to a
/// token scan for a custom method.
const KNOWN_METHODS: &[(&[u8], Method)] = &[
    (b"GET ", Method::Get),
    (b"PUT ", Method::Put),
    (b"POST ", Method::Post),
    (b"HEAD ", Method::Head),
    (b"TRACE ", Method::Trace),
    (b"PATCH ", Method::Patch),
    (b"DELETE ", Method::Delete),
    (b"CONNECT ", Method::Connect),
    (b"OPTIONS ", Method::Options),
];

/// RFC 7230 tchar.
fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub path: Bytes,
    pub query: Bytes,
    pub version: HttpVersion,
    /// `%` occurred somewhere in the path; downstream decides whether to
    /// percent-decode.
    pub path_encoded: bool,
}

/// "Not enough data yet" is not an error: the caller resupplies bytes and
/// retries.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<T> {
    Complete(T),
    Incomplete,
}

/// Callback target for discovered header lines.
pub trait HeaderHandler {
    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), BadRequest>;
}

#[derive(Debug, Clone)]
pub struct ByteStreamParser {
    pub max_request_line_size: usize,
    pub max_headers_total_size: usize,
    pub max_header_count: usize,
    pub show_error_details: bool,
}

/// Running totals for one request's header section, reset per request.
#[derive(Debug, Default)]
pub struct HeaderParseState {
    pub count: usize,
    pub total_size: usize,
}

impl ByteStreamParser {
    fn reject(&self, reason: RejectionReason, raw: &[u8]) -> BadRequest {
        BadRequest::with_detail(reason, raw, self.show_error_details)
    }

    /// Locate the next complete line: returns the offset of its LF. A line
    /// must terminate in exactly CRLF; a bare LF is a malformed line.
    fn find_line_end(
        &self,
        buf: &RecvBuffer,
        malformed: RejectionReason,
    ) -> Result<ParseResult<usize>, BadRequest> {
        match buf.find(0, b'\n') {
            None => Ok(ParseResult::Incomplete),
            Some(lf) => {
                if lf == 0 || buf.get(lf - 1) != Some(b'\r') {
                    let line = buf.slice(0, lf.min(64));
                    return Err(self.reject(malformed, &line));
                }
                Ok(ParseResult::Complete(lf))
            }
        }
    }

    /// Parse one request line, consuming it (CRLF included) on success.
    pub fn parse_request_line(
        &self,
        buf: &mut RecvBuffer,
    ) -> Result<ParseResult<RequestLine>, BadRequest> {
        let lf = match self.find_line_end(buf, RejectionReason::InvalidRequestLine)? {
            ParseResult::Complete(lf) => lf,
            ParseResult::Incomplete => {
                // No LF in sight; an over-long prefix is already fatal.
                if buf.len() > self.max_request_line_size {
                    let head = buf.slice(0, 64.min(buf.len()));
                    return Err(self.reject(RejectionReason::RequestLineTooLong, &head));
                }
                return Ok(ParseResult::Incomplete);
            }
        };

        if lf + 1 > self.max_request_line_size {
            let head = buf.slice(0, 64.min(buf.len()));
            return Err(self.reject(RejectionReason::RequestLineTooLong, &head));
        }

        let line = buf.slice(0, lf - 1);
        let parsed = self.parse_request_line_bytes(&line)?;
        buf.consume(lf + 1);
        Ok(ParseResult::Complete(parsed))
    }

    fn parse_request_line_bytes(&self, line: &[u8]) -> Result<RequestLine, BadRequest> {
        // Method: fixed-prefix table first, custom token scan otherwise.
        let (method, mut at) = match KNOWN_METHODS
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix))
        {
            Some((prefix, method)) => (method.clone(), prefix.len()),
            None => {
                let end = line
                    .iter()
                    .position(|&b| !is_token_char(b))
                    .unwrap_or(line.len());
                if end == 0 || line.get(end) != Some(&b' ') {
                    return Err(self.reject(RejectionReason::InvalidMethod, line));
                }
                // Token bytes only, always valid UTF-8.
                let token = String::from_utf8(line[..end].to_vec())
                    .map_err(|_| self.reject(RejectionReason::InvalidMethod, line))?;
                (Method::Custom(token), end + 1)
            }
        };

        // Request target up to the next space; query starts at the first `?`.
        let rest = &line[at..];
        let target_end = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| self.reject(RejectionReason::InvalidRequestLine, line))?;
        let target = &rest[..target_end];
        if target.is_empty() || target[0] == b'%' {
            return Err(self.reject(RejectionReason::InvalidRequestTarget, line));
        }
        if target.iter().any(|&b| b <= 0x20 || b == 0x7f) {
            return Err(self.reject(RejectionReason::InvalidRequestTarget, line));
        }
        let (path, query) = match target.iter().position(|&b| b == b'?') {
            Some(q) => (&target[..q], &target[q + 1..]),
            None => (target, &[][..]),
        };
        let path_encoded = path.contains(&b'%');
        at += target_end + 1;

        // Version: exactly one of the two 8-byte patterns.
        let version = match &line[at..] {
            b"HTTP/1.1" => HttpVersion::Http11,
            b"HTTP/1.0" => HttpVersion::Http10,
            _ => return Err(self.reject(RejectionReason::UnrecognizedHttpVersion, line)),
        };

        Ok(RequestLine {
            method,
            path: Bytes::copy_from_slice(path),
            query: Bytes::copy_from_slice(query),
            version,
            path_encoded,
        })
    }

    /// Parse header lines up to and including the terminal blank line,
    /// invoking `handler` per discovered header. Consumes complete lines as
    /// it goes; `Incomplete` means every fully received line was handled and
    /// more bytes are needed.
    pub fn parse_headers<H: HeaderHandler>(
        &self,
        buf: &mut RecvBuffer,
        state: &mut HeaderParseState,
        handler: &mut H,
    ) -> Result<ParseResult<()>, BadRequest> {
        loop {
            // Terminal blank line fast path; the pair may straddle segments.
            if buf.pair_at(0) == Some((b'\r', b'\n')) {
                buf.consume(2);
                return Ok(ParseResult::Complete(()));
            }

            let lf = match self.find_line_end(buf, RejectionReason::InvalidHeaderValue)? {
                ParseResult::Complete(lf) => lf,
                ParseResult::Incomplete => {
                    if state.total_size + buf.len() > self.max_headers_total_size {
                        return Err(BadRequest::new(RejectionReason::HeadersExceedMaxTotalSize));
                    }
                    return Ok(ParseResult::Incomplete);
                }
            };

            state.total_size += lf + 1;
            if state.total_size > self.max_headers_total_size {
                return Err(BadRequest::new(RejectionReason::HeadersExceedMaxTotalSize));
            }
            state.count += 1;
            if state.count > self.max_header_count {
                return Err(BadRequest::new(RejectionReason::TooManyHeaders));
            }

            let line = buf.slice(0, lf - 1);
            self.parse_header_line(&line, handler)?;
            buf.consume(lf + 1);
        }
    }

    fn parse_header_line<H: HeaderHandler>(
        &self,
        line: &[u8],
        handler: &mut H,
    ) -> Result<(), BadRequest> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| self.reject(RejectionReason::InvalidHeaderName, line))?;
        let name = &line[..colon];

        // A name is whitespace-free, CR-free and non-empty.
        if name.is_empty()
            || name
                .iter()
                .any(|&b| b == b' ' || b == b'\t' || b == b'\r')
        {
            return Err(self.reject(RejectionReason::InvalidHeaderName, line));
        }

        let mut value = &line[colon + 1..];
        // Embedded CR mid-value is disallowed outright.
        if value.contains(&b'\r') {
            return Err(self.reject(RejectionReason::InvalidHeaderValue, line));
        }
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        while value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
            value = &value[..value.len() - 1];
        }

        handler.on_header(name, value)
    }
}
