use thiserror::Error;

/// Reason a request was rejected before (or while) being handed to the
/// application. Each reason maps to exactly one HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    // Request line
    InvalidRequestLine,
    InvalidMethod,
    InvalidRequestTarget,
    RequestLineTooLong,
    UnrecognizedHttpVersion,
    // Headers
    InvalidHeaderName,
    InvalidHeaderValue,
    HeadersExceedMaxTotalSize,
    TooManyHeaders,
    MissingHostHeader,
    MultipleHostHeaders,
    // Body framing
    MultipleContentLengths,
    InvalidContentLength,
    FinalTransferCodingNotChunked,
    LengthRequired,
    LengthRequiredHttp10,
    UpgradeRequestCannotHavePayload,
    InvalidChunkSize,
    InvalidChunkSuffix,
    BadChunkSizeData,
    RequestBodyTooLarge,
    UnexpectedEndOfRequestContent,
    // Timeouts surfaced as rejections
    RequestHeadersTimeout,
    RequestBodyTimeout,
}

impl RejectionReason {
    /// The status code reported to a well-formed-enough client.
    pub fn status_code(&self) -> u16 {
        match self {
            RejectionReason::LengthRequired => 411,
            RejectionReason::RequestBodyTooLarge => 413,
            RejectionReason::RequestLineTooLong => 414,
            RejectionReason::HeadersExceedMaxTotalSize | RejectionReason::TooManyHeaders => 431,
            RejectionReason::UnrecognizedHttpVersion => 505,
            RejectionReason::RequestHeadersTimeout | RejectionReason::RequestBodyTimeout => 408,
            _ => 400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InvalidRequestLine => "InvalidRequestLine",
            RejectionReason::InvalidMethod => "InvalidMethod",
            RejectionReason::InvalidRequestTarget => "InvalidRequestTarget",
            RejectionReason::RequestLineTooLong => "RequestLineTooLong",
            RejectionReason::UnrecognizedHttpVersion => "UnrecognizedHttpVersion",
            RejectionReason::InvalidHeaderName => "InvalidHeaderName",
            RejectionReason::InvalidHeaderValue => "InvalidHeaderValue",
            RejectionReason::HeadersExceedMaxTotalSize => "HeadersExceedMaxTotalSize",
            RejectionReason::TooManyHeaders => "TooManyHeaders",
            RejectionReason::MissingHostHeader => "MissingHostHeader",
            RejectionReason::MultipleHostHeaders => "MultipleHostHeaders",
            RejectionReason::MultipleContentLengths => "MultipleContentLengths",
            RejectionReason::InvalidContentLength => "InvalidContentLength",
            RejectionReason::FinalTransferCodingNotChunked => "FinalTransferCodingNotChunked",
            RejectionReason::LengthRequired => "LengthRequired",
            RejectionReason::LengthRequiredHttp10 => "LengthRequiredHttp10",
            RejectionReason::UpgradeRequestCannotHavePayload => "UpgradeRequestCannotHavePayload",
            RejectionReason::InvalidChunkSize => "InvalidChunkSize",
            RejectionReason::InvalidChunkSuffix => "InvalidChunkSuffix",
            RejectionReason::BadChunkSizeData => "BadChunkSizeData",
            RejectionReason::RequestBodyTooLarge => "RequestBodyTooLarge",
            RejectionReason::UnexpectedEndOfRequestContent => "UnexpectedEndOfRequestContent",
            RejectionReason::RequestHeadersTimeout => "RequestHeadersTimeout",
            RejectionReason::RequestBodyTimeout => "RequestBodyTimeout",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed client-facing rejection: machine-readable reason plus the status
/// code it maps to. Detail text is attached only when the server is configured
/// to show error details, and is escaped and length-capped before storage.
#[derive(Debug, Clone, Error)]
#[error("bad request: {reason} ({})", detail.as_deref().unwrap_or("<redacted>"))]
pub struct BadRequest {
    pub reason: RejectionReason,
    pub detail: Option<String>,
}

impl BadRequest {
    pub fn new(reason: RejectionReason) -> Self {
        Self {
            reason,
            detail: None,
        }
    }

    /// Attach offending input as detail, only when `show_details` is set.
    pub fn with_detail(reason: RejectionReason, raw: &[u8], show_details: bool) -> Self {
        let detail = show_details.then(|| escape_detail(raw));
        Self { reason, detail }
    }

    pub fn status_code(&self) -> u16 {
        self.reason.status_code()
    }
}

const MAX_DETAIL_LEN: usize = 128;

/// Printable-escape raw client bytes for log/diagnostic output, capped so a
/// hostile request line cannot balloon a log record.
pub fn escape_detail(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_DETAIL_LEN));
    for &b in raw.iter() {
        if out.len() >= MAX_DETAIL_LEN {
            out.push_str("...");
            break;
        }
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl From<u32> for Http2ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => Http2ErrorCode::NoError,
            0x1 => Http2ErrorCode::ProtocolError,
            0x2 => Http2ErrorCode::InternalError,
            0x3 => Http2ErrorCode::FlowControlError,
            0x4 => Http2ErrorCode::SettingsTimeout,
            0x5 => Http2ErrorCode::StreamClosed,
            0x6 => Http2ErrorCode::FrameSizeError,
            0x7 => Http2ErrorCode::RefusedStream,
            0x8 => Http2ErrorCode::Cancel,
            0x9 => Http2ErrorCode::CompressionError,
            0xa => Http2ErrorCode::ConnectError,
            0xb => Http2ErrorCode::EnhanceYourCalm,
            0xc => Http2ErrorCode::InadequateSecurity,
            0xd => Http2ErrorCode::Http11Required,
            _ => Http2ErrorCode::InternalError,
        }
    }
}

impl std::fmt::Display for Http2ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Http2ErrorCode::NoError => "NO_ERROR",
            Http2ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            Http2ErrorCode::InternalError => "INTERNAL_ERROR",
            Http2ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            Http2ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            Http2ErrorCode::StreamClosed => "STREAM_CLOSED",
            Http2ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            Http2ErrorCode::RefusedStream => "REFUSED_STREAM",
            Http2ErrorCode::Cancel => "CANCEL",
            Http2ErrorCode::CompressionError => "COMPRESSION_ERROR",
            Http2ErrorCode::ConnectError => "CONNECT_ERROR",
            Http2ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Http2ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            Http2ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        };
        write!(f, "{} (0x{:x})", name, *self as u32)
    }
}

/// A connection-fatal HTTP/2 violation: shared state (header decompression,
/// frame dispatch, settings/window accounting) can no longer be trusted.
/// Triggers GOAWAY with `code`, then teardown of every stream.
#[derive(Debug, Clone, Error)]
#[error("http/2 connection error {code}: {message}")]
pub struct ConnectionError {
    pub code: Http2ErrorCode,
    pub message: String,
}

impl ConnectionError {
    pub fn new(code: Http2ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A violation isolated to one stream: RST_STREAM is sent for that stream id
/// and the connection continues.
#[derive(Debug, Clone, Error)]
#[error("http/2 stream {stream_id} error {code}: {message}")]
pub struct StreamError {
    pub stream_id: u32,
    pub code: Http2ErrorCode,
    pub message: String,
}

impl StreamError {
    pub fn new(stream_id: u32, code: Http2ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stream_id,
            code,
            message: message.into(),
        }
    }
}

/// Tagged result values flowing back to the HTTP/2 dispatch loop instead of
/// unwinding; the loop decides GOAWAY vs RST_STREAM from the tag.
#[derive(Debug, Error)]
pub enum Http2Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Top-level error surface of both engines.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BadRequest(#[from] BadRequest),
    #[error(transparent)]
    Http2(#[from] Http2Error),
    #[error("connection timed out: {0}")]
    Timeout(&'static str),
    #[error("request aborted")]
    RequestAborted,
    #[error("connection aborted: {0}")]
    ConnectionAborted(String),
    #[error("application error: {0}")]
    Application(String),
}

impl From<ConnectionError> for ServerError {
    fn from(err: ConnectionError) -> Self {
        ServerError::Http2(Http2Error::Connection(err))
    }
}

impl From<StreamError> for ServerError {
    fn from(err: StreamError) -> Self {
        ServerError::Http2(Http2Error::Stream(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(RejectionReason::LengthRequired.status_code(), 411);
        assert_eq!(RejectionReason::LengthRequiredHttp10.status_code(), 400);
        assert_eq!(RejectionReason::RequestLineTooLong.status_code(), 414);
        assert_eq!(RejectionReason::HeadersExceedMaxTotalSize.status_code(), 431);
        assert_eq!(RejectionReason::UnrecognizedHttpVersion.status_code(), 505);
        assert_eq!(
            RejectionReason::FinalTransferCodingNotChunked.status_code(),
            400
        );
        assert_eq!(RejectionReason::RequestBodyTooLarge.status_code(), 413);
    }

    #[test]
    fn detail_only_when_enabled() {
        let with = BadRequest::with_detail(RejectionReason::InvalidRequestLine, b"GET /\r\n", true);
        assert_eq!(with.detail.as_deref(), Some("GET /\\r\\n"));

        let without =
            BadRequest::with_detail(RejectionReason::InvalidRequestLine, b"GET /\r\n", false);
        assert!(without.detail.is_none());
    }

    #[test]
    fn detail_is_escaped_and_capped() {
        let raw = vec![0xffu8; 400];
        let escaped = escape_detail(&raw);
        assert!(escaped.len() <= MAX_DETAIL_LEN + 8);
        assert!(escaped.starts_with("\\xff"));
        assert!(escaped.ends_with("..."));
    }

    #[test]
    fn error_code_u32_roundtrip() {
        for code in 0u32..=0xd {
            let parsed = Http2ErrorCode::from(code);
            assert_eq!(parsed as u32, code);
        }
        assert_eq!(Http2ErrorCode::from(0x99), Http2ErrorCode::InternalError);
    }
}
