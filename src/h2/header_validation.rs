//! Post-HPACK header field validation (RFC 7540 Section 8.1.2).
//!
//! Runs per decoded field while a header block is being consumed. Every
//! violation here is connection-level: the HPACK decompression state is
//! shared across streams and cannot be partially unwound once a block has
//! been fed through the decoder.

use crate::h2::consts::HEADER_FIELD_OVERHEAD;
use crate::types::{ConnectionError, Http2ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBlockKind {
    Headers,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PseudoHeader {
    Method,
    Path,
    Scheme,
    Authority,
    Status,
}

impl PseudoHeader {
    fn parse(name: &[u8]) -> Option<Self> {
        match name {
            b":method" => Some(PseudoHeader::Method),
            b":path" => Some(PseudoHeader::Path),
            b":scheme" => Some(PseudoHeader::Scheme),
            b":authority" => Some(PseudoHeader::Authority),
            b":status" => Some(PseudoHeader::Status),
            _ => None,
        }
    }

    fn bit(&self) -> u8 {
        match self {
            PseudoHeader::Method => 1 << 0,
            PseudoHeader::Path => 1 << 1,
            PseudoHeader::Scheme => 1 << 2,
            PseudoHeader::Authority => 1 << 3,
            PseudoHeader::Status => 1 << 4,
        }
    }
}

#[derive(Debug)]
pub struct HeaderValidationState {
    max_header_list_size: usize,
    kind: HeaderBlockKind,
    total_size: usize,
    seen_regular: bool,
    seen_pseudo: u8,
    is_connect: bool,
}

fn protocol_error(message: impl Into<String>) -> ConnectionError {
    ConnectionError::new(Http2ErrorCode::ProtocolError, message)
}

impl HeaderValidationState {
    pub fn new(max_header_list_size: usize) -> Self {
        Self {
            max_header_list_size,
            kind: HeaderBlockKind::Headers,
            total_size: 0,
            seen_regular: false,
            seen_pseudo: 0,
            is_connect: false,
        }
    }

    /// Reset ahead of a new header block.
    pub fn reset(&mut self, kind: HeaderBlockKind) {
        self.kind = kind;
        self.total_size = 0;
        self.seen_regular = false;
        self.seen_pseudo = 0;
        self.is_connect = false;
    }

    /// CONNECT requests waive the `:path`/`:scheme` requirement.
    pub fn is_connect(&self) -> bool {
        self.is_connect
    }

    /// Mandatory request pseudo-headers present once decoding finished?
    pub fn has_required_pseudo_headers(&self) -> bool {
        let method = PseudoHeader::Method.bit();
        if self.is_connect {
            return self.seen_pseudo & method != 0;
        }
        let required = method | PseudoHeader::Path.bit() | PseudoHeader::Scheme.bit();
        self.seen_pseudo & required == required
    }

    /// Validate one decoded field, in the order the checks are specified:
    /// size accounting, pseudo-header rules, connection-specific bans,
    /// lowercase-name requirement.
    pub fn validate(&mut self, name: &[u8], value: &[u8]) -> Result<(), ConnectionError> {
        self.total_size = self
            .total_size
            .saturating_add(name.len() + value.len() + HEADER_FIELD_OVERHEAD);
        if self.total_size > self.max_header_list_size {
            return Err(protocol_error("HeadersExceedMaxSize"));
        }

        if name.starts_with(b":") {
            let pseudo = PseudoHeader::parse(name)
                .ok_or_else(|| protocol_error("UnknownPseudoHeaderField"))?;

            if self.kind == HeaderBlockKind::Trailers {
                return Err(protocol_error("PseudoHeaderFieldInTrailers"));
            }
            if self.seen_regular {
                return Err(protocol_error("PseudoHeaderFieldAfterRegularHeaders"));
            }
            if pseudo == PseudoHeader::Status {
                return Err(protocol_error("ResponsePseudoHeaderFieldInRequest"));
            }
            if self.seen_pseudo & pseudo.bit() != 0 {
                return Err(protocol_error("DuplicatePseudoHeaderField"));
            }
            self.seen_pseudo |= pseudo.bit();

            if pseudo == PseudoHeader::Method && value == b"CONNECT" {
                self.is_connect = true;
            }
            return Ok(());
        }

        self.seen_regular = true;

        if name.eq_ignore_ascii_case(b"connection") {
            return Err(protocol_error("ConnectionSpecificHeaderField"));
        }
        if name.eq_ignore_ascii_case(b"te") && value != b"trailers" {
            return Err(protocol_error("ConnectionSpecificHeaderField"));
        }

        if name.iter().any(u8::is_ascii_uppercase) {
            // Same fatal treatment, distinct diagnostic for trailers.
            return Err(match self.kind {
                HeaderBlockKind::Headers => protocol_error("HeaderNameContainsUpperCase"),
                HeaderBlockKind::Trailers => protocol_error("TrailerNameContainsUpperCase"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> HeaderValidationState {
        HeaderValidationState::new(16 * 1024)
    }

    #[test]
    fn pseudo_after_regular_is_rejected_for_every_pseudo() {
        for pseudo in [b":method".as_ref(), b":path", b":scheme", b":authority"] {
            let mut v = state();
            v.validate(b"accept", b"*/*").unwrap();
            let err = v.validate(pseudo, b"x").unwrap_err();
            assert_eq!(err.message, "PseudoHeaderFieldAfterRegularHeaders");
        }
    }

    #[test]
    fn duplicate_pseudo_header_is_rejected() {
        let mut v = state();
        v.validate(b":path", b"/a").unwrap();
        let err = v.validate(b":path", b"/b").unwrap_err();
        assert_eq!(err.message, "DuplicatePseudoHeaderField");
        assert_eq!(err.code, Http2ErrorCode::ProtocolError);
    }

    #[test]
    fn status_is_forbidden_in_requests() {
        let mut v = state();
        let err = v.validate(b":status", b"200").unwrap_err();
        assert_eq!(err.message, "ResponsePseudoHeaderFieldInRequest");
    }

    #[test]
    fn pseudo_headers_forbidden_in_trailers() {
        let mut v = state();
        v.reset(HeaderBlockKind::Trailers);
        let err = v.validate(b":method", b"GET").unwrap_err();
        assert_eq!(err.message, "PseudoHeaderFieldInTrailers");
    }

    #[test]
    fn unknown_pseudo_header_is_malformed() {
        let mut v = state();
        assert!(v.validate(b":proto", b"x").is_err());
    }

    #[test]
    fn connection_specific_fields_are_banned() {
        let mut v = state();
        assert!(v.validate(b"connection", b"keep-alive").is_err());

        let mut v = state();
        assert!(v.validate(b"te", b"gzip").is_err());

        let mut v = state();
        assert!(v.validate(b"te", b"trailers").is_ok());
    }

    #[test]
    fn uppercase_names_are_malformed_with_trailer_diagnostic() {
        let mut v = state();
        let err = v.validate(b"Accept", b"*/*").unwrap_err();
        assert_eq!(err.message, "HeaderNameContainsUpperCase");

        let mut v = state();
        v.reset(HeaderBlockKind::Trailers);
        let err = v.validate(b"X-Sum", b"1").unwrap_err();
        assert_eq!(err.message, "TrailerNameContainsUpperCase");
    }

    #[test]
    fn size_accounting_includes_per_field_overhead() {
        let mut v = HeaderValidationState::new(100);
        // 30 + 30 + 32 = 92 fits; a second field crosses the limit.
        v.validate(&[b'a'; 30], &[b'b'; 30]).unwrap();
        let err = v.validate(b"x", b"y").unwrap_err();
        assert_eq!(err.message, "HeadersExceedMaxSize");
    }

    #[test]
    fn connect_waives_path_and_scheme() {
        let mut v = state();
        v.validate(b":method", b"CONNECT").unwrap();
        v.validate(b":authority", b"example.com:443").unwrap();
        assert!(v.is_connect());
        assert!(v.has_required_pseudo_headers());

        let mut v = state();
        v.validate(b":method", b"GET").unwrap();
        assert!(!v.has_required_pseudo_headers());
        v.validate(b":path", b"/").unwrap();
        v.validate(b":scheme", b"https").unwrap();
        assert!(v.has_required_pseudo_headers());
    }
}
