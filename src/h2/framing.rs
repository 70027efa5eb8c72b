//! HTTP/2 frame codec (RFC 7540 Section 4 and 6).
//!
//! Frame format:
//! ```text
//!  +-----------------------------------------------+
//!  |                 Length (24)                   |
//!  +---------------+---------------+---------------+
//!  |   Type (8)    |   Flags (8)   |
//!  +-+-------------+---------------+---------------+
//!  |R|                 Stream Identifier (31)      |
//!  +=+=============================================+
//!  |                   Frame Payload (0...)      ...
//!  +-----------------------------------------------+
//! ```
//!
//! Decoding splits in two: the fixed 9-byte header first (so oversized frames
//! are rejected before their payload is consumed), then the type-specific
//! extended fields and padding once the payload is available. Pure functions
//! over byte spans; no I/O here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::h2::consts::{
    ACK_FLAG, END_HEADERS_FLAG, END_STREAM_FLAG, FRAME_HEADER_SIZE, PADDED_FLAG, PRIORITY_FLAG,
    SETTINGS_RECORD_SIZE,
};
use crate::types::{
    ConnectionError, Http2Error, Http2ErrorCode, Http2Frame, Http2FrameType, PriorityInfo,
    StreamError,
};

/// Decoded 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_length: usize,
    pub frame_type: Http2FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

/// Decode the fixed frame header. The reserved top bit of the stream id is
/// ignored on receipt.
pub fn decode_frame_header(raw: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
    let payload_length =
        ((raw[0] as usize) << 16) | ((raw[1] as usize) << 8) | (raw[2] as usize);
    let frame_type = Http2FrameType::from_u8(raw[3]);
    let flags = raw[4];
    let stream_id = (((raw[5] as u32) << 24)
        | ((raw[6] as u32) << 16)
        | ((raw[7] as u32) << 8)
        | (raw[8] as u32))
        & 0x7FFF_FFFF;
    FrameHeader {
        payload_length,
        frame_type,
        flags,
        stream_id,
    }
}

fn connection_error(message: impl Into<String>, code: Http2ErrorCode) -> Http2Error {
    Http2Error::Connection(ConnectionError::new(code, message))
}

/// Decode the payload of `frame` (whose header fields were set via
/// [`Http2Frame::prepare`]), populating the type-specific fields and
/// stripping pad length, priority fields, and padding from `payload`.
pub fn decode_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    debug_assert_eq!(payload.len(), frame.payload_length);
    match frame.frame_type {
        Http2FrameType::Data => decode_data_payload(frame, payload),
        Http2FrameType::Headers => decode_headers_payload(frame, payload),
        Http2FrameType::Priority => decode_priority_payload(frame, payload),
        Http2FrameType::RstStream => decode_rst_stream_payload(frame, payload),
        Http2FrameType::Settings => decode_settings_payload(frame, payload),
        Http2FrameType::Ping => decode_ping_payload(frame, payload),
        Http2FrameType::GoAway => decode_goaway_payload(frame, payload),
        Http2FrameType::WindowUpdate => decode_window_update_payload(frame, payload),
        // CONTINUATION, PUSH_PROMISE and unknown types carry their payload
        // verbatim; semantic checks live in the dispatch loop.
        _ => {
            frame.payload = payload;
            Ok(())
        }
    }
}

fn strip_padding(frame: &mut Http2Frame, payload: &Bytes, offset: usize) -> Result<(usize, usize), Http2Error> {
    let mut offset = offset;
    let mut pad_length = 0usize;
    if frame.is_padded() {
        if payload.len() <= offset {
            return Err(connection_error(
                "PADDED flag set but no pad length present",
                Http2ErrorCode::ProtocolError,
            ));
        }
        pad_length = payload[offset] as usize;
        offset += 1;
    }
    if pad_length > payload.len().saturating_sub(offset) {
        return Err(connection_error(
            "padding exceeds frame payload",
            Http2ErrorCode::ProtocolError,
        ));
    }
    frame.pad_length = pad_length as u8;
    Ok((offset, payload.len() - pad_length))
}

fn decode_data_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    let (offset, end) = strip_padding(frame, &payload, 0)?;
    frame.payload = payload.slice(offset..end);
    Ok(())
}

fn read_priority(raw: &[u8]) -> PriorityInfo {
    let word =
        ((raw[0] as u32) << 24) | ((raw[1] as u32) << 16) | ((raw[2] as u32) << 8) | (raw[3] as u32);
    PriorityInfo {
        exclusive: (word & 0x8000_0000) != 0,
        dependency: word & 0x7FFF_FFFF,
        weight: raw[4],
    }
}

fn decode_headers_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    let (mut offset, end) = strip_padding(frame, &payload, 0)?;
    if frame.has_priority() {
        if end.saturating_sub(offset) < 5 {
            return Err(connection_error(
                "HEADERS priority fields truncated",
                Http2ErrorCode::FrameSizeError,
            ));
        }
        frame.priority = Some(read_priority(&payload[offset..offset + 5]));
        offset += 5;
    }
    frame.payload = payload.slice(offset..end);
    Ok(())
}

fn decode_priority_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    if payload.len() != 5 {
        // A malformed PRIORITY frame is scoped to the stream it names.
        return Err(Http2Error::Stream(StreamError::new(
            frame.stream_id,
            Http2ErrorCode::FrameSizeError,
            "PRIORITY frame payload must be 5 bytes",
        )));
    }
    frame.priority = Some(read_priority(&payload[..]));
    frame.payload = payload;
    Ok(())
}

fn decode_rst_stream_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    if payload.len() != 4 {
        return Err(connection_error(
            "RST_STREAM frame payload must be 4 bytes",
            Http2ErrorCode::FrameSizeError,
        ));
    }
    frame.error_code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    frame.payload = payload;
    Ok(())
}

fn decode_settings_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    if frame.is_ack() {
        if !payload.is_empty() {
            return Err(connection_error(
                "SETTINGS ACK must have an empty payload",
                Http2ErrorCode::FrameSizeError,
            ));
        }
    } else if payload.len() % SETTINGS_RECORD_SIZE != 0 {
        return Err(connection_error(
            "SETTINGS payload must be a multiple of 6 bytes",
            Http2ErrorCode::FrameSizeError,
        ));
    }
    frame.payload = payload;
    Ok(())
}

/// Iterate the (id, value) records of a non-ack SETTINGS payload.
pub fn settings_records(payload: &[u8]) -> impl Iterator<Item = (u16, u32)> + '_ {
    payload.chunks_exact(SETTINGS_RECORD_SIZE).map(|chunk| {
        let id = u16::from_be_bytes([chunk[0], chunk[1]]);
        let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
        (id, value)
    })
}

fn decode_ping_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    if payload.len() != 8 {
        return Err(connection_error(
            "PING frame payload must be 8 bytes",
            Http2ErrorCode::FrameSizeError,
        ));
    }
    frame.ping_payload.copy_from_slice(&payload);
    frame.payload = payload;
    Ok(())
}

fn decode_goaway_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    if payload.len() < 8 {
        return Err(connection_error(
            "GOAWAY frame payload must be at least 8 bytes",
            Http2ErrorCode::FrameSizeError,
        ));
    }
    frame.goaway_last_stream_id =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
    frame.error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    frame.payload = payload.slice(8..);
    Ok(())
}

fn decode_window_update_payload(frame: &mut Http2Frame, payload: Bytes) -> Result<(), Http2Error> {
    if payload.len() != 4 {
        return Err(connection_error(
            "WINDOW_UPDATE frame payload must be 4 bytes",
            Http2ErrorCode::FrameSizeError,
        ));
    }
    frame.window_increment =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
    frame.payload = payload;
    Ok(())
}

fn put_frame_header(
    out: &mut BytesMut,
    length: usize,
    frame_type: Http2FrameType,
    flags: u8,
    stream_id: u32,
) {
    out.put_u8(((length >> 16) & 0xFF) as u8);
    out.put_u8(((length >> 8) & 0xFF) as u8);
    out.put_u8((length & 0xFF) as u8);
    out.put_u8(frame_type.as_u8());
    out.put_u8(flags);
    out.put_u32(stream_id & 0x7FFF_FFFF);
}

pub fn encode_data(stream_id: u32, data: &[u8], end_stream: bool) -> Bytes {
    let flags = if end_stream { END_STREAM_FLAG } else { 0 };
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + data.len());
    put_frame_header(&mut out, data.len(), Http2FrameType::Data, flags, stream_id);
    out.put_slice(data);
    out.freeze()
}

/// Encode a header block as one HEADERS frame plus as many CONTINUATION
/// frames as the peer's max frame size requires.
pub fn encode_headers(
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut rest = block;
    let mut first = true;
    loop {
        let take = rest.len().min(max_frame_size);
        let (chunk, tail) = rest.split_at(take);
        rest = tail;

        let mut flags = 0u8;
        if first && end_stream {
            flags |= END_STREAM_FLAG;
        }
        if rest.is_empty() {
            flags |= END_HEADERS_FLAG;
        }
        let frame_type = if first {
            Http2FrameType::Headers
        } else {
            Http2FrameType::Continuation
        };

        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + chunk.len());
        put_frame_header(&mut out, chunk.len(), frame_type, flags, stream_id);
        out.put_slice(chunk);
        frames.push(out.freeze());

        if rest.is_empty() {
            return frames;
        }
        first = false;
    }
}

pub fn encode_priority(stream_id: u32, priority: PriorityInfo) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
    put_frame_header(&mut out, 5, Http2FrameType::Priority, 0, stream_id);
    let mut word = priority.dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        word |= 0x8000_0000;
    }
    out.put_u32(word);
    out.put_u8(priority.weight);
    out.freeze()
}

pub fn encode_rst_stream(stream_id: u32, code: Http2ErrorCode) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
    put_frame_header(&mut out, 4, Http2FrameType::RstStream, 0, stream_id);
    out.put_u32(code as u32);
    out.freeze()
}

pub fn encode_settings(records: &[(u16, u32)]) -> Bytes {
    let len = records.len() * SETTINGS_RECORD_SIZE;
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + len);
    put_frame_header(&mut out, len, Http2FrameType::Settings, 0, 0);
    for &(id, value) in records {
        out.put_u16(id);
        out.put_u32(value);
    }
    out.freeze()
}

pub fn encode_settings_ack() -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE);
    put_frame_header(&mut out, 0, Http2FrameType::Settings, ACK_FLAG, 0);
    out.freeze()
}

pub fn encode_ping(payload: [u8; 8], ack: bool) -> Bytes {
    let flags = if ack { ACK_FLAG } else { 0 };
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
    put_frame_header(&mut out, 8, Http2FrameType::Ping, flags, 0);
    out.put_slice(&payload);
    out.freeze()
}

pub fn encode_goaway(last_stream_id: u32, code: Http2ErrorCode, debug_data: &[u8]) -> Bytes {
    let len = 8 + debug_data.len();
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + len);
    put_frame_header(&mut out, len, Http2FrameType::GoAway, 0, 0);
    out.put_u32(last_stream_id & 0x7FFF_FFFF);
    out.put_u32(code as u32);
    out.put_slice(debug_data);
    out.freeze()
}

pub fn encode_window_update(stream_id: u32, increment: u32) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
    put_frame_header(&mut out, 4, Http2FrameType::WindowUpdate, 0, stream_id);
    out.put_u32(increment & 0x7FFF_FFFF);
    out.freeze()
}

/// Decode a complete frame from `raw` (header plus payload). Convenience for
/// tests and the in-memory paths; the connection loop decodes header and
/// payload separately so the size check precedes payload reads.
pub fn decode_frame(raw: &[u8]) -> Result<Http2Frame, Http2Error> {
    assert!(raw.len() >= FRAME_HEADER_SIZE, "frame shorter than header");
    let mut header_raw = [0u8; FRAME_HEADER_SIZE];
    header_raw.copy_from_slice(&raw[..FRAME_HEADER_SIZE]);
    let header = decode_frame_header(&header_raw);
    assert_eq!(
        raw.len(),
        FRAME_HEADER_SIZE + header.payload_length,
        "frame length mismatch"
    );
    let mut frame = Http2Frame::new();
    frame.prepare(
        header.frame_type,
        header.flags,
        header.stream_id,
        header.payload_length,
    );
    decode_payload(&mut frame, Bytes::copy_from_slice(&raw[FRAME_HEADER_SIZE..]))?;
    Ok(frame)
}
