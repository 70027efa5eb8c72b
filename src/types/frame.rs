use bytes::Bytes;

use crate::h2::consts::{ACK_FLAG, END_HEADERS_FLAG, END_STREAM_FLAG, PADDED_FLAG, PRIORITY_FLAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2FrameType {
    Data,         // 0x0
    Headers,      // 0x1
    Priority,     // 0x2
    RstStream,    // 0x3
    Settings,     // 0x4
    PushPromise,  // 0x5
    Ping,         // 0x6
    GoAway,       // 0x7
    WindowUpdate, // 0x8
    Continuation, // 0x9
    Unknown(u8),
}

impl Http2FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => Http2FrameType::Data,
            0x1 => Http2FrameType::Headers,
            0x2 => Http2FrameType::Priority,
            0x3 => Http2FrameType::RstStream,
            0x4 => Http2FrameType::Settings,
            0x5 => Http2FrameType::PushPromise,
            0x6 => Http2FrameType::Ping,
            0x7 => Http2FrameType::GoAway,
            0x8 => Http2FrameType::WindowUpdate,
            0x9 => Http2FrameType::Continuation,
            other => Http2FrameType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Http2FrameType::Data => 0x0,
            Http2FrameType::Headers => 0x1,
            Http2FrameType::Priority => 0x2,
            Http2FrameType::RstStream => 0x3,
            Http2FrameType::Settings => 0x4,
            Http2FrameType::PushPromise => 0x5,
            Http2FrameType::Ping => 0x6,
            Http2FrameType::GoAway => 0x7,
            Http2FrameType::WindowUpdate => 0x8,
            Http2FrameType::Continuation => 0x9,
            Http2FrameType::Unknown(other) => *other,
        }
    }
}

impl std::fmt::Display for Http2FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Http2FrameType::Data => "DATA",
            Http2FrameType::Headers => "HEADERS",
            Http2FrameType::Priority => "PRIORITY",
            Http2FrameType::RstStream => "RST_STREAM",
            Http2FrameType::Settings => "SETTINGS",
            Http2FrameType::PushPromise => "PUSH_PROMISE",
            Http2FrameType::Ping => "PING",
            Http2FrameType::GoAway => "GOAWAY",
            Http2FrameType::WindowUpdate => "WINDOW_UPDATE",
            Http2FrameType::Continuation => "CONTINUATION",
            Http2FrameType::Unknown(other) => return write!(f, "UNKNOWN(0x{:x})", other),
        };
        f.write_str(name)
    }
}

/// Stream dependency carried by PRIORITY frames and the HEADERS priority
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityInfo {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

/// One decoded wire frame. A single instance is owned by the connection read
/// loop and re-initialized per iteration; no dispatch path may retain a
/// reference past the iteration boundary.
#[derive(Debug, Clone)]
pub struct Http2Frame {
    pub frame_type: Http2FrameType,
    pub flags: u8,
    pub stream_id: u32,
    /// Declared payload length from the 9-byte header, before extended fields
    /// and padding are stripped.
    pub payload_length: usize,
    /// Payload with pad length / priority / padding removed.
    pub payload: Bytes,

    // Type-specific decoded fields.
    pub pad_length: u8,
    pub priority: Option<PriorityInfo>,
    pub error_code: u32,
    pub window_increment: u32,
    pub goaway_last_stream_id: u32,
    pub ping_payload: [u8; 8],
}

impl Default for Http2Frame {
    fn default() -> Self {
        Self {
            frame_type: Http2FrameType::Unknown(0xff),
            flags: 0,
            stream_id: 0,
            payload_length: 0,
            payload: Bytes::new(),
            pad_length: 0,
            priority: None,
            error_code: 0,
            window_increment: 0,
            goaway_last_stream_id: 0,
            ping_payload: [0; 8],
        }
    }
}

impl Http2Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all fields ahead of decoding the next frame.
    pub fn prepare(&mut self, frame_type: Http2FrameType, flags: u8, stream_id: u32, length: usize) {
        self.frame_type = frame_type;
        self.flags = flags;
        self.stream_id = stream_id;
        self.payload_length = length;
        self.payload = Bytes::new();
        self.pad_length = 0;
        self.priority = None;
        self.error_code = 0;
        self.window_increment = 0;
        self.goaway_last_stream_id = 0;
        self.ping_payload = [0; 8];
    }

    pub fn is_end_stream(&self) -> bool {
        (self.flags & END_STREAM_FLAG) != 0
    }

    pub fn is_end_headers(&self) -> bool {
        (self.flags & END_HEADERS_FLAG) != 0
    }

    pub fn is_ack(&self) -> bool {
        (self.flags & ACK_FLAG) != 0
    }

    pub fn is_padded(&self) -> bool {
        (self.flags & PADDED_FLAG) != 0
    }

    pub fn has_priority(&self) -> bool {
        (self.flags & PRIORITY_FLAG) != 0
    }
}
