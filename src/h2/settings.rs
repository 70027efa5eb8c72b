//! Directional HTTP/2 parameter sets (RFC 7540 Section 6.5).
//!
//! Two sets exist per connection: what the client advertised (applied from
//! its SETTINGS frames) and what the server advertises (from configured
//! limits). Only the connection read loop mutates either.

use crate::h2::consts::{
    DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
    MAX_FRAME_SIZE_LOWER_BOUND, MAX_FRAME_SIZE_UPPER_BOUND, MAX_WINDOW_SIZE,
    SETTINGS_ENABLE_PUSH, SETTINGS_HEADER_TABLE_SIZE, SETTINGS_INITIAL_WINDOW_SIZE,
    SETTINGS_MAX_CONCURRENT_STREAMS, SETTINGS_MAX_FRAME_SIZE, SETTINGS_MAX_HEADER_LIST_SIZE,
};
use crate::types::{ConnectionError, Http2ErrorCode, ServerLimits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl PeerSettings {
    /// The set the server advertises, derived from configured limits.
    pub fn server(limits: &ServerLimits) -> Self {
        Self {
            header_table_size: limits.http2_header_table_size,
            enable_push: false,
            max_concurrent_streams: limits.http2_max_concurrent_streams,
            initial_window_size: limits.http2_initial_stream_window_size,
            max_frame_size: limits.http2_max_frame_size,
            max_header_list_size: limits.http2_max_header_list_size,
        }
    }

    /// The (id, value) records for the server's initial SETTINGS frame.
    pub fn to_records(&self) -> Vec<(u16, u32)> {
        vec![
            (SETTINGS_HEADER_TABLE_SIZE, self.header_table_size),
            (SETTINGS_ENABLE_PUSH, u32::from(self.enable_push)),
            (SETTINGS_MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size),
            (SETTINGS_MAX_FRAME_SIZE, self.max_frame_size),
            (SETTINGS_MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ]
    }

    /// Apply one (id, value) record from a client SETTINGS frame, validating
    /// per RFC 7540 Section 6.5.2. Unknown identifiers are ignored.
    pub fn apply(&mut self, id: u16, value: u32) -> Result<(), ConnectionError> {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
            SETTINGS_ENABLE_PUSH => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => {
                    return Err(ConnectionError::new(
                        Http2ErrorCode::ProtocolError,
                        "SETTINGS_ENABLE_PUSH must be 0 or 1",
                    ))
                }
            },
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(ConnectionError::new(
                        Http2ErrorCode::FlowControlError,
                        "SETTINGS_INITIAL_WINDOW_SIZE exceeds 2^31-1",
                    ));
                }
                self.initial_window_size = value;
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(MAX_FRAME_SIZE_LOWER_BOUND..=MAX_FRAME_SIZE_UPPER_BOUND).contains(&value) {
                    return Err(ConnectionError::new(
                        Http2ErrorCode::ProtocolError,
                        "SETTINGS_MAX_FRAME_SIZE out of range",
                    ));
                }
                self.max_frame_size = value;
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = value,
            _ => {}
        }
        Ok(())
    }
}
