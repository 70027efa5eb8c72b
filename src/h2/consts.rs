/// HTTP/2 connection preface (RFC 7540 Section 3.5); the client must send
/// these 24 bytes before its first frame.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Default settings values (RFC 7540 Section 6.5.2)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Frame/flag constants (RFC 7540 Section 4)
pub const FRAME_HEADER_SIZE: usize = 9;

pub const END_STREAM_FLAG: u8 = 0x1;
pub const ACK_FLAG: u8 = 0x1;
pub const END_HEADERS_FLAG: u8 = 0x4;
pub const PADDED_FLAG: u8 = 0x8;
pub const PRIORITY_FLAG: u8 = 0x20;

pub const MAX_FRAME_SIZE_LOWER_BOUND: u32 = 16_384; // 2^14
pub const MAX_FRAME_SIZE_UPPER_BOUND: u32 = 16_777_215; // 2^24 - 1
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF; // 2^31 - 1

/// SETTINGS payloads are a sequence of 6-byte (id, value) records.
pub const SETTINGS_RECORD_SIZE: usize = 6;

/// Per-field accounting overhead applied against the max header list size
/// (RFC 7540 Section 10.5.1: 32 bytes of overhead per entry).
pub const HEADER_FIELD_OVERHEAD: usize = 32;
