use std::time::Duration;

/// A minimum transfer rate, evaluated incrementally as bytes move. The grace
/// period keeps a connection from being judged before it has had a chance to
/// ramp up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    pub bytes_per_second: f64,
    pub grace_period: Duration,
}

impl MinDataRate {
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Self {
        Self {
            bytes_per_second,
            grace_period,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerTimeouts {
    /// Idle time allowed between requests on a kept-alive connection.
    pub keep_alive: Option<Duration>,
    /// Time allowed to receive the full request headers.
    pub request_headers: Option<Duration>,
    /// Best-effort bound on draining an unread request body.
    pub body_drain: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            keep_alive: Some(Duration::from_secs(130)),
            request_headers: Some(Duration::from_secs(30)),
            body_drain: Duration::from_secs(5),
        }
    }
}

impl ServerTimeouts {
    pub fn disabled() -> Self {
        Self {
            keep_alive: None,
            request_headers: None,
            body_drain: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerLimits {
    pub max_request_line_size: usize,
    pub max_request_headers_total_size: usize,
    pub max_request_header_count: usize,
    pub max_request_body_size: Option<u64>,
    pub min_request_body_data_rate: Option<MinDataRate>,
    pub min_response_data_rate: Option<MinDataRate>,
    /// Include escaped client input in rejection details and logs.
    pub show_error_details: bool,

    // HTTP/2 settings the server advertises.
    pub http2_max_concurrent_streams: u32,
    pub http2_header_table_size: u32,
    pub http2_max_frame_size: u32,
    pub http2_initial_stream_window_size: u32,
    pub http2_initial_connection_window_size: u32,
    pub http2_max_header_list_size: u32,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_request_line_size: 8 * 1024,
            max_request_headers_total_size: 32 * 1024,
            max_request_header_count: 100,
            max_request_body_size: Some(30_000_000),
            min_request_body_data_rate: Some(MinDataRate::new(240.0, Duration::from_secs(5))),
            min_response_data_rate: Some(MinDataRate::new(240.0, Duration::from_secs(5))),
            show_error_details: false,
            http2_max_concurrent_streams: 100,
            http2_header_table_size: 4096,
            http2_max_frame_size: 16_384,
            http2_initial_stream_window_size: 96 * 1024,
            http2_initial_connection_window_size: 128 * 1024,
            http2_max_header_list_size: 32 * 1024,
        }
    }
}
