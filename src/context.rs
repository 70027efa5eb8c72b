//! The application boundary.
//!
//! The engines invoke [`Application::handle`] exactly once per logical
//! request (or per HTTP/2 stream) with a [`RequestContext`] carrying the
//! parsed request, the body reader, and the response writer. Handler errors
//! are reported back to the owning engine, never retried.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::body::{RequestBody, ResponseChannel};
use crate::timeout::TimeoutControl;
use crate::transport::AlpnInfo;
use crate::types::{HeaderMap, HttpVersion, Method, ServerError};

/// The parsed request surface.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    /// Host header (HTTP/1.x) or `:authority` (HTTP/2).
    pub authority: Option<String>,
    /// `%` occurred in the raw path; the application decides whether to
    /// percent-decode.
    pub path_encoded: bool,
}

/// The mutable response surface; headers are frozen on first body write.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
        }
    }
}

/// Fixed, statically-typed capability slots resolved per protocol version,
/// with a string map fallback for the rare custom capability.
#[derive(Default)]
pub struct Capabilities {
    /// ALPN signal for the connection, when TLS supplied one.
    pub alpn: Option<AlpnInfo>,
    /// The connection's single timeout slot, for handlers that want to arm
    /// a timeout of their own.
    pub timeout: Option<Arc<TimeoutControl>>,
    pub extensions: HashMap<&'static str, String>,
}

/// Per-request context handed to the application.
pub struct RequestContext {
    pub connection_id: String,
    /// HTTP/2 stream id; absent on HTTP/1.x.
    pub stream_id: Option<u32>,
    pub request: Request,
    pub response: Response,
    pub capabilities: Capabilities,
    pub(crate) body: RequestBody,
    pub(crate) output: ResponseChannel,
}

impl RequestContext {
    /// Next run of request body bytes; `None` once the body has ended.
    pub async fn read_body(&mut self) -> Result<Option<Bytes>, ServerError> {
        self.body.read().await
    }

    /// Request trailers, available after the body has been read to its end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.body.trailers()
    }

    /// Write response body bytes, flushing the status line and headers first
    /// if they are not on the wire yet.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), ServerError> {
        self.output.write(&self.response, data).await
    }

    /// Response headers already flushed? After this point the status and
    /// headers cannot change, and failures degrade to a connection abort.
    pub fn response_started(&self) -> bool {
        self.output.started()
    }

    pub(crate) async fn finish_response(&mut self) -> Result<(), ServerError> {
        self.output.finish(&self.response).await
    }
}

/// The single callback invoked per fully parsed request.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<(), ServerError>;
}
