//! HTTP/1.x request engine: the per-connection keep-alive loop.
//!
//! Each iteration parses one request head off the shared input buffer, hands
//! the request to the application, and then restores the connection to a
//! parseable state by finishing the response and draining whatever body the
//! handler left unread. The input stream sits behind a mutex because the
//! body reader borrows it from the handler's task; the loop itself never
//! holds the lock across a handler call.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::body::{reason_phrase, RequestBody, ResponseChannel};
use crate::context::{Application, Capabilities, Request, RequestContext, Response};
use crate::h1::message_body::{select_body_mode, BodyMode};
use crate::h1::parser::{ByteStreamParser, HeaderHandler, HeaderParseState, ParseResult, RequestLine};
use crate::timeout::{TimeoutControl, TimeoutReason};
use crate::transport::{AlpnInfo, FrameSink, InputStream, SharedWriter, Transport};
use crate::types::{
    BadRequest, HeaderMap, HttpVersion, Method, RejectionReason, ServerError, ServerLimits,
    ServerTimeouts,
};

/// Serve HTTP/1.x requests on one connection until it closes.
pub async fn serve<T: Transport>(
    transport: T,
    app: Arc<dyn Application>,
    limits: ServerLimits,
    timeouts: ServerTimeouts,
    connection_id: String,
    alpn: AlpnInfo,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let (read, write) = tokio::io::split(transport);
    let engine = Http1Connection {
        connection_id,
        app,
        alpn,
        shutdown,
        parser: ByteStreamParser {
            max_request_line_size: limits.max_request_line_size,
            max_headers_total_size: limits.max_request_headers_total_size,
            max_header_count: limits.max_request_header_count,
            show_error_details: limits.show_error_details,
        },
        input: Arc::new(tokio::sync::Mutex::new(InputStream::new(read))),
        writer: Arc::new(SharedWriter::new(write)),
        timeout: Arc::new(TimeoutControl::new()),
        limits,
        timeouts,
    };
    engine.run().await
}

struct Http1Connection {
    connection_id: String,
    app: Arc<dyn Application>,
    alpn: AlpnInfo,
    /// Graceful-shutdown signal: the current request is answered with
    /// `connection: close` and the connection is not reused.
    shutdown: watch::Receiver<bool>,
    limits: ServerLimits,
    timeouts: ServerTimeouts,
    parser: ByteStreamParser,
    input: Arc<tokio::sync::Mutex<InputStream>>,
    writer: Arc<SharedWriter>,
    timeout: Arc<TimeoutControl>,
}

/// Collects validated header lines into the request's header map.
struct CollectHeaders {
    headers: HeaderMap,
}

impl HeaderHandler for CollectHeaders {
    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), BadRequest> {
        self.headers.append(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
        Ok(())
    }
}

/// What the head-parsing phase decided about this request.
struct RequestHead {
    line: RequestLine,
    headers: HeaderMap,
}

enum HeadOutcome {
    Request(RequestHead),
    /// The peer closed cleanly between requests.
    Closed,
}

impl Http1Connection {
    async fn run(&self) -> Result<(), ServerError> {
        loop {
            let head = match self.read_request_head().await {
                Ok(HeadOutcome::Request(head)) => head,
                Ok(HeadOutcome::Closed) => return Ok(()),
                Err(error) => return self.reject(error).await,
            };
            self.timeout.cancel();

            let version = head.line.version;
            if version == HttpVersion::Http11 {
                match head.headers.count("host") {
                    0 => {
                        return self
                            .reject(ServerError::BadRequest(BadRequest::new(
                                RejectionReason::MissingHostHeader,
                            )))
                            .await;
                    }
                    1 => {}
                    _ => {
                        return self
                            .reject(ServerError::BadRequest(BadRequest::new(
                                RejectionReason::MultipleHostHeaders,
                            )))
                            .await;
                    }
                }
            }

            let mode = match select_body_mode(&head.line.method, version, &head.headers) {
                Ok(mode) => mode,
                Err(error) => return self.reject(ServerError::BadRequest(error)).await,
            };
            let upgrade = matches!(mode, BodyMode::Upgrade);
            let mut keep_alive = !upgrade
                && wants_keep_alive(version, &head.headers)
                && !*self.shutdown.borrow();
            let expect_continue = version == HttpVersion::Http11
                && head
                    .headers
                    .get("expect")
                    .map_or(false, |v| v.eq_ignore_ascii_case("100-continue"));

            let head_method = head.line.method == Method::Head;
            let authority = head.headers.get("host").map(str::to_string);
            let body = RequestBody::h1(
                mode,
                Arc::clone(&self.input),
                Arc::clone(&self.writer),
                Arc::clone(&self.timeout),
                self.limits.min_request_body_data_rate,
                self.limits.max_request_body_size,
                expect_continue,
            );
            let output = ResponseChannel::h1(
                Arc::clone(&self.writer),
                version,
                head_method,
                !keep_alive,
                Arc::clone(&self.timeout),
                self.limits.min_response_data_rate,
            );
            let mut ctx = RequestContext {
                connection_id: self.connection_id.clone(),
                stream_id: None,
                request: Request {
                    method: head.line.method,
                    path: String::from_utf8_lossy(&head.line.path).into_owned(),
                    query: String::from_utf8_lossy(&head.line.query).into_owned(),
                    version,
                    headers: head.headers,
                    authority,
                    path_encoded: head.line.path_encoded,
                },
                response: Response::default(),
                capabilities: Capabilities {
                    alpn: Some(self.alpn.clone()),
                    timeout: Some(Arc::clone(&self.timeout)),
                    extensions: HashMap::new(),
                },
                body,
                output,
            };

            match self.app.handle(&mut ctx).await {
                Ok(()) => {
                    ctx.finish_response().await?;
                }
                Err(error) => {
                    if ctx.response_started() {
                        // The head is on the wire; the only honest signal
                        // left is tearing the connection down mid-body.
                        warn!(
                            connection_id = %self.connection_id,
                            %error,
                            "handler failed after the response started"
                        );
                        return Err(ServerError::ConnectionAborted(error.to_string()));
                    }
                    return self.reject(error).await;
                }
            }

            if upgrade {
                // Ownership of the raw stream has moved to the handler.
                return Ok(());
            }
            // An HTTP/1.0 streamed response is delimited by closing, and a
            // shutdown arriving mid-request ends reuse as well.
            if ctx.output.will_close() || *self.shutdown.borrow() {
                keep_alive = false;
            }
            if keep_alive && !ctx.body.is_done() {
                keep_alive = self.drain_request_body(&mut ctx).await;
            }
            if !keep_alive {
                return Ok(());
            }
        }
    }

    /// Parse one request line plus header section. The keep-alive timer runs
    /// while the buffer sits empty between requests; first sight of bytes
    /// switches to the header-read bound.
    async fn read_request_head(&self) -> Result<HeadOutcome, ServerError> {
        let mut input = self.input.lock().await;
        let mut started = !input.buf.is_empty();
        if started {
            self.arm(TimeoutReason::RequestHeaders);
        } else {
            self.arm(TimeoutReason::KeepAlive);
        }

        let line = loop {
            match self.parser.parse_request_line(&mut input.buf)? {
                ParseResult::Complete(line) => break line,
                ParseResult::Incomplete => {}
            }
            if !started && !input.buf.is_empty() {
                started = true;
                self.arm(TimeoutReason::RequestHeaders);
            }
            let filled = match self.fill(&mut input).await {
                // An idle connection timing out between requests is a clean
                // close, not a request failure.
                Err(ServerError::Timeout(reason))
                    if reason == TimeoutReason::KeepAlive.as_str() =>
                {
                    debug!(connection_id = %self.connection_id, "keep-alive timeout, closing");
                    return Ok(HeadOutcome::Closed);
                }
                other => other?,
            };
            if !filled {
                if input.buf.is_empty() && !started {
                    debug!(connection_id = %self.connection_id, "connection closed between requests");
                } else {
                    debug!(connection_id = %self.connection_id, "connection closed mid-request");
                }
                return Ok(HeadOutcome::Closed);
            }
            if !started {
                started = true;
                self.arm(TimeoutReason::RequestHeaders);
            }
        };

        let mut state = HeaderParseState::default();
        let mut collector = CollectHeaders {
            headers: HeaderMap::new(),
        };
        loop {
            match self
                .parser
                .parse_headers(&mut input.buf, &mut state, &mut collector)?
            {
                ParseResult::Complete(()) => break,
                ParseResult::Incomplete => {}
            }
            if !self.fill(&mut input).await? {
                debug!(connection_id = %self.connection_id, "connection closed mid-headers");
                return Ok(HeadOutcome::Closed);
            }
        }

        Ok(HeadOutcome::Request(RequestHead {
            line,
            headers: collector.headers,
        }))
    }

    /// One timed read into the input buffer. `Ok(false)` is end of stream.
    async fn fill(&self, input: &mut InputStream) -> Result<bool, ServerError> {
        loop {
            let now = Instant::now();
            if let Some(reason) = self.timeout.fired(now) {
                return Err(self.timed_out(reason));
            }
            match self.timeout.poll_deadline(now) {
                Some(deadline) => match timeout_at(deadline, input.fill()).await {
                    Ok(result) => return Ok(result?),
                    Err(_) => continue,
                },
                None => return Ok(input.fill().await?),
            }
        }
    }

    fn timed_out(&self, reason: TimeoutReason) -> ServerError {
        if reason == TimeoutReason::RequestHeaders {
            ServerError::BadRequest(BadRequest::new(RejectionReason::RequestHeadersTimeout))
        } else {
            ServerError::Timeout(reason.as_str())
        }
    }

    fn arm(&self, reason: TimeoutReason) {
        let after = match reason {
            TimeoutReason::KeepAlive => self.timeouts.keep_alive,
            TimeoutReason::RequestHeaders => self.timeouts.request_headers,
            _ => None,
        };
        match after {
            Some(after) => self.timeout.set_timeout(reason, after, Instant::now()),
            None => self.timeout.cancel(),
        }
    }

    /// Consume the rest of the request body so the next request head starts
    /// at a frame boundary. Failure forfeits the connection, not the
    /// already-sent response.
    async fn drain_request_body(&self, ctx: &mut RequestContext) -> bool {
        self.timeout.set_timeout(
            TimeoutReason::RequestBodyDrain,
            self.timeouts.body_drain,
            Instant::now(),
        );
        let result = ctx.body.drain().await;
        self.timeout.cancel();
        match result {
            Ok(()) => true,
            Err(error) => {
                debug!(
                    connection_id = %self.connection_id,
                    %error,
                    "failed to drain the request body, closing"
                );
                false
            }
        }
    }

    /// Answer a rejected request with a minimal closing response, then
    /// surface the error to the caller.
    async fn reject(&self, error: ServerError) -> Result<(), ServerError> {
        let status = match &error {
            ServerError::BadRequest(bad_request) => bad_request.status_code(),
            _ => 500,
        };
        warn!(
            connection_id = %self.connection_id,
            status,
            %error,
            "request rejected"
        );
        let head = format!(
            "HTTP/1.1 {} {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            status,
            reason_phrase(status)
        );
        // Best effort; the error being returned is the interesting part.
        let _ = self.writer.send(Bytes::from(head)).await;
        Err(error)
    }
}

/// RFC 9112 persistence defaults: 1.1 stays open unless told otherwise,
/// 1.0 closes unless explicitly kept alive.
fn wants_keep_alive(version: HttpVersion, headers: &HeaderMap) -> bool {
    let tokens: Vec<String> = headers
        .get_all("connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();
    match version {
        HttpVersion::Http10 => tokens.iter().any(|t| t == "keep-alive"),
        _ => !tokens.iter().any(|t| t == "close"),
    }
}
