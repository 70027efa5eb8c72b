//! HTTP/2 connection state machine (RFC 7540 Sections 5 and 6).
//!
//! One sequential read loop owns the transport's read half, the frame codec
//! state, the HPACK decoder, and all receive-side flow-control accounting.
//! Stream workers run as spawned tasks and reach the connection only through
//! the completed-stream queue, the body-credit channel, the shared frame
//! writer, and their send windows. Protocol violations flow back to the loop
//! as tagged connection/stream errors; the loop answers with GOAWAY or
//! RST_STREAM accordingly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::body::{RequestBody, ResponseChannel};
use crate::context::{Application, Capabilities, Request, RequestContext, Response};
use crate::h2::consts::{CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, FRAME_HEADER_SIZE};
use crate::h2::flow_control::{FlowControlWindow, WindowUpdateResult};
use crate::h2::framing::{
    decode_frame_header, decode_payload, encode_goaway, encode_ping, encode_rst_stream,
    encode_settings, encode_settings_ack, encode_window_update, settings_records, FrameHeader,
};
use crate::h2::header_validation::{HeaderBlockKind, HeaderValidationState};
use crate::h2::settings::PeerSettings;
use crate::h2::stream::{SendWindow, StreamState};
use crate::timeout::{TimeoutControl, TimeoutReason};
use crate::transport::{AlpnInfo, FrameSink, InputStream, SharedWriter, Transport};
use crate::types::{
    ConnectionError, HeaderMap, Http2Error, Http2ErrorCode, Http2Frame, Http2FrameType,
    HttpVersion, Method, ServerError, ServerLimits, ServerTimeouts, StreamError,
};

/// Serve one HTTP/2 connection until the peer closes, shutdown completes, or
/// a connection-fatal violation tears it down.
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
    let (completed_tx, completed_rx) = mpsc::unbounded_channel();
    let (credit_tx, credit_rx) = mpsc::unbounded_channel();
    let server_settings = PeerSettings::server(&limits);
    let client_settings = PeerSettings::default();
    let validator = HeaderValidationState::new(limits.http2_max_header_list_size as usize);

    let mut connection = Http2Connection {
        connection_id,
        app,
        alpn,
        input: InputStream::new(read),
        writer: Arc::new(SharedWriter::new(write)),
        peer_max_frame: Arc::new(AtomicU32::new(client_settings.max_frame_size)),
        client_settings,
        server_settings,
        decoder: hpack::Decoder::new(),
        validator,
        conn_recv_window: FlowControlWindow::new(limits.http2_initial_connection_window_size),
        conn_send_window: Arc::new(SendWindow::new(DEFAULT_INITIAL_WINDOW_SIZE)),
        streams: HashMap::new(),
        active_streams: 0,
        highest_opened: 0,
        completed_tx,
        completed_rx,
        credit_tx,
        credit_rx,
        timeout: Arc::new(TimeoutControl::new()),
        headers: None,
        goaway_received: false,
        shutdown,
        shutdown_live: true,
        shutting_down: false,
        goaway_sent: false,
        frame: Http2Frame::new(),
        limits,
        timeouts,
    };
    connection.run().await
}

/// An in-progress header block: HEADERS plus any CONTINUATIONs, decoded as
/// one unit on END_HEADERS.
struct HeaderAccumulator {
    stream_id: u32,
    kind: HeaderBlockKind,
    /// END_STREAM carried by the opening HEADERS frame.
    end_stream: bool,
    block: BytesMut,
}

/// Pseudo-header fields extracted while validating a request header block.
#[derive(Default)]
struct PseudoFields {
    method: String,
    path: String,
    authority: Option<String>,
}

struct Http2Connection {
    connection_id: String,
    app: Arc<dyn Application>,
    alpn: AlpnInfo,
    limits: ServerLimits,
    timeouts: ServerTimeouts,

    input: InputStream,
    writer: Arc<SharedWriter>,

    client_settings: PeerSettings,
    server_settings: PeerSettings,
    /// Client's max frame size, shared with workers for DATA splitting.
    peer_max_frame: Arc<AtomicU32>,

    decoder: hpack::Decoder<'static>,
    validator: HeaderValidationState,

    conn_recv_window: FlowControlWindow,
    conn_send_window: Arc<SendWindow>,

    streams: HashMap<u32, StreamState>,
    /// Streams whose worker has not yet reported completion.
    active_streams: u32,
    highest_opened: u32,

    completed_tx: mpsc::UnboundedSender<u32>,
    completed_rx: mpsc::UnboundedReceiver<u32>,
    credit_tx: mpsc::UnboundedSender<(u32, usize)>,
    credit_rx: mpsc::UnboundedReceiver<(u32, usize)>,

    timeout: Arc<TimeoutControl>,

    headers: Option<HeaderAccumulator>,
    goaway_received: bool,
    /// Server-side graceful-shutdown trigger.
    shutdown: watch::Receiver<bool>,
    shutdown_live: bool,
    /// We announced GOAWAY(NO_ERROR); new streams are refused and the
    /// connection ends once the in-flight workers drain.
    shutting_down: bool,
    goaway_sent: bool,
    /// The one frame value, re-initialized per read-loop iteration.
    frame: Http2Frame,
}

fn conn_error(code: Http2ErrorCode, message: impl Into<String>) -> Http2Error {
    Http2Error::Connection(ConnectionError::new(code, message))
}

fn proto_error(message: impl Into<String>) -> Http2Error {
    conn_error(Http2ErrorCode::ProtocolError, message)
}

fn method_from_token(token: &str) -> Method {
    match token {
        "GET" => Method::Get,
        "PUT" => Method::Put,
        "POST" => Method::Post,
        "HEAD" => Method::Head,
        "TRACE" => Method::Trace,
        "PATCH" => Method::Patch,
        "DELETE" => Method::Delete,
        "CONNECT" => Method::Connect,
        "OPTIONS" => Method::Options,
        other => Method::Custom(other.to_string()),
    }
}

impl Http2Connection {
    async fn run(&mut self) -> Result<(), ServerError> {
        self.read_preface().await?;

        // Advertise our limits, then grow the connection window past the
        // protocol default.
        self.writer
            .send(encode_settings(&self.server_settings.to_records()))
            .await?;
        let extra = self
            .limits
            .http2_initial_connection_window_size
            .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
        if extra > 0 {
            self.writer.send(encode_window_update(0, extra)).await?;
        }
        self.arm_keep_alive();

        loop {
            loop {
                let (header, payload) = match self.try_extract_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(connection_error) => return self.teardown(connection_error).await,
                };
                self.frame.prepare(
                    header.frame_type,
                    header.flags,
                    header.stream_id,
                    header.payload_length,
                );
                let result = match decode_payload(&mut self.frame, payload) {
                    Ok(()) => self.dispatch_frame().await,
                    Err(error) => Err(error),
                };
                match result {
                    Ok(()) => {}
                    Err(Http2Error::Stream(stream_error)) => {
                        self.reset_stream(stream_error).await?;
                    }
                    Err(Http2Error::Connection(connection_error)) => {
                        return self.teardown(connection_error).await;
                    }
                }
            }

            if (self.goaway_received || self.shutting_down) && self.active_streams == 0 {
                return self.close_gracefully().await;
            }
            if self.input.is_eof() {
                if self.active_streams > 0 {
                    debug!(
                        connection_id = %self.connection_id,
                        active = self.active_streams,
                        "transport closed with streams still active"
                    );
                    self.abort_streams("connection closed by peer");
                }
                return Ok(());
            }

            let now = Instant::now();
            let deadline = self
                .next_deadline(now)
                .unwrap_or(now + Duration::from_secs(3600));
            tokio::select! {
                filled = self.input.fill() => {
                    filled?;
                }
                completed = self.completed_rx.recv() => {
                    if let Some(id) = completed {
                        self.on_stream_completed(id);
                        // Drain what is queued right now; workers still
                        // enqueuing are picked up next iteration.
                        let pending = self.completed_rx.len();
                        for _ in 0..pending {
                            match self.completed_rx.try_recv() {
                                Ok(id) => self.on_stream_completed(id),
                                Err(_) => break,
                            }
                        }
                    }
                }
                credit = self.credit_rx.recv() => {
                    if let Some((id, bytes)) = credit {
                        self.grant_credit(id, bytes).await?;
                        let pending = self.credit_rx.len();
                        for _ in 0..pending {
                            match self.credit_rx.try_recv() {
                                Ok((id, bytes)) => self.grant_credit(id, bytes).await?,
                                Err(_) => break,
                            }
                        }
                    }
                }
                changed = self.shutdown.changed(), if self.shutdown_live && !self.shutting_down => {
                    match changed {
                        Ok(()) => {
                            if *self.shutdown.borrow_and_update() {
                                self.begin_shutdown().await?;
                            }
                        }
                        // The handle is gone; no shutdown will ever arrive.
                        Err(_) => self.shutdown_live = false,
                    }
                }
                _ = sleep_until(deadline) => {
                    if let Some(result) = self.on_tick(Instant::now()).await? {
                        return result;
                    }
                }
            }
        }
    }

    async fn read_preface(&mut self) -> Result<(), ServerError> {
        if let Some(after) = self.timeouts.request_headers {
            self.timeout
                .set_timeout(TimeoutReason::RequestHeaders, after, Instant::now());
        }
        while self.input.buf.len() < CONNECTION_PREFACE.len() {
            let now = Instant::now();
            if let Some(reason) = self.timeout.fired(now) {
                return Err(ServerError::Timeout(reason.as_str()));
            }
            let filled = match self.timeout.poll_deadline(now) {
                Some(deadline) => match timeout_at(deadline, self.input.fill()).await {
                    Ok(result) => result?,
                    Err(_) => continue,
                },
                None => self.input.fill().await?,
            };
            if !filled {
                return Err(ServerError::ConnectionAborted(
                    "connection closed before the HTTP/2 preface".to_string(),
                ));
            }
        }
        let preface = self.input.buf.take(CONNECTION_PREFACE.len());
        if &preface[..] != CONNECTION_PREFACE {
            return Err(ConnectionError::new(
                Http2ErrorCode::ProtocolError,
                "invalid HTTP/2 connection preface",
            )
            .into());
        }
        self.timeout.cancel();
        debug!(connection_id = %self.connection_id, "http/2 preface accepted");
        Ok(())
    }

    /// Pull one complete frame out of the buffer. The size check runs off
    /// the 9-byte header alone, before any payload is consumed.
    fn try_extract_frame(&mut self) -> Result<Option<(FrameHeader, Bytes)>, ConnectionError> {
        if self.input.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let raw = self.input.buf.slice(0, FRAME_HEADER_SIZE);
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        header_bytes.copy_from_slice(&raw);
        let header = decode_frame_header(&header_bytes);

        if header.payload_length > self.server_settings.max_frame_size as usize {
            // Fatal before the payload is read or buffered further.
            return Err(ConnectionError::new(
                Http2ErrorCode::FrameSizeError,
                format!(
                    "{} frame of {} bytes exceeds the {} byte maximum",
                    header.frame_type, header.payload_length, self.server_settings.max_frame_size
                ),
            ));
        }
        if self.input.buf.len() < FRAME_HEADER_SIZE + header.payload_length {
            return Ok(None);
        }
        self.input.buf.consume(FRAME_HEADER_SIZE);
        let payload = self.input.buf.take(header.payload_length);
        Ok(Some((header, payload)))
    }

    async fn dispatch_frame(&mut self) -> Result<(), Http2Error> {
        let id = self.frame.stream_id;
        debug!(
            connection_id = %self.connection_id,
            frame = %self.frame.frame_type,
            stream_id = id,
            length = self.frame.payload_length,
            "frame received"
        );

        if id != 0 && id % 2 == 0 {
            return Err(proto_error("client-initiated stream id must be odd"));
        }
        if let Some(acc) = &self.headers {
            let continues = self.frame.frame_type == Http2FrameType::Continuation
                && id == acc.stream_id;
            if !continues {
                return Err(proto_error(
                    "frame interleaved with an unfinished header block",
                ));
            }
        }
        // Frames that require an existing stream make an idle stream a
        // connection error; tracking implicit closes separately is not worth
        // the state.
        let requires_open = matches!(
            self.frame.frame_type,
            Http2FrameType::Data | Http2FrameType::RstStream | Http2FrameType::Continuation
        ) || (self.frame.frame_type == Http2FrameType::WindowUpdate && id != 0);
        if requires_open && id > self.highest_opened {
            return Err(proto_error("frame received for an idle stream"));
        }

        match self.frame.frame_type {
            Http2FrameType::Data => self.on_data().await,
            Http2FrameType::Headers => self.on_headers().await,
            Http2FrameType::Priority => self.on_priority(),
            Http2FrameType::RstStream => self.on_rst_stream(),
            Http2FrameType::Settings => self.on_settings().await,
            Http2FrameType::PushPromise => {
                Err(proto_error("PUSH_PROMISE is not valid from a client"))
            }
            Http2FrameType::Ping => self.on_ping().await,
            Http2FrameType::GoAway => self.on_goaway(),
            Http2FrameType::WindowUpdate => self.on_window_update(),
            Http2FrameType::Continuation => self.on_continuation().await,
            // Unknown types are no-ops for forward compatibility.
            Http2FrameType::Unknown(_) => Ok(()),
        }
    }

    /// Buffered header-block bytes are bounded before any decoding happens;
    /// a client that withholds END_HEADERS cannot grow the accumulator
    /// without limit.
    fn check_header_block_size(&self, total: usize) -> Result<(), Http2Error> {
        if total > self.limits.http2_max_header_list_size as usize {
            return Err(conn_error(
                Http2ErrorCode::EnhanceYourCalm,
                "header block exceeds the maximum header list size",
            ));
        }
        Ok(())
    }

    async fn on_headers(&mut self) -> Result<(), Http2Error> {
        let id = self.frame.stream_id;
        if id == 0 {
            return Err(proto_error("HEADERS frame on stream 0"));
        }
        self.check_header_block_size(self.frame.payload.len())?;
        if let Some(priority) = self.frame.priority {
            if priority.dependency == id {
                return Err(proto_error("stream cannot depend on itself"));
            }
        }

        if let Some(stream) = self.streams.get(&id) {
            if stream.rst_stream_received || stream.end_stream_received {
                return Err(conn_error(
                    Http2ErrorCode::StreamClosed,
                    "HEADERS received for a half-closed or reset stream",
                ));
            }
            // Trailers: they end the stream, so END_STREAM is mandatory.
            if !self.frame.is_end_stream() {
                return Err(proto_error("trailers must carry END_STREAM"));
            }
            self.validator.reset(HeaderBlockKind::Trailers);
            self.headers = Some(HeaderAccumulator {
                stream_id: id,
                kind: HeaderBlockKind::Trailers,
                end_stream: true,
                block: BytesMut::from(&self.frame.payload[..]),
            });
        } else {
            if id <= self.highest_opened {
                return Err(conn_error(
                    Http2ErrorCode::StreamClosed,
                    "HEADERS received for a closed stream",
                ));
            }
            self.highest_opened = id;
            if self.goaway_received || self.shutting_down {
                return Err(Http2Error::Stream(StreamError::new(
                    id,
                    Http2ErrorCode::RefusedStream,
                    "connection is shutting down",
                )));
            }
            // The keep-alive timer gives way to a header-read bound, but
            // only when the block spans further frames.
            if !self.frame.is_end_headers() {
                if let Some(after) = self.timeouts.request_headers {
                    self.timeout
                        .set_timeout(TimeoutReason::RequestHeaders, after, Instant::now());
                }
            }
            self.validator.reset(HeaderBlockKind::Headers);
            self.headers = Some(HeaderAccumulator {
                stream_id: id,
                kind: HeaderBlockKind::Headers,
                end_stream: self.frame.is_end_stream(),
                block: BytesMut::from(&self.frame.payload[..]),
            });
        }

        if self.frame.is_end_headers() {
            self.finish_header_block().await?;
        }
        Ok(())
    }

    async fn on_continuation(&mut self) -> Result<(), Http2Error> {
        let acc = self
            .headers
            .as_mut()
            .ok_or_else(|| proto_error("CONTINUATION without an open header block"))?;
        let total = acc.block.len() + self.frame.payload.len();
        acc.block.extend_from_slice(&self.frame.payload);
        self.check_header_block_size(total)?;
        if self.frame.is_end_headers() {
            self.finish_header_block().await?;
        }
        Ok(())
    }

    /// Decode and validate the accumulated block, then start the stream or
    /// deliver trailers.
    async fn finish_header_block(&mut self) -> Result<(), Http2Error> {
        let Some(acc) = self.headers.take() else {
            return Ok(());
        };
        let fields = self.decoder.decode(&acc.block).map_err(|_| {
            conn_error(
                Http2ErrorCode::CompressionError,
                "header block decompression failed",
            )
        })?;

        let mut headers = HeaderMap::new();
        let mut pseudo = PseudoFields::default();
        for (name, value) in &fields {
            self.validator
                .validate(name, value)
                .map_err(Http2Error::Connection)?;
            let value_str = String::from_utf8_lossy(value).into_owned();
            match name.as_slice() {
                b":method" => pseudo.method = value_str,
                b":path" => pseudo.path = value_str,
                b":authority" => pseudo.authority = Some(value_str),
                b":scheme" => {}
                _ => headers.append(String::from_utf8_lossy(name).into_owned(), value_str),
            }
        }

        if self.timeout.reason() == TimeoutReason::RequestHeaders {
            self.timeout.cancel();
        }

        match acc.kind {
            HeaderBlockKind::Headers => self.start_stream(acc, pseudo, headers),
            HeaderBlockKind::Trailers => {
                if let Some(stream) = self.streams.get_mut(&acc.stream_id) {
                    if stream.input_remaining.map_or(false, |r| r > 0) {
                        return Err(Http2Error::Stream(StreamError::new(
                            acc.stream_id,
                            Http2ErrorCode::ProtocolError,
                            "stream ended before its declared content-length",
                        )));
                    }
                    stream.deliver_trailers(headers);
                }
                self.maybe_evict(acc.stream_id);
                Ok(())
            }
        }
    }

    fn start_stream(
        &mut self,
        acc: HeaderAccumulator,
        pseudo: PseudoFields,
        headers: HeaderMap,
    ) -> Result<(), Http2Error> {
        let id = acc.stream_id;
        if !self.validator.has_required_pseudo_headers() {
            return Err(Http2Error::Stream(StreamError::new(
                id,
                Http2ErrorCode::ProtocolError,
                "mandatory pseudo-header fields missing",
            )));
        }
        if self.active_streams >= self.limits.http2_max_concurrent_streams {
            return Err(Http2Error::Stream(StreamError::new(
                id,
                Http2ErrorCode::RefusedStream,
                "maximum concurrent stream limit exceeded",
            )));
        }

        let input_remaining = match headers.get("content-length") {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                Http2Error::Stream(StreamError::new(
                    id,
                    Http2ErrorCode::ProtocolError,
                    "malformed content-length header",
                ))
            })?),
            None => None,
        };
        if acc.end_stream && input_remaining.unwrap_or(0) != 0 {
            return Err(Http2Error::Stream(StreamError::new(
                id,
                Http2ErrorCode::ProtocolError,
                "stream ended before its declared content-length",
            )));
        }

        let method = method_from_token(&pseudo.method);
        let (path, query) = match pseudo.path.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (pseudo.path.clone(), String::new()),
        };
        let path_encoded = path.contains('%');
        let head = method == Method::Head;

        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(SendWindow::new(self.client_settings.initial_window_size));
        // Workers police their own minimum data rates; the connection timer
        // stays with the read loop.
        let stream_timeout = Arc::new(TimeoutControl::new());
        let body = RequestBody::h2(
            id,
            body_rx,
            self.credit_tx.clone(),
            self.limits.max_request_body_size,
            Arc::clone(&stream_timeout),
            self.limits.min_request_body_data_rate,
        );
        let output = ResponseChannel::h2(
            id,
            self.writer.clone(),
            Arc::clone(&send_window),
            Arc::clone(&self.conn_send_window),
            Arc::clone(&self.peer_max_frame),
            head,
            Arc::clone(&stream_timeout),
            self.limits.min_response_data_rate,
        );
        let mut ctx = RequestContext {
            connection_id: self.connection_id.clone(),
            stream_id: Some(id),
            request: Request {
                method,
                path,
                query,
                version: HttpVersion::Http2,
                headers,
                authority: pseudo.authority,
                path_encoded,
            },
            response: Response::default(),
            capabilities: Capabilities {
                alpn: Some(self.alpn.clone()),
                timeout: Some(Arc::clone(&stream_timeout)),
                extensions: HashMap::new(),
            },
            body,
            output,
        };

        // The loop never blocks on application code: the handler runs on its
        // own task and reports back through the completed-stream queue.
        let app = Arc::clone(&self.app);
        let completed_tx = self.completed_tx.clone();
        let connection_id = self.connection_id.clone();
        let worker = tokio::spawn(async move {
            let result = match app.handle(&mut ctx).await {
                Ok(()) => ctx.finish_response().await,
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                warn!(
                    connection_id = %connection_id,
                    stream_id = id,
                    %error,
                    "stream handler failed"
                );
            }
            let _ = completed_tx.send(id);
        });

        let mut stream = StreamState {
            id,
            recv_window: FlowControlWindow::new(self.server_settings.initial_window_size),
            send_window,
            body_tx,
            input_remaining,
            end_stream_received: false,
            rst_stream_received: false,
            rst_stream_sent: false,
            local_complete: false,
            drain_deadline: None,
            worker,
        };
        if acc.end_stream {
            stream.deliver_end();
        }
        self.streams.insert(id, stream);
        self.active_streams += 1;
        self.timeout.cancel();
        Ok(())
    }

    async fn on_data(&mut self) -> Result<(), Http2Error> {
        let id = self.frame.stream_id;
        if id == 0 {
            return Err(proto_error("DATA frame on stream 0"));
        }
        // Flow control charges the whole declared payload, padding included.
        let declared = self.frame.payload_length;
        self.conn_recv_window.consume(declared);
        if self.conn_recv_window.available() < 0 {
            return Err(conn_error(
                Http2ErrorCode::FlowControlError,
                "connection flow-control window exceeded",
            ));
        }

        let data = self.frame.payload.clone();
        let end_stream = self.frame.is_end_stream();
        let padding = declared - data.len();

        let reset = match self.streams.get_mut(&id) {
            None => {
                return Err(conn_error(
                    Http2ErrorCode::StreamClosed,
                    "DATA received for a closed stream",
                ));
            }
            Some(stream) => {
                if stream.end_stream_received {
                    return Err(conn_error(
                        Http2ErrorCode::StreamClosed,
                        "DATA received after END_STREAM",
                    ));
                }
                if stream.rst_stream_received {
                    return Err(conn_error(
                        Http2ErrorCode::StreamClosed,
                        "DATA received for a stream the client reset",
                    ));
                }
                if stream.rst_stream_sent {
                    true
                } else {
                    stream.recv_window.consume(declared);
                    if stream.recv_window.available() < 0 {
                        return Err(Http2Error::Stream(StreamError::new(
                            id,
                            Http2ErrorCode::FlowControlError,
                            "stream flow-control window exceeded",
                        )));
                    }
                    if let Some(remaining) = stream.input_remaining.as_mut() {
                        if (data.len() as u64) > *remaining {
                            return Err(Http2Error::Stream(StreamError::new(
                                id,
                                Http2ErrorCode::ProtocolError,
                                "request body exceeds its declared content-length",
                            )));
                        }
                        *remaining -= data.len() as u64;
                    }
                    if !data.is_empty() {
                        stream.deliver_data(data.clone());
                    }
                    if end_stream {
                        if stream.input_remaining.map_or(false, |r| r > 0) {
                            return Err(Http2Error::Stream(StreamError::new(
                                id,
                                Http2ErrorCode::ProtocolError,
                                "stream ended before its declared content-length",
                            )));
                        }
                        stream.deliver_end();
                    }
                    false
                }
            }
        };

        if reset {
            // The stream is dead but the bytes were charged against the
            // connection; hand the credit straight back.
            self.grant_connection_credit(declared).await?;
        } else {
            // Padding never reaches the application, so its credit cannot
            // come back through the consumption channel.
            if padding > 0 {
                self.grant_credit(id, padding).await.map_err(io_to_conn)?;
            }
            if end_stream {
                self.maybe_evict(id);
            }
        }
        Ok(())
    }

    fn on_priority(&mut self) -> Result<(), Http2Error> {
        let id = self.frame.stream_id;
        if id == 0 {
            return Err(proto_error("PRIORITY frame on stream 0"));
        }
        if let Some(priority) = self.frame.priority {
            if priority.dependency == id {
                return Err(proto_error("stream cannot depend on itself"));
            }
        }
        // Priority is otherwise advisory; no scheduling tree is kept.
        Ok(())
    }

    fn on_rst_stream(&mut self) -> Result<(), Http2Error> {
        let id = self.frame.stream_id;
        if id == 0 {
            return Err(proto_error("RST_STREAM frame on stream 0"));
        }
        match self.streams.get_mut(&id) {
            Some(stream) => {
                if stream.rst_stream_received {
                    return Err(conn_error(
                        Http2ErrorCode::StreamClosed,
                        "RST_STREAM received for a stream already reset",
                    ));
                }
                debug!(
                    connection_id = %self.connection_id,
                    stream_id = id,
                    code = %Http2ErrorCode::from(self.frame.error_code),
                    "stream reset by peer"
                );
                stream.rst_stream_received = true;
                if !stream.rst_stream_sent {
                    stream.abort(ServerError::RequestAborted);
                }
                self.maybe_evict(id);
                Ok(())
            }
            // Already evicted: late resets are absorbed.
            None => Ok(()),
        }
    }

    async fn on_settings(&mut self) -> Result<(), Http2Error> {
        if self.frame.stream_id != 0 {
            return Err(proto_error("SETTINGS frame on a nonzero stream"));
        }
        if self.frame.is_ack() {
            return Ok(());
        }
        let old_initial = self.client_settings.initial_window_size;
        let payload = self.frame.payload.clone();
        for (id, value) in settings_records(&payload) {
            self.client_settings
                .apply(id, value)
                .map_err(Http2Error::Connection)?;
        }
        self.peer_max_frame
            .store(self.client_settings.max_frame_size, Ordering::Release);

        // Ack before applying the window delta, so the client cannot race
        // data against an un-acked window change.
        self.writer
            .send(encode_settings_ack())
            .await
            .map_err(|e| io_to_conn(ServerError::Io(e)))?;

        let delta = i64::from(self.client_settings.initial_window_size) - i64::from(old_initial);
        if delta != 0 {
            for stream in self.streams.values() {
                if stream.send_window.adjust(delta) == WindowUpdateResult::Overflow {
                    // Accounting is globally inconsistent; this cannot be
                    // remediated per-stream.
                    return Err(conn_error(
                        Http2ErrorCode::FlowControlError,
                        "SETTINGS window change overflows a stream window",
                    ));
                }
            }
        }
        Ok(())
    }

    async fn on_ping(&mut self) -> Result<(), Http2Error> {
        if self.frame.stream_id != 0 {
            return Err(proto_error("PING frame on a nonzero stream"));
        }
        if self.frame.is_ack() {
            // The echoed payload is not matched against outstanding pings.
            return Ok(());
        }
        self.writer
            .send(encode_ping(self.frame.ping_payload, true))
            .await
            .map_err(|e| io_to_conn(ServerError::Io(e)))?;
        Ok(())
    }

    fn on_goaway(&mut self) -> Result<(), Http2Error> {
        if self.frame.stream_id != 0 {
            return Err(proto_error("GOAWAY frame on a nonzero stream"));
        }
        debug!(
            connection_id = %self.connection_id,
            code = %Http2ErrorCode::from(self.frame.error_code),
            last_stream_id = self.frame.goaway_last_stream_id,
            "GOAWAY received"
        );
        self.goaway_received = true;
        Ok(())
    }

    fn on_window_update(&mut self) -> Result<(), Http2Error> {
        let id = self.frame.stream_id;
        let increment = self.frame.window_increment;
        if increment == 0 {
            // Escalated to connection scope: without server-initiated
            // resets a stream-scoped verdict has no teeth.
            return Err(proto_error("WINDOW_UPDATE with a zero increment"));
        }
        if id == 0 {
            if self.conn_send_window.replenish(increment) == WindowUpdateResult::Overflow {
                return Err(conn_error(
                    Http2ErrorCode::FlowControlError,
                    "connection window increment overflows",
                ));
            }
            return Ok(());
        }
        match self.streams.get(&id) {
            Some(stream) => {
                if stream.send_window.replenish(increment) == WindowUpdateResult::Overflow {
                    return Err(Http2Error::Stream(StreamError::new(
                        id,
                        Http2ErrorCode::FlowControlError,
                        "stream window increment overflows",
                    )));
                }
                Ok(())
            }
            // Updates for evicted streams are absorbed.
            None => Ok(()),
        }
    }

    /// Replenish receive accounting and send the matching WINDOW_UPDATEs.
    /// Runs when a worker consumed body bytes, and for padding.
    async fn grant_credit(&mut self, id: u32, bytes: usize) -> Result<(), ServerError> {
        if bytes == 0 {
            return Ok(());
        }
        self.conn_recv_window.replenish(bytes as u32);
        let mut frames = vec![encode_window_update(0, bytes as u32)];
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.recv_window.replenish(bytes as u32);
            frames.push(encode_window_update(id, bytes as u32));
        }
        self.writer.send_all(&frames).await?;
        Ok(())
    }

    async fn grant_connection_credit(&mut self, bytes: usize) -> Result<(), Http2Error> {
        if bytes == 0 {
            return Ok(());
        }
        self.conn_recv_window.replenish(bytes as u32);
        self.writer
            .send(encode_window_update(0, bytes as u32))
            .await
            .map_err(|e| io_to_conn(ServerError::Io(e)))?;
        Ok(())
    }

    /// A worker reported completion: grant the drain window or evict.
    fn on_stream_completed(&mut self, id: u32) {
        let now = Instant::now();
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if stream.local_complete {
            return;
        }
        stream.local_complete = true;
        self.active_streams -= 1;

        if stream.fully_closed() {
            self.evict(id);
        } else if stream.drain_deadline.is_none() {
            // One drain grant per stream, on first sight.
            stream.drain_deadline = Some(now + self.timeouts.body_drain);
        }
        if self.active_streams == 0 {
            self.arm_keep_alive();
        }
    }

    fn maybe_evict(&mut self, id: u32) {
        if self
            .streams
            .get(&id)
            .map_or(false, StreamState::fully_closed)
        {
            self.evict(id);
        }
    }

    fn evict(&mut self, id: u32) {
        if let Some(mut stream) = self.streams.remove(&id) {
            if !stream.local_complete {
                self.active_streams -= 1;
                stream.abort(ServerError::RequestAborted);
            }
            debug!(connection_id = %self.connection_id, stream_id = id, "stream closed");
        }
        if self.active_streams == 0 {
            self.arm_keep_alive();
        }
    }

    /// Timer wake-up: expire the armed timeout reason and any elapsed drain
    /// grants. `Some(result)` ends the connection.
    async fn on_tick(
        &mut self,
        now: Instant,
    ) -> Result<Option<Result<(), ServerError>>, ServerError> {
        if let Some(reason) = self.timeout.fired(now) {
            match reason {
                TimeoutReason::KeepAlive => {
                    debug!(connection_id = %self.connection_id, "keep-alive expired, closing");
                    return Ok(Some(self.close_gracefully().await));
                }
                TimeoutReason::RequestHeaders => {
                    let error = ConnectionError::new(
                        Http2ErrorCode::ProtocolError,
                        "request headers were not received in time",
                    );
                    return Ok(Some(self.teardown(error).await));
                }
                other => {
                    warn!(connection_id = %self.connection_id, timeout = %other, "connection timed out");
                    self.abort_streams("connection timed out");
                    return Ok(Some(Err(ServerError::Timeout(other.as_str()))));
                }
            }
        }

        // Streams whose drain window elapsed without both sides closing.
        let expired: Vec<u32> = self
            .streams
            .values()
            .filter(|s| {
                !s.fully_closed() && s.drain_deadline.map_or(false, |deadline| now >= deadline)
            })
            .map(|s| s.id)
            .collect();
        for id in expired {
            if self.headers.as_ref().map(|acc| acc.stream_id) == Some(id) {
                // Reaping the stream whose trailers are mid-decode would
                // leave the connection in an unrecoverable ambiguity.
                let error = ConnectionError::new(
                    Http2ErrorCode::StreamClosed,
                    "stream drain expired while its trailers were being received",
                );
                return Ok(Some(self.teardown(error).await));
            }
            debug!(connection_id = %self.connection_id, stream_id = id, "drain timeout expired");
            self.evict(id);
        }
        Ok(None)
    }

    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let timer = self.timeout.poll_deadline(now);
        let drain = self
            .streams
            .values()
            .filter(|s| !s.fully_closed())
            .filter_map(|s| s.drain_deadline)
            .min();
        match (timer, drain) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) => deadline,
            (None, deadline) => deadline,
        }
    }

    fn arm_keep_alive(&self) {
        if let Some(after) = self.timeouts.keep_alive {
            self.timeout
                .set_timeout(TimeoutReason::KeepAlive, after, Instant::now());
        }
    }

    async fn reset_stream(&mut self, error: StreamError) -> Result<(), ServerError> {
        warn!(
            connection_id = %self.connection_id,
            stream_id = error.stream_id,
            code = %error.code,
            message = %error.message,
            "stream reset"
        );
        self.writer
            .send(encode_rst_stream(error.stream_id, error.code))
            .await?;
        if let Some(stream) = self.streams.get_mut(&error.stream_id) {
            stream.rst_stream_sent = true;
            stream.abort(ServerError::RequestAborted);
            self.maybe_evict(error.stream_id);
        }
        Ok(())
    }

    async fn close_gracefully(&mut self) -> Result<(), ServerError> {
        if !self.goaway_sent {
            self.goaway_sent = true;
            let goaway = encode_goaway(self.highest_opened, Http2ErrorCode::NoError, b"");
            self.writer.send(goaway).await?;
        }
        Ok(())
    }

    /// Announce GOAWAY(NO_ERROR) and stop accepting streams; the connection
    /// closes once the in-flight workers complete and drain.
    async fn begin_shutdown(&mut self) -> Result<(), ServerError> {
        debug!(connection_id = %self.connection_id, "graceful shutdown requested");
        self.shutting_down = true;
        self.goaway_sent = true;
        let goaway = encode_goaway(self.highest_opened, Http2ErrorCode::NoError, b"");
        self.writer.send(goaway).await?;
        Ok(())
    }

    async fn teardown(&mut self, error: ConnectionError) -> Result<(), ServerError> {
        error!(
            connection_id = %self.connection_id,
            code = %error.code,
            message = %error.message,
            "connection error"
        );
        let goaway = encode_goaway(self.highest_opened, error.code, error.message.as_bytes());
        // The transport may already be unusable; the GOAWAY is best effort.
        let _ = self.writer.send(goaway).await;
        self.abort_streams(&error.message);
        Err(error.into())
    }

    fn abort_streams(&mut self, message: &str) {
        for (_, mut stream) in self.streams.drain() {
            stream.abort(ServerError::ConnectionAborted(message.to_string()));
            stream.worker.abort();
        }
        self.active_streams = 0;
    }
}

fn io_to_conn(error: ServerError) -> Http2Error {
    Http2Error::Connection(ConnectionError::new(
        Http2ErrorCode::InternalError,
        error.to_string(),
    ))
}
