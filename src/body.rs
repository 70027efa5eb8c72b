//! Request body readers and response transmitters.
//!
//! One [`RequestBody`] / [`ResponseChannel`] pair is created per logical
//! request and handed to the application through its context. The HTTP/1.x
//! variants share the connection's input and output halves with the engine;
//! the HTTP/2 variants talk to the connection loop through channels and to
//! the transport through the shared frame writer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::context::Response;
use crate::h1::message_body::{BodyMode, ChunkedDecoder, ChunkedProgress};
use crate::h2::framing::{encode_data, encode_headers};
use crate::h2::stream::SendWindow;
use crate::timeout::{TimeoutControl, TimeoutReason};
use crate::transport::{FrameSink, InputStream, SharedWriter};
use crate::types::{
    BadRequest, HeaderMap, HttpVersion, MinDataRate, RejectionReason, ServerError,
};

/// Drive `fut` to completion while policing the armed minimum-rate timer.
/// The future stays pinned across timer heartbeats rather than being dropped
/// and recreated, so partial transfer progress is never discarded.
async fn rate_limited<F: std::future::Future>(
    timeout: &TimeoutControl,
    fut: F,
) -> Result<F::Output, ServerError> {
    tokio::pin!(fut);
    loop {
        let now = Instant::now();
        if let Some(reason) = timeout.fired(now) {
            return Err(ServerError::Timeout(reason.as_str()));
        }
        match timeout.poll_deadline(now) {
            Some(deadline) => {
                tokio::select! {
                    out = &mut fut => return Ok(out),
                    _ = sleep_until(deadline) => {}
                }
            }
            None => return Ok(fut.await),
        }
    }
}

/// Messages from the HTTP/2 connection loop to a stream worker's body reader.
pub(crate) enum BodyEvent {
    Data(Bytes),
    Trailers(HeaderMap),
    End,
    Error(ServerError),
}

/// The readable request body handed to the application.
pub struct RequestBody {
    kind: BodyKind,
    trailers: Option<HeaderMap>,
}

enum BodyKind {
    Empty,
    H1(H1Body),
    H2(H2Body),
}

impl RequestBody {
    pub(crate) fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            trailers: None,
        }
    }

    pub(crate) fn h1(
        mode: BodyMode,
        input: Arc<tokio::sync::Mutex<InputStream>>,
        writer: Arc<SharedWriter>,
        timeout: Arc<TimeoutControl>,
        min_rate: Option<MinDataRate>,
        max_body_size: Option<u64>,
        expect_continue: bool,
    ) -> Self {
        let framing = match mode {
            BodyMode::Zero => return Self::empty(),
            BodyMode::ContentLength(n) => H1Framing::ContentLength { remaining: n },
            BodyMode::Chunked => H1Framing::Chunked(ChunkedDecoder::new()),
            BodyMode::Upgrade => H1Framing::Upgrade,
        };
        Self {
            kind: BodyKind::H1(H1Body {
                input,
                writer,
                framing,
                timeout,
                min_rate,
                max_body_size,
                total_read: 0,
                send_continue: expect_continue,
                rate_armed: false,
                done: false,
            }),
            trailers: None,
        }
    }

    pub(crate) fn h2(
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<BodyEvent>,
        credit_tx: mpsc::UnboundedSender<(u32, usize)>,
        max_body_size: Option<u64>,
        timeout: Arc<TimeoutControl>,
        min_rate: Option<MinDataRate>,
    ) -> Self {
        Self {
            kind: BodyKind::H2(H2Body {
                stream_id,
                rx,
                credit_tx,
                max_body_size,
                timeout,
                min_rate,
                rate_armed: false,
                total_read: 0,
                done: false,
            }),
            trailers: None,
        }
    }

    /// Next run of body bytes; `None` once the body has ended.
    pub async fn read(&mut self) -> Result<Option<Bytes>, ServerError> {
        match &mut self.kind {
            BodyKind::Empty => Ok(None),
            BodyKind::H1(body) => body.read().await,
            BodyKind::H2(body) => {
                let (data, trailers) = body.read().await?;
                if trailers.is_some() {
                    self.trailers = trailers;
                }
                Ok(data)
            }
        }
    }

    /// Trailer fields, available once `read` has returned `None`.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub(crate) fn is_done(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::H1(body) => body.done,
            BodyKind::H2(body) => body.done,
        }
    }

    /// Best-effort consumption of the remainder; the caller has already armed
    /// the drain timeout.
    pub(crate) async fn drain(&mut self) -> Result<(), ServerError> {
        if let BodyKind::H1(body) = &mut self.kind {
            // Suppress the data-rate arming; the drain deadline governs.
            body.rate_armed = true;
        }
        while self.read().await?.is_some() {}
        Ok(())
    }
}

enum H1Framing {
    ContentLength { remaining: u64 },
    Chunked(ChunkedDecoder),
    Upgrade,
}

struct H1Body {
    input: Arc<tokio::sync::Mutex<InputStream>>,
    writer: Arc<SharedWriter>,
    framing: H1Framing,
    timeout: Arc<TimeoutControl>,
    min_rate: Option<MinDataRate>,
    max_body_size: Option<u64>,
    total_read: u64,
    send_continue: bool,
    rate_armed: bool,
    done: bool,
}

impl H1Body {
    async fn read(&mut self) -> Result<Option<Bytes>, ServerError> {
        if self.done {
            return Ok(None);
        }
        if self.send_continue {
            // The interim response is only sent once the application actually
            // asks for the body.
            self.send_continue = false;
            self.writer
                .send(Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"))
                .await?;
        }
        if !self.rate_armed {
            self.rate_armed = true;
            if let Some(rate) = self.min_rate {
                self.timeout
                    .set_data_rate(TimeoutReason::ReadDataRate, rate, Instant::now());
            }
        }

        loop {
            let mut input = self.input.lock().await;
            match &mut self.framing {
                H1Framing::ContentLength { remaining } => {
                    if *remaining == 0 {
                        drop(input);
                        return Ok(self.complete());
                    }
                    if !input.buf.is_empty() {
                        let take = (input.buf.len() as u64).min(*remaining) as usize;
                        let data = input.buf.take(take);
                        *remaining -= take as u64;
                        drop(input);
                        return self.account(data).map(Some);
                    }
                }
                H1Framing::Chunked(decoder) => {
                    match decoder.decode(&mut input.buf).map_err(ServerError::from)? {
                        ChunkedProgress::Data(data) => {
                            drop(input);
                            return self.account(data).map(Some);
                        }
                        ChunkedProgress::Done => {
                            drop(input);
                            return Ok(self.complete());
                        }
                        ChunkedProgress::NeedMore => {}
                    }
                }
                H1Framing::Upgrade => {
                    if !input.buf.is_empty() {
                        let len = input.buf.len();
                        let data = input.buf.take(len);
                        drop(input);
                        return self.account(data).map(Some);
                    }
                    if input.is_eof() {
                        drop(input);
                        return Ok(self.complete());
                    }
                }
            }

            // Need more transport bytes.
            let filled = self.fill(&mut input).await?;
            if !filled {
                return Err(BadRequest::new(RejectionReason::UnexpectedEndOfRequestContent).into());
            }
        }
    }

    async fn fill(&self, input: &mut InputStream) -> Result<bool, ServerError> {
        loop {
            let now = Instant::now();
            if let Some(reason) = self.timeout.fired(now) {
                return Err(ServerError::Timeout(reason.as_str()));
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

    fn account(&mut self, data: Bytes) -> Result<Bytes, ServerError> {
        self.total_read += data.len() as u64;
        if let Some(max) = self.max_body_size {
            if self.total_read > max {
                self.done = true;
                return Err(BadRequest::new(RejectionReason::RequestBodyTooLarge).into());
            }
        }
        self.timeout.record_transfer(data.len() as u64);
        Ok(data)
    }

    fn complete(&mut self) -> Option<Bytes> {
        self.done = true;
        if self.timeout.reason() == TimeoutReason::ReadDataRate {
            self.timeout.cancel();
        }
        None
    }
}

struct H2Body {
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<BodyEvent>,
    credit_tx: mpsc::UnboundedSender<(u32, usize)>,
    max_body_size: Option<u64>,
    timeout: Arc<TimeoutControl>,
    min_rate: Option<MinDataRate>,
    rate_armed: bool,
    total_read: u64,
    done: bool,
}

impl H2Body {
    async fn read(&mut self) -> Result<(Option<Bytes>, Option<HeaderMap>), ServerError> {
        loop {
            if self.done {
                return Ok((None, None));
            }
            if !self.rate_armed {
                self.rate_armed = true;
                if let Some(rate) = self.min_rate {
                    self.timeout
                        .set_data_rate(TimeoutReason::ReadDataRate, rate, Instant::now());
                }
            }
            let event = rate_limited(&self.timeout, self.rx.recv()).await?;
            match event {
                Some(BodyEvent::Data(data)) => {
                    self.total_read += data.len() as u64;
                    if let Some(max) = self.max_body_size {
                        if self.total_read > max {
                            self.done = true;
                            return Err(
                                BadRequest::new(RejectionReason::RequestBodyTooLarge).into()
                            );
                        }
                    }
                    // Consuming the data is what grants the client new window
                    // credit; the connection loop sends the WINDOW_UPDATEs.
                    let _ = self.credit_tx.send((self.stream_id, data.len()));
                    self.timeout.record_transfer(data.len() as u64);
                    return Ok((Some(data), None));
                }
                Some(BodyEvent::Trailers(trailers)) => return Ok((None, Some(trailers))),
                Some(BodyEvent::End) => {
                    self.done = true;
                    if self.timeout.reason() == TimeoutReason::ReadDataRate {
                        self.timeout.cancel();
                    }
                    return Ok((None, None));
                }
                Some(BodyEvent::Error(error)) => {
                    self.done = true;
                    return Err(error);
                }
                None => {
                    self.done = true;
                    return Err(ServerError::RequestAborted);
                }
            }
        }
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// The writable response surface handed to the application.
pub struct ResponseChannel {
    kind: ResponseKind,
}

enum ResponseKind {
    H1(H1Output),
    H2(H2Output),
}

impl ResponseChannel {
    pub(crate) fn h1(
        writer: Arc<SharedWriter>,
        version: HttpVersion,
        head: bool,
        close: bool,
        timeout: Arc<TimeoutControl>,
        min_rate: Option<MinDataRate>,
    ) -> Self {
        Self {
            kind: ResponseKind::H1(H1Output {
                writer,
                version,
                head,
                close,
                started: false,
                chunked: false,
                finished: false,
                timeout,
                min_rate,
                rate_armed: false,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn h2(
        stream_id: u32,
        sink: Arc<dyn FrameSink>,
        send_window: Arc<SendWindow>,
        conn_send_window: Arc<SendWindow>,
        peer_max_frame: Arc<AtomicU32>,
        head: bool,
        timeout: Arc<TimeoutControl>,
        min_rate: Option<MinDataRate>,
    ) -> Self {
        Self {
            kind: ResponseKind::H2(H2Output {
                stream_id,
                sink,
                send_window,
                conn_send_window,
                peer_max_frame,
                head,
                timeout,
                min_rate,
                rate_armed: false,
                started: false,
                finished: false,
            }),
        }
    }

    /// Response headers already on the wire?
    pub fn started(&self) -> bool {
        match &self.kind {
            ResponseKind::H1(out) => out.started,
            ResponseKind::H2(out) => out.started,
        }
    }

    pub(crate) fn finished(&self) -> bool {
        match &self.kind {
            ResponseKind::H1(out) => out.finished,
            ResponseKind::H2(out) => out.finished,
        }
    }

    /// The h1 response ends the connection, either because the status head
    /// said `connection: close` or because framing fell back to
    /// close-delimited streaming.
    pub(crate) fn will_close(&self) -> bool {
        match &self.kind {
            ResponseKind::H1(out) => out.close,
            ResponseKind::H2(_) => false,
        }
    }

    pub(crate) async fn write(
        &mut self,
        response: &Response,
        data: &[u8],
    ) -> Result<(), ServerError> {
        match &mut self.kind {
            ResponseKind::H1(out) => out.write(response, data).await,
            ResponseKind::H2(out) => out.write(response, data).await,
        }
    }

    pub(crate) async fn finish(&mut self, response: &Response) -> Result<(), ServerError> {
        match &mut self.kind {
            ResponseKind::H1(out) => out.finish(response).await,
            ResponseKind::H2(out) => out.finish(response).await,
        }
    }
}

struct H1Output {
    writer: Arc<SharedWriter>,
    version: HttpVersion,
    head: bool,
    close: bool,
    started: bool,
    chunked: bool,
    finished: bool,
    timeout: Arc<TimeoutControl>,
    min_rate: Option<MinDataRate>,
    rate_armed: bool,
}

impl H1Output {
    /// Serialize the status line and header section. `declared_length` is
    /// used when the application never declared framing itself: `Some(0)` for
    /// a bodyless finish, `None` to pick chunked (1.1) or close-delimited
    /// (1.0) streaming.
    async fn start(
        &mut self,
        response: &Response,
        declared_length: Option<u64>,
    ) -> Result<(), ServerError> {
        let mut head = BytesMut::with_capacity(256);
        head.put_slice(self.version.as_str().as_bytes());
        head.put_slice(
            format!(" {} {}\r\n", response.status, reason_phrase(response.status)).as_bytes(),
        );
        for header in response.headers.iter() {
            head.put_slice(header.name.as_bytes());
            head.put_slice(b": ");
            head.put_slice(header.value.as_bytes());
            head.put_slice(b"\r\n");
        }

        let framed = response.headers.contains("content-length")
            || response.headers.contains("transfer-encoding");
        if !framed && !self.head {
            match declared_length {
                Some(n) => head.put_slice(format!("content-length: {}\r\n", n).as_bytes()),
                None => {
                    if self.version == HttpVersion::Http11 {
                        head.put_slice(b"transfer-encoding: chunked\r\n");
                        self.chunked = true;
                    } else {
                        // HTTP/1.0 streaming is delimited by connection close.
                        self.close = true;
                    }
                }
            }
        }
        if self.close {
            head.put_slice(b"connection: close\r\n");
        }
        head.put_slice(b"\r\n");

        self.started = true;
        self.writer.send(head.freeze()).await?;
        Ok(())
    }

    async fn write(&mut self, response: &Response, data: &[u8]) -> Result<(), ServerError> {
        if !self.started {
            self.start(response, None).await?;
        }
        if !self.rate_armed {
            self.rate_armed = true;
            if let Some(rate) = self.min_rate {
                self.timeout
                    .set_data_rate(TimeoutReason::WriteDataRate, rate, Instant::now());
            }
        }
        if self.head || data.is_empty() {
            return Ok(());
        }

        // A peer that stops reading wedges the transport write; racing the
        // send against the rate deadline lets the timer fire mid-write.
        if self.chunked {
            let mut framed = BytesMut::with_capacity(data.len() + 16);
            framed.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
            framed.put_slice(data);
            framed.put_slice(b"\r\n");
            rate_limited(&self.timeout, self.writer.send(framed.freeze())).await??;
        } else {
            rate_limited(&self.timeout, self.writer.send(Bytes::copy_from_slice(data)))
                .await??;
        }

        self.timeout.record_transfer(data.len() as u64);
        Ok(())
    }

    async fn finish(&mut self, response: &Response) -> Result<(), ServerError> {
        if self.finished {
            return Ok(());
        }
        if !self.started {
            self.start(response, Some(0)).await?;
        }
        if self.chunked && !self.head {
            self.writer.send(Bytes::from_static(b"0\r\n\r\n")).await?;
        }
        self.finished = true;
        if self.timeout.reason() == TimeoutReason::WriteDataRate {
            self.timeout.cancel();
        }
        Ok(())
    }
}

struct H2Output {
    stream_id: u32,
    sink: Arc<dyn FrameSink>,
    send_window: Arc<SendWindow>,
    conn_send_window: Arc<SendWindow>,
    peer_max_frame: Arc<AtomicU32>,
    head: bool,
    timeout: Arc<TimeoutControl>,
    min_rate: Option<MinDataRate>,
    rate_armed: bool,
    started: bool,
    finished: bool,
}

impl H2Output {
    fn max_frame(&self) -> usize {
        self.peer_max_frame.load(Ordering::Acquire) as usize
    }

    async fn start(&mut self, response: &Response, end_stream: bool) -> Result<(), ServerError> {
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(response.headers.len() + 1);
        fields.push((b":status".to_vec(), response.status.to_string().into_bytes()));
        for header in response.headers.iter() {
            fields.push((
                header.name.to_ascii_lowercase().into_bytes(),
                header.value.clone().into_bytes(),
            ));
        }
        let block = hpack::Encoder::new()
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));

        let frames = encode_headers(self.stream_id, &block, end_stream, self.max_frame());
        let mut wire = BytesMut::new();
        for frame in &frames {
            wire.put_slice(frame);
        }
        self.started = true;
        self.sink.send(wire.freeze()).await?;
        Ok(())
    }

    async fn write(&mut self, response: &Response, data: &[u8]) -> Result<(), ServerError> {
        if !self.started {
            self.start(response, false).await?;
        }
        if !self.rate_armed {
            self.rate_armed = true;
            if let Some(rate) = self.min_rate {
                self.timeout
                    .set_data_rate(TimeoutReason::WriteDataRate, rate, Instant::now());
            }
        }
        if self.head {
            return Ok(());
        }
        let mut rest = data;
        while !rest.is_empty() {
            let want = rest.len().min(self.max_frame());
            // A peer that stops replenishing window credit or stops reading
            // stalls right here, so the rate timer polices both waits.
            let take = rate_limited(&self.timeout, self.send_window.reserve(want))
                .await?
                .ok_or(ServerError::RequestAborted)?;
            rate_limited(&self.timeout, self.conn_send_window.reserve_exact(take))
                .await?
                .ok_or(ServerError::RequestAborted)?;
            let (chunk, tail) = rest.split_at(take);
            rest = tail;
            rate_limited(
                &self.timeout,
                self.sink.send(encode_data(self.stream_id, chunk, false)),
            )
            .await??;
            self.timeout.record_transfer(take as u64);
        }
        Ok(())
    }

    async fn finish(&mut self, response: &Response) -> Result<(), ServerError> {
        if self.finished {
            return Ok(());
        }
        if !self.started {
            self.start(response, true).await?;
        } else {
            // Zero-length END_STREAM needs no window credit.
            self.sink.send(encode_data(self.stream_id, &[], true)).await?;
        }
        self.finished = true;
        if self.timeout.reason() == TimeoutReason::WriteDataRate {
            self.timeout.cancel();
        }
        Ok(())
    }
}
