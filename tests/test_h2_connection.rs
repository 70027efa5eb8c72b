use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tidehttp::h2;
use tidehttp::h2::consts::{CONNECTION_PREFACE, SETTINGS_INITIAL_WINDOW_SIZE};
use tidehttp::h2::framing::{
    decode_frame, encode_data, encode_goaway, encode_headers, encode_ping, encode_rst_stream,
    encode_settings, encode_settings_ack, encode_window_update,
};
use tidehttp::types::{
    Http2ErrorCode, Http2Frame, Http2FrameType, ServerError, ServerLimits, ServerTimeouts,
};
use tidehttp::{AlpnInfo, Application, RequestContext};

/// Reads the whole request body and echoes it back; bodyless requests get a
/// fixed greeting.
struct Echo;

#[async_trait]
impl Application for Echo {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<(), ServerError> {
        let mut body = Vec::new();
        while let Some(chunk) = ctx.read_body().await? {
            body.extend_from_slice(&chunk);
        }
        if body.is_empty() {
            ctx.write_body(b"hello").await
        } else {
            ctx.write_body(&body).await
        }
    }
}

/// Writes a short body and reports any write failure back to the test.
struct ReportWrites {
    error_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Application for ReportWrites {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<(), ServerError> {
        while ctx.read_body().await?.is_some() {}
        if let Err(error) = ctx.write_body(&[0u8; 4096]).await {
            let _ = self.error_tx.send(error.to_string());
            return Err(error);
        }
        Ok(())
    }
}

/// A frame assembled by hand, for shapes the encoders refuse to produce.
fn raw_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    out.push(frame_type);
    out.push(flags);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

struct TestClient {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl TestClient {
    async fn send(&mut self, bytes: impl AsRef<[u8]>) {
        self.stream.write_all(bytes.as_ref()).await.unwrap();
    }

    async fn read_frame(&mut self) -> Http2Frame {
        loop {
            if self.buf.len() >= 9 {
                let length =
                    u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]) as usize;
                if self.buf.len() >= 9 + length {
                    let raw: Vec<u8> = self.buf.drain(..9 + length).collect();
                    return decode_frame(&raw).unwrap();
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed while reading a frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next frame of the given type; bookkeeping frames in between (window
    /// credit, settings acks) are skipped.
    async fn read_frame_of(&mut self, frame_type: Http2FrameType) -> Http2Frame {
        for _ in 0..32 {
            let frame = self.read_frame().await;
            if frame.frame_type == frame_type {
                return frame;
            }
        }
        panic!("no {} frame arrived", frame_type);
    }

    fn encode_request_block(&self, fields: &[(&str, &str)]) -> Vec<u8> {
        let owned: Vec<(Vec<u8>, Vec<u8>)> = fields
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        let mut encoder = hpack::Encoder::new();
        encoder.encode(owned.iter().map(|(n, v)| (n.as_slice(), v.as_slice())))
    }

    async fn send_get(&mut self, stream_id: u32, path: &str) {
        let block = self.encode_request_block(&[
            (":method", "GET"),
            (":path", path),
            (":scheme", "http"),
            (":authority", "test"),
        ]);
        for frame in encode_headers(stream_id, &block, true, 16_384) {
            self.send(frame).await;
        }
    }
}

async fn connect<A: Application>(
    app: A,
    limits: ServerLimits,
) -> (TestClient, JoinHandle<Result<(), ServerError>>) {
    let (client, handle, _) = connect_with_shutdown(app, limits, ServerTimeouts::default()).await;
    (client, handle)
}

async fn connect_with_shutdown<A: Application>(
    app: A,
    limits: ServerLimits,
    timeouts: ServerTimeouts,
) -> (
    TestClient,
    JoinHandle<Result<(), ServerError>>,
    watch::Sender<bool>,
) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stream, server) = tokio::io::duplex(256 * 1024);
    let handle = tokio::spawn(h2::serve(
        server,
        Arc::new(app) as Arc<dyn Application>,
        limits,
        timeouts,
        "TESTH2".to_string(),
        AlpnInfo::h2(),
        shutdown_rx,
    ));
    let mut client = TestClient {
        stream,
        buf: Vec::new(),
    };
    client.send(CONNECTION_PREFACE).await;
    client.send(encode_settings(&[])).await;

    let settings = client.read_frame().await;
    assert_eq!(settings.frame_type, Http2FrameType::Settings);
    assert!(!settings.is_ack());
    client.send(encode_settings_ack()).await;

    // The server grows the connection window past the protocol default
    // immediately after its SETTINGS.
    let update = client.read_frame().await;
    assert_eq!(update.frame_type, Http2FrameType::WindowUpdate);
    assert_eq!(update.stream_id, 0);

    (client, handle, shutdown_tx)
}

fn decode_status(block: &[u8]) -> String {
    let mut decoder = hpack::Decoder::new();
    let fields = decoder.decode(block).unwrap();
    let status = fields
        .iter()
        .find(|(name, _)| name == b":status")
        .expect(":status present");
    String::from_utf8_lossy(&status.1).into_owned()
}

#[tokio::test]
async fn simple_get_roundtrips() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;
    client.send_get(1, "/").await;

    let headers = client.read_frame_of(Http2FrameType::Headers).await;
    assert_eq!(headers.stream_id, 1);
    assert!(headers.is_end_headers());
    assert!(!headers.is_end_stream());
    assert_eq!(decode_status(&headers.payload), "200");

    let data = client.read_frame_of(Http2FrameType::Data).await;
    assert_eq!(&data.payload[..], b"hello");

    if !data.is_end_stream() {
        let fin = client.read_frame_of(Http2FrameType::Data).await;
        assert!(fin.is_end_stream());
        assert!(fin.payload.is_empty());
    }

    client.send(encode_goaway(0, 0.into(), b"")).await;
    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn request_body_is_echoed_and_credited() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;

    let block = client.encode_request_block(&[
        (":method", "POST"),
        (":path", "/up"),
        (":scheme", "http"),
        (":authority", "test"),
        ("content-length", "5"),
    ]);
    for frame in encode_headers(1, &block, false, 16_384) {
        client.send(frame).await;
    }
    client.send(encode_data(1, b"abcde", true)).await;

    let headers = client.read_frame_of(Http2FrameType::Headers).await;
    assert_eq!(decode_status(&headers.payload), "200");
    let data = client.read_frame_of(Http2FrameType::Data).await;
    assert_eq!(&data.payload[..], b"abcde");

    // Consumed body bytes come back as connection-level window credit.
    let update = client.read_frame_of(Http2FrameType::WindowUpdate).await;
    assert_eq!(update.stream_id, 0);
    assert_eq!(update.window_increment, 5);

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn oversized_frame_tears_the_connection_down() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;

    // 20000-byte DATA declaration against a 16384 limit; the header alone
    // decides, no payload follows.
    let mut raw = Vec::new();
    raw.extend_from_slice(&20_000u32.to_be_bytes()[1..]);
    raw.push(0x0);
    raw.push(0);
    raw.extend_from_slice(&1u32.to_be_bytes());
    client.send(raw).await;

    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0x6, "FRAME_SIZE_ERROR");
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn duplicate_pseudo_header_tears_the_connection_down() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;

    let block = client.encode_request_block(&[
        (":method", "GET"),
        (":path", "/a"),
        (":path", "/b"),
        (":scheme", "http"),
    ]);
    for frame in encode_headers(1, &block, true, 16_384) {
        client.send(frame).await;
    }

    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0x1, "PROTOCOL_ERROR");
    assert!(
        String::from_utf8_lossy(&goaway.payload).contains("DuplicatePseudoHeaderField"),
        "{:?}",
        goaway.payload
    );
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn zero_window_increment_is_a_connection_error() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;
    client.send(encode_window_update(0, 0)).await;

    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0x1, "PROTOCOL_ERROR");
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn streams_beyond_the_concurrency_limit_are_refused() {
    let limits = ServerLimits {
        http2_max_concurrent_streams: 1,
        ..ServerLimits::default()
    };
    let (mut client, handle) = connect(Echo, limits).await;

    // Stream 1 stays open: no END_STREAM, so the echo handler sits in its
    // body read.
    let block = client.encode_request_block(&[
        (":method", "POST"),
        (":path", "/slow"),
        (":scheme", "http"),
        (":authority", "test"),
    ]);
    for frame in encode_headers(1, &block, false, 16_384) {
        client.send(frame).await;
    }

    client.send_get(3, "/refused").await;
    let rst = client.read_frame_of(Http2FrameType::RstStream).await;
    assert_eq!(rst.stream_id, 3);
    assert_eq!(rst.error_code, 0x7, "REFUSED_STREAM");

    // The connection itself is still healthy.
    client.send(encode_ping([9; 8], false)).await;
    let pong = client.read_frame_of(Http2FrameType::Ping).await;
    assert!(pong.is_ack());
    assert_eq!(pong.ping_payload, [9; 8]);

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn ping_is_echoed_with_ack() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;
    client.send(encode_ping([7, 6, 5, 4, 3, 2, 1, 0], false)).await;

    let pong = client.read_frame_of(Http2FrameType::Ping).await;
    assert!(pong.is_ack());
    assert_eq!(pong.ping_payload, [7, 6, 5, 4, 3, 2, 1, 0]);

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn goaway_with_no_streams_closes_gracefully() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;
    client.send(encode_goaway(0, 0.into(), b"done")).await;

    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0, "NO_ERROR");
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn bad_preface_rejects_the_connection() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stream, server) = tokio::io::duplex(16 * 1024);
    let handle = tokio::spawn(h2::serve(
        server,
        Arc::new(Echo) as Arc<dyn Application>,
        ServerLimits::default(),
        ServerTimeouts::default(),
        "TESTH2".to_string(),
        AlpnInfo::h2(),
        shutdown_rx,
    ));
    drop(shutdown_tx);
    let mut client = TestClient {
        stream,
        buf: Vec::new(),
    };
    client.send(b"GET / HTTP/1.1\r\nhost: al\r\n\r\n").await;
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn withheld_end_headers_cannot_grow_the_block_without_bound() {
    let limits = ServerLimits {
        http2_max_header_list_size: 1024,
        ..ServerLimits::default()
    };
    let (mut client, handle) = connect(Echo, limits).await;

    // HEADERS without END_HEADERS, then CONTINUATION fragments forever. The
    // block must be refused on accumulated size, not at decode time.
    client.send(raw_frame(0x1, 0, 1, &[0u8; 256])).await;
    for _ in 0..2 {
        client.send(raw_frame(0x9, 0, 1, &[0u8; 512])).await;
    }

    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0xb, "ENHANCE_YOUR_CALM");
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn data_after_a_client_reset_tears_the_connection_down() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;

    let block = client.encode_request_block(&[
        (":method", "POST"),
        (":path", "/upload"),
        (":scheme", "http"),
        (":authority", "test"),
    ]);
    for frame in encode_headers(1, &block, false, 16_384) {
        client.send(frame).await;
    }
    client.send(encode_rst_stream(1, Http2ErrorCode::Cancel)).await;
    client.send(encode_data(1, b"late", true)).await;

    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0x5, "STREAM_CLOSED");
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn data_in_flight_past_a_server_reset_is_absorbed() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;

    // content-length 1, then a 3-byte DATA: the server resets the stream.
    let block = client.encode_request_block(&[
        (":method", "POST"),
        (":path", "/short"),
        (":scheme", "http"),
        (":authority", "test"),
        ("content-length", "1"),
    ]);
    for frame in encode_headers(1, &block, false, 16_384) {
        client.send(frame).await;
    }
    client.send(encode_data(1, b"abc", false)).await;
    let rst = client.read_frame_of(Http2FrameType::RstStream).await;
    assert_eq!(rst.stream_id, 1);

    // Bytes already in flight when the reset crossed the wire are tolerated;
    // the connection stays up.
    client.send(encode_data(1, b"de", false)).await;
    client.send(encode_ping([3; 8], false)).await;
    let pong = client.read_frame_of(Http2FrameType::Ping).await;
    assert!(pong.is_ack());

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_shutdown_drains_in_flight_streams() {
    let (mut client, handle, shutdown) =
        connect_with_shutdown(Echo, ServerLimits::default(), ServerTimeouts::default()).await;

    let block = client.encode_request_block(&[
        (":method", "POST"),
        (":path", "/inflight"),
        (":scheme", "http"),
        (":authority", "test"),
    ]);
    for frame in encode_headers(1, &block, false, 16_384) {
        client.send(frame).await;
    }
    // The ping round trip pins stream 1 as open before the shutdown lands.
    client.send(encode_ping([1; 8], false)).await;
    client.read_frame_of(Http2FrameType::Ping).await;

    shutdown.send(true).unwrap();
    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0, "NO_ERROR");

    // New streams are refused while the announced streams drain.
    client.send_get(3, "/too-late").await;
    let rst = client.read_frame_of(Http2FrameType::RstStream).await;
    assert_eq!(rst.stream_id, 3);
    assert_eq!(rst.error_code, 0x7, "REFUSED_STREAM");

    // The in-flight stream still completes normally.
    client.send(encode_data(1, b"bye", true)).await;
    let headers = client.read_frame_of(Http2FrameType::Headers).await;
    assert_eq!(decode_status(&headers.payload), "200");
    let data = client.read_frame_of(Http2FrameType::Data).await;
    assert_eq!(&data.payload[..], b"bye");

    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn zero_window_increment_on_a_stream_is_a_connection_error() {
    let (mut client, handle) = connect(Echo, ServerLimits::default()).await;

    for id in [1u32, 3] {
        let block = client.encode_request_block(&[
            (":method", "POST"),
            (":path", "/open"),
            (":scheme", "http"),
            (":authority", "test"),
        ]);
        for frame in encode_headers(id, &block, false, 16_384) {
            client.send(frame).await;
        }
    }
    client.send(encode_window_update(3, 0)).await;

    let goaway = client.read_frame_of(Http2FrameType::GoAway).await;
    assert_eq!(goaway.error_code, 0x1, "PROTOCOL_ERROR");
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test(start_paused = true)]
async fn stalled_response_write_hits_the_minimum_data_rate() {
    let (error_tx, mut error_rx) = tokio::sync::mpsc::unbounded_channel();
    let app = ReportWrites { error_tx };
    let (mut client, _handle) = connect(app, ServerLimits::default()).await;

    // A zero send window means the response body can never move.
    client
        .send(encode_settings(&[(SETTINGS_INITIAL_WINDOW_SIZE, 0)]))
        .await;
    client.send_get(1, "/stalled").await;

    let headers = client.read_frame_of(Http2FrameType::Headers).await;
    assert_eq!(decode_status(&headers.payload), "200");

    let error = error_rx.recv().await.expect("write error reported");
    assert!(error.contains("minimum data rate"), "{error}");
}
