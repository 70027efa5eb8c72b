//! The duplex byte-stream boundary.
//!
//! The engines are transport-agnostic: anything readable and writable can
//! carry a connection, including TLS-terminated streams and in-memory pipes
//! used by tests. The only TLS-aware code in the crate is the ALPN signal
//! extraction below.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buf::RecvBuffer;

/// A duplex byte stream a connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Read half of a connection plus the segmented buffer its bytes land in.
/// A single `fill` is one transport read, so wrapping it in a timeout never
/// loses partially received bytes.
pub(crate) struct InputStream {
    read: Box<dyn AsyncRead + Send + Unpin>,
    pub buf: RecvBuffer,
    eof: bool,
}

impl InputStream {
    pub fn new(read: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            read: Box::new(read),
            buf: RecvBuffer::new(),
            eof: false,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// One transport read appended to the buffer. `Ok(false)` means the peer
    /// finished its write direction.
    pub async fn fill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let n = self.read.read_buf(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.buf.push(chunk.freeze());
        Ok(true)
    }
}

/// The one genuinely shared mutable resource on a connection: the transport
/// write path. Writes from concurrent stream workers are serialized here so
/// frames are never interleaved mid-frame.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, bytes: Bytes) -> io::Result<()>;
}

pub(crate) struct SharedWriter {
    inner: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl SharedWriter {
    pub fn new(write: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Box::new(write)),
        }
    }

    /// Write several buffers under one lock acquisition so a multi-frame
    /// sequence (HEADERS + CONTINUATIONs) stays contiguous on the wire.
    pub async fn send_all(&self, buffers: &[Bytes]) -> io::Result<()> {
        let mut write = self.inner.lock().await;
        for buffer in buffers {
            write.write_all(buffer).await?;
        }
        write.flush().await
    }
}

#[async_trait]
impl FrameSink for SharedWriter {
    async fn send(&self, bytes: Bytes) -> io::Result<()> {
        let mut write = self.inner.lock().await;
        write.write_all(&bytes).await?;
        write.flush().await
    }
}

/// ALPN protocol identifier for HTTP/2 (RFC 7540 Section 3.3).
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN protocol identifier for HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Application protocol negotiated during the TLS handshake, when there was
/// one. Absence means the selector assumes HTTP/1.1 unless configured
/// HTTP/2-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlpnInfo {
    pub protocol: Option<Vec<u8>>,
}

impl AlpnInfo {
    pub fn none() -> Self {
        Self { protocol: None }
    }

    pub fn h2() -> Self {
        Self {
            protocol: Some(ALPN_H2.to_vec()),
        }
    }

    pub fn http11() -> Self {
        Self {
            protocol: Some(ALPN_HTTP11.to_vec()),
        }
    }

    pub fn is_h2(&self) -> bool {
        self.protocol.as_deref() == Some(ALPN_H2)
    }

    /// Read the negotiated protocol off an accepted server-side TLS stream.
    pub fn from_tls<IO>(stream: &tokio_rustls::server::TlsStream<IO>) -> Self {
        Self {
            protocol: stream.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
        }
    }
}
