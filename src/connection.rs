//! Connection front door: protocol selection and request processing.
//!
//! Every accepted transport gets a [`Connection`], whose one-shot
//! [`Connection::select`] pins the HTTP version from the ALPN result and the
//! configured protocol set. Selection is deliberately separate from serving
//! so callers can inspect the verdict before any bytes are exchanged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::debug;

use crate::context::Application;
use crate::transport::{AlpnInfo, Transport};
use crate::types::{HttpProtocol, Protocols, ServerError, ServerLimits, ServerTimeouts};
use crate::{h1, h2};

/// Server-wide configuration applied to every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub limits: ServerLimits,
    pub timeouts: ServerTimeouts,
    pub protocols: Protocols,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: ServerLimits::default(),
            timeouts: ServerTimeouts::default(),
            protocols: Protocols::Http1AndHttp2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionState {
    Initializing,
    Selected(HttpProtocol),
    Aborted,
}

/// One accepted transport, identified across its whole lifetime by a short
/// printable id that every log line for the connection carries.
pub struct Connection {
    id: String,
    state: Mutex<SelectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: encode_connection_id(next_connection_id()),
            state: Mutex::new(SelectionState::Initializing),
            shutdown_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Begin graceful shutdown. HTTP/2 announces GOAWAY(NO_ERROR), refuses
    /// new streams, and closes once in-flight workers drain; HTTP/1.x
    /// answers the current request with `connection: close` and stops
    /// reusing the connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Pin the protocol for this connection. The verdict is final: repeat
    /// calls return the first selection, and a connection aborted by a
    /// protocol mismatch stays aborted.
    pub fn select(
        &self,
        alpn: &AlpnInfo,
        protocols: Protocols,
    ) -> Result<HttpProtocol, ServerError> {
        let mut state = self.state.lock().expect("selection state poisoned");
        match *state {
            SelectionState::Selected(protocol) => return Ok(protocol),
            SelectionState::Aborted => {
                return Err(ServerError::ConnectionAborted(
                    "connection already aborted by protocol selection".to_string(),
                ));
            }
            SelectionState::Initializing => {}
        }

        let verdict = if alpn.is_h2() {
            match protocols {
                Protocols::Http1Only => None,
                _ => Some(HttpProtocol::Http2),
            }
        } else if alpn.protocol.is_some() {
            // ALPN ran and settled on http/1.1.
            match protocols {
                Protocols::Http2Only => None,
                _ => Some(HttpProtocol::Http1),
            }
        } else {
            // No ALPN: plaintext, or a TLS stack without negotiation. An
            // HTTP/2-only endpoint assumes prior knowledge.
            match protocols {
                Protocols::Http2Only => Some(HttpProtocol::Http2),
                _ => Some(HttpProtocol::Http1),
            }
        };

        match verdict {
            Some(protocol) => {
                *state = SelectionState::Selected(protocol);
                debug!(connection_id = %self.id, ?protocol, "protocol selected");
                Ok(protocol)
            }
            None => {
                *state = SelectionState::Aborted;
                Err(ServerError::ConnectionAborted(format!(
                    "negotiated protocol is not enabled for this endpoint ({:?})",
                    protocols
                )))
            }
        }
    }

    /// Select the protocol, then run the matching engine until the
    /// connection ends.
    pub async fn process_requests<T: Transport>(
        &self,
        transport: T,
        app: Arc<dyn Application>,
        config: &ServerConfig,
        alpn: AlpnInfo,
    ) -> Result<(), ServerError> {
        match self.select(&alpn, config.protocols)? {
            HttpProtocol::Http2 => {
                h2::serve(
                    transport,
                    app,
                    config.limits.clone(),
                    config.timeouts.clone(),
                    self.id.clone(),
                    alpn,
                    self.shutdown_tx.subscribe(),
                )
                .await
            }
            _ => {
                h1::serve(
                    transport,
                    app,
                    config.limits.clone(),
                    config.timeouts.clone(),
                    self.id.clone(),
                    alpn,
                    self.shutdown_tx.subscribe(),
                )
                .await
            }
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

fn next_connection_id() -> u64 {
    static NEXT: OnceLock<AtomicU64> = OnceLock::new();
    let counter = NEXT.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        AtomicU64::new(seed)
    });
    counter.fetch_add(1, Ordering::Relaxed)
}

/// 13 characters of uppercase base32, fixed width so ids line up in logs.
fn encode_connection_id(value: u64) -> String {
    const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";
    let mut out = [0u8; 13];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 60usize.saturating_sub(i * 5);
        *slot = ENCODING[((value >> shift) & 0x1f) as usize];
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_fixed_width() {
        let a = Connection::new();
        let b = Connection::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 13);
        assert!(a.id().bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn alpn_h2_selects_http2() {
        let connection = Connection::new();
        let protocol = connection
            .select(&AlpnInfo::h2(), Protocols::Http1AndHttp2)
            .unwrap();
        assert_eq!(protocol, HttpProtocol::Http2);
        // Repeat calls return the pinned verdict.
        let again = connection
            .select(&AlpnInfo::none(), Protocols::Http1AndHttp2)
            .unwrap();
        assert_eq!(again, HttpProtocol::Http2);
    }

    #[test]
    fn mismatched_alpn_aborts_the_connection() {
        let connection = Connection::new();
        assert!(connection
            .select(&AlpnInfo::h2(), Protocols::Http1Only)
            .is_err());
        // The abort is sticky.
        assert!(connection
            .select(&AlpnInfo::none(), Protocols::Http1Only)
            .is_err());
    }

    #[test]
    fn no_alpn_http2_only_assumes_prior_knowledge() {
        let connection = Connection::new();
        let protocol = connection
            .select(&AlpnInfo::none(), Protocols::Http2Only)
            .unwrap();
        assert_eq!(protocol, HttpProtocol::Http2);
    }

    #[test]
    fn http11_alpn_on_http2_only_endpoint_aborts() {
        let connection = Connection::new();
        assert!(connection
            .select(&AlpnInfo::http11(), Protocols::Http2Only)
            .is_err());
    }
}
