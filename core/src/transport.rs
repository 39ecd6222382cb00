//! Thin adapter over a CoAP client context. This is the only module that
//! touches the network; everything above it works in terms of [`Response`]
//! and [`Transport`], not the underlying `coap` crate, so the protocol
//! client can be driven against a mock transport in tests without a real
//! socket (see `core/tests/protocol.rs`).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use coap::UdpCoAPClient;
use coap_lite::{CoapOption, CoapRequest, MessageType, Packet, RequestType};
use futures_util::stream::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 5683;
pub const DEFAULT_MAX_AGE: u32 = 60;

/// RFC 7641 §3.6: a client deregisters an observation by re-issuing the
/// request with the Observe option set to this value.
const OBSERVE_DEREGISTER: u32 = 1;
const UNOBSERVE_TIMEOUT: Duration = Duration::from_secs(5);

/// One CoAP response, reduced to what the protocol layer needs: the raw
/// payload bytes and the max-age cache hint (defaulted when the device
/// doesn't send one).
#[derive(Debug, Clone)]
pub struct Response {
    pub payload: Vec<u8>,
    pub max_age: u32,
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Response>> + Send>>;

/// The request/observe/shutdown surface the protocol client depends on.
/// Implemented by [`RequestEngine`] against a real CoAP socket, and by a
/// mock in tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, observe: Option<u32>, timeout: Duration) -> Result<Response>;
    async fn post(&self, path: &str, payload: Vec<u8>, timeout: Duration) -> Result<Response>;
    async fn observe(&self, path: &str) -> Result<ResponseStream>;
    /// Cancels an observation of `path` (RFC 7641 deregister). Called from
    /// [`CancelOnDrop`] when the caller drops its observation handle; never
    /// propagated beyond a log line since there is no one left to hand the
    /// error to at that point.
    async fn unobserve(&self, path: &str) -> Result<()>;
    async fn shutdown(&self);
}

/// Wraps the [`ResponseStream`] an [`observe`](Transport::observe) call
/// returns so that dropping the stream — the documented way a caller
/// cancels an observation — sends a CoAP deregister instead of just
/// leaving the device's notification list stale until the whole client
/// shuts down.
pub struct CancelOnDrop {
    inner: ResponseStream,
    transport: Arc<dyn Transport>,
    path: String,
}

impl CancelOnDrop {
    pub fn new(inner: ResponseStream, transport: Arc<dyn Transport>, path: impl Into<String>) -> Self {
        CancelOnDrop {
            inner,
            transport,
            path: path.into(),
        }
    }
}

impl Stream for CancelOnDrop {
    type Item = Result<Response>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let transport = self.transport.clone();
        let path = self.path.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.unobserve(&path).await {
                debug!(error = %e, path, "failed to send observe deregister on stream drop");
            }
        });
    }
}

fn extract_max_age(packet: &Packet) -> u32 {
    packet
        .get_option(CoapOption::MaxAge)
        .and_then(|values| values.front())
        .and_then(|bytes| {
            let mut buf = [0u8; 4];
            let n = bytes.len().min(4);
            buf[4 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
            Some(u32::from_be_bytes(buf))
        })
        .unwrap_or(DEFAULT_MAX_AGE)
}

/// Real [`Transport`] backed by the `coap` crate's async UDP client.
///
/// The client is held behind `Mutex<Option<_>>` rather than bare, so that
/// [`shutdown`](Transport::shutdown) can `.take()` and drop it immediately,
/// releasing the UDP socket on the spot instead of waiting for
/// `RequestEngine` itself to drop. This matters for a caller that opens and
/// tears down many short-lived clients in a tight loop (one per candidate
/// host) and needs each socket freed before the next one opens.
pub struct RequestEngine {
    client: Mutex<Option<UdpCoAPClient>>,
}

impl RequestEngine {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let client = UdpCoAPClient::new_udp((host, port))
            .await
            .map_err(|e| Error::Network(format!("failed to open CoAP endpoint: {e}")))?;
        Ok(RequestEngine {
            client: Mutex::new(Some(client)),
        })
    }
}

const SHUTDOWN_ERR: &str = "request engine already shut down";

#[async_trait::async_trait]
impl Transport for RequestEngine {
    async fn get(&self, path: &str, observe: Option<u32>, timeout: Duration) -> Result<Response> {
        let mut request: CoapRequest<std::net::SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.set_path(path);
        request.message.header.set_type(MessageType::Confirmable);
        if let Some(value) = observe {
            let bytes = if value == 0 {
                vec![0u8]
            } else {
                value.to_be_bytes().to_vec()
            };
            request.message.set_observe(bytes);
        }

        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| Error::Network(SHUTDOWN_ERR.to_string()))?;

        let response = tokio::time::timeout(timeout, client.send(&request))
            .await
            .map_err(|_| Error::Network(format!("GET {path} timed out")))?
            .map_err(|e| Error::Network(format!("GET {path} failed: {e}")))?;

        Ok(Response {
            max_age: extract_max_age(&response.message),
            payload: response.message.payload,
        })
    }

    async fn post(&self, path: &str, payload: Vec<u8>, timeout: Duration) -> Result<Response> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| Error::Network(SHUTDOWN_ERR.to_string()))?;

        let response = tokio::time::timeout(timeout, client.post(path, payload))
            .await
            .map_err(|_| Error::Network(format!("POST {path} timed out")))?
            .map_err(|e| Error::Network(format!("POST {path} failed: {e}")))?;

        Ok(Response {
            max_age: extract_max_age(&response.message),
            payload: response.message.payload,
        })
    }

    async fn observe(&self, path: &str) -> Result<ResponseStream> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| Error::Network(SHUTDOWN_ERR.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<Response>>(32);
        let path = path.to_string();

        client
            .observe(&path, move |packet| {
                let response = Response {
                    max_age: extract_max_age(&packet),
                    payload: packet.payload,
                };
                if let Err(e) = tx.try_send(Ok(response)) {
                    debug!(error = %e, "dropping observe notification, consumer not keeping up or gone");
                }
            })
            .await
            .map_err(|e| Error::Network(format!("observe {path} failed: {e}")))?;

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn unobserve(&self, path: &str) -> Result<()> {
        self.get(path, Some(OBSERVE_DEREGISTER), UNOBSERVE_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Drops the held `UdpCoAPClient`, releasing the UDP socket immediately
    /// rather than waiting for `RequestEngine` itself to be dropped.
    /// Idempotent: shutting down twice is a no-op the second time.
    async fn shutdown(&self) {
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            debug!("request engine shut down, UDP socket released");
        }
    }
}
