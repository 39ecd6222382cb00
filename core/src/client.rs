//! The device-facing surface: composes the codec, session and request
//! engine into `get_status`, `observe_status` and `set_control_values`.
//! One [`Client`] owns one [`Session`] and one transport for its entire
//! lifetime; operations on a single client are serialized through the
//! session lock, matching the single-consumer, no-concurrent-writes model
//! the protocol requires.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::schema;
use crate::session::Session;
use crate::transport::{CancelOnDrop, RequestEngine, Transport};

const STATUS_PATH: &str = "/sys/dev/status";
const CONTROL_PATH: &str = "/sys/dev/control";

pub const DEFAULT_RETRY_COUNT: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The device-facing protocol client. Construct with [`Client::create`]
/// for the real network transport, or [`Client::with_transport`] against a
/// mock in tests.
pub struct Client {
    transport: Arc<dyn Transport>,
    session: Mutex<Session>,
}

impl Client {
    /// Opens a CoAP endpoint to `host:port` and returns an unsynced client.
    /// The handshake happens lazily, on first network operation.
    pub async fn create(host: &str, port: u16) -> Result<Self> {
        let engine = RequestEngine::connect(host, port).await?;
        Ok(Self::with_transport(Arc::new(engine)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Client {
            transport,
            session: Mutex::new(Session::new()),
        }
    }

    async fn ensure_synced(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if !session.is_synced() {
            session.sync(self.transport.as_ref()).await?;
        }
        Ok(())
    }

    /// Reads the device's current state once. Always propagates errors —
    /// unlike [`Client::observe_status`], there is no stream to keep alive.
    ///
    /// Holds the session lock across the handshake (if needed) and the GET
    /// itself, not just the counter bump, so this request's response is
    /// delivered before any other operation on this client begins.
    pub async fn get_status(&self) -> Result<(Map<String, Value>, u32)> {
        let mut session = self.session.lock().await;
        if !session.is_synced() {
            session.sync(self.transport.as_ref()).await?;
        }
        let response = self
            .transport
            .get(STATUS_PATH, Some(0), REQUEST_TIMEOUT)
            .await?;
        drop(session);

        let reported = self.decode_status_response(response.payload)?;
        Ok((reported, response.max_age))
    }

    fn decode_status_response(&self, payload: Vec<u8>) -> Result<Map<String, Value>> {
        let frame = String::from_utf8(payload)
            .map_err(|e| Error::MalformedFrame(format!("response is not UTF-8: {e}")))?;
        let (counter_hex, ciphertext_hex) = codec::verify(&frame)?;
        let plaintext = codec::decrypt(&counter_hex, &ciphertext_hex)?;
        schema::parse_status(&plaintext)
    }

    /// Opens a long-lived observation of the device's status resource.
    /// Frames that fail verification or decryption are logged and dropped;
    /// the stream itself only ends when the underlying transport does.
    /// Single-consumer, not restartable — open a new observation to resume.
    ///
    /// Dropping the returned stream is how a caller cancels the
    /// observation; the stream is wrapped in [`CancelOnDrop`] so that drop
    /// sends a CoAP deregister rather than just abandoning the local
    /// receiver while the device keeps sending notifications.
    pub async fn observe_status(&self) -> Result<impl Stream<Item = Map<String, Value>> + '_> {
        self.ensure_synced().await?;

        let responses = self.transport.observe(STATUS_PATH).await?;
        let responses = CancelOnDrop::new(responses, self.transport.clone(), STATUS_PATH);
        let stream = responses.filter_map(move |item| async move {
            let response = match item {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "observation transport error, dropping notification");
                    return None;
                }
            };
            match self.decode_status_response(response.payload) {
                Ok(reported) => Some(reported),
                Err(e) => {
                    warn!(error = %e, "dropping unparsable observation frame");
                    None
                }
            }
        });
        Ok(stream)
    }

    /// Sugar for `set_control_values({key: value})` with the defaults
    /// documented on [`Client::set_control_values`].
    pub async fn set_control_value(&self, key: &str, value: Value) -> Result<bool> {
        let mut data = Map::new();
        data.insert(key.to_string(), value);
        self.set_control_values(&data, DEFAULT_RETRY_COUNT, true)
            .await
    }

    /// Writes `data` to the device's control resource. On a rejected write
    /// (device status != "success", or any network error), resyncs (if
    /// `resync` is set) and retries, up to `retry_count` total attempts
    /// after the first. A resync consumes one retry slot. Returns whether
    /// any attempt succeeded — never propagates the per-attempt errors.
    ///
    /// The session lock is held for the entire call, across every
    /// encrypt→POST→response cycle and resync in the retry loop, not just
    /// the counter bump. Two concurrent writes on the same client would
    /// otherwise be able to allocate counters in order but race their
    /// POSTs, letting the device observe them out of order and desync
    /// permanently, which per-client serialization of operations forbids.
    pub async fn set_control_values(
        &self,
        data: &Map<String, Value>,
        retry_count: u32,
        resync: bool,
    ) -> Result<bool> {
        let plaintext = schema::build_control_envelope(data);
        let mut remaining = retry_count;
        let mut session = self.session.lock().await;

        loop {
            if !session.is_synced() {
                if let Err(e) = session.sync(self.transport.as_ref()).await {
                    warn!(error = %e, "handshake failed mid-retry-loop, counting as a failed attempt");
                    if remaining == 0 {
                        return Ok(false);
                    }
                    remaining -= 1;
                    continue;
                }
            }

            let frame = match session.encrypt_frame(&plaintext) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encrypt control write, counting as a failed attempt");
                    if remaining == 0 {
                        return Ok(false);
                    }
                    remaining -= 1;
                    continue;
                }
            };

            let succeeded = self.attempt_write(frame).await;
            if succeeded {
                return Ok(true);
            }
            if remaining == 0 {
                warn!(error = %Error::WriteRejected, "exhausted retry budget without a successful write");
                return Ok(false);
            }
            remaining -= 1;

            if resync {
                if let Err(e) = session.force_resync(self.transport.as_ref()).await {
                    warn!(error = %e, "resync failed, will retry write anyway");
                }
            }
        }
    }

    async fn attempt_write(&self, frame: String) -> bool {
        let response = match self
            .transport
            .post(CONTROL_PATH, frame.into_bytes(), REQUEST_TIMEOUT)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "control write failed at the transport level");
                return false;
            }
        };

        match String::from_utf8(response.payload) {
            Ok(plaintext) => schema::write_succeeded(&plaintext),
            Err(e) => {
                warn!(error = %e, "control response was not UTF-8");
                false
            }
        }
    }

    /// Tears down the request engine. Idempotent from the caller's point
    /// of view — failures are logged, never raised.
    pub async fn shutdown(&self) {
        info!("shutting down protocol client");
        self.transport.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Response, ResponseStream, Transport};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A mock transport recording calls and replaying scripted responses,
    /// so the retry/resync loop can be exercised without a real socket.
    struct MockTransport {
        sync_counter: AtomicU32,
        sync_calls: AtomicU32,
        control_script: std::sync::Mutex<Vec<bool>>,
        control_calls: AtomicU32,
    }

    impl MockTransport {
        fn new(sync_counter_hex: &str) -> Self {
            MockTransport {
                sync_counter: AtomicU32::new(u32::from_str_radix(sync_counter_hex, 16).unwrap()),
                sync_calls: AtomicU32::new(0),
                control_script: std::sync::Mutex::new(Vec::new()),
                control_calls: AtomicU32::new(0),
            }
        }

        fn with_control_script(sync_counter_hex: &str, script: Vec<bool>) -> Self {
            let m = Self::new(sync_counter_hex);
            *m.control_script.lock().unwrap() = script;
            m
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn get(&self, _path: &str, _observe: Option<u32>, _timeout: Duration) -> Result<Response> {
            unimplemented!("not exercised in these unit tests")
        }

        async fn post(&self, path: &str, payload: Vec<u8>, _timeout: Duration) -> Result<Response> {
            if path == "/sys/dev/sync" {
                self.sync_calls.fetch_add(1, Ordering::SeqCst);
                let counter = self.sync_counter.load(Ordering::SeqCst);
                return Ok(Response {
                    payload: format!("{counter:08X}").into_bytes(),
                    max_age: 60,
                });
            }
            assert_eq!(path, "/sys/dev/control");
            let idx = self.control_calls.fetch_add(1, Ordering::SeqCst) as usize;
            let script = self.control_script.lock().unwrap();
            let success = script.get(idx).copied().unwrap_or(false);
            let _ = payload;
            let body = if success { r#"{"status":"success"}"# } else { r#"{"status":"failed"}"# };
            Ok(Response {
                payload: body.as_bytes().to_vec(),
                max_age: 60,
            })
        }

        async fn observe(&self, _path: &str) -> Result<ResponseStream> {
            unimplemented!("not exercised in these unit tests")
        }

        async fn unobserve(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn write_succeeds_on_first_attempt() {
        let transport = Arc::new(MockTransport::with_control_script("00000000", vec![true]));
        let client = Client::with_transport(transport.clone());

        let mut data = Map::new();
        data.insert("D03102".to_string(), Value::Bool(true));
        let ok = client.set_control_values(&data, 5, true).await.unwrap();

        assert!(ok);
        assert_eq!(transport.control_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_write_resyncs_once_then_succeeds() {
        let transport = Arc::new(MockTransport::with_control_script(
            "00000000",
            vec![false, true],
        ));
        let client = Client::with_transport(transport.clone());

        let mut data = Map::new();
        data.insert("power".to_string(), Value::Bool(true));
        let ok = client.set_control_values(&data, 2, true).await.unwrap();

        assert!(ok);
        assert_eq!(transport.control_calls.load(Ordering::SeqCst), 2);
        // One handshake before any write, one resync after the first failure.
        assert_eq!(transport.sync_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausting_retries_returns_false() {
        let transport = Arc::new(MockTransport::with_control_script("00000000", vec![false, false, false]));
        let client = Client::with_transport(transport.clone());

        let mut data = Map::new();
        data.insert("power".to_string(), Value::Bool(false));
        let ok = client.set_control_values(&data, 2, false).await.unwrap();

        assert!(!ok);
        assert_eq!(transport.control_calls.load(Ordering::SeqCst), 3);
    }

    /// A transport whose first control POST is deliberately slow, so that a
    /// second concurrent `set_control_values` call has every opportunity to
    /// race ahead of it if the session lock doesn't cover the whole
    /// encrypt→POST→response cycle.
    struct SlowFirstTransport {
        sync_counter: AtomicU32,
        control_calls: AtomicU32,
        events: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait::async_trait]
    impl Transport for SlowFirstTransport {
        async fn get(&self, _path: &str, _observe: Option<u32>, _timeout: Duration) -> Result<Response> {
            unimplemented!("not exercised in this test")
        }

        async fn post(&self, path: &str, _payload: Vec<u8>, _timeout: Duration) -> Result<Response> {
            if path == "/sys/dev/sync" {
                let counter = self.sync_counter.load(Ordering::SeqCst);
                return Ok(Response {
                    payload: format!("{counter:08X}").into_bytes(),
                    max_age: 60,
                });
            }
            let idx = self.control_calls.fetch_add(1, Ordering::SeqCst);
            let (start, end) = if idx == 0 { ("A-start", "A-end") } else { ("B-start", "B-end") };
            self.events.lock().unwrap().push(start);
            if idx == 0 {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            self.events.lock().unwrap().push(end);
            Ok(Response {
                payload: br#"{"status":"success"}"#.to_vec(),
                max_age: 60,
            })
        }

        async fn observe(&self, _path: &str) -> Result<ResponseStream> {
            unimplemented!("not exercised in this test")
        }

        async fn unobserve(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn concurrent_writes_on_one_client_do_not_interleave_their_posts() {
        let transport = Arc::new(SlowFirstTransport {
            sync_counter: AtomicU32::new(0),
            control_calls: AtomicU32::new(0),
            events: std::sync::Mutex::new(Vec::new()),
        });
        let client = Arc::new(Client::with_transport(transport.clone()));

        let client_a = client.clone();
        let task_a = tokio::spawn(async move {
            let mut data = Map::new();
            data.insert("a".to_string(), Value::Bool(true));
            client_a.set_control_values(&data, 0, false).await
        });
        // Give A a head start so it acquires the session lock first.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let client_b = client.clone();
        let task_b = tokio::spawn(async move {
            let mut data = Map::new();
            data.insert("b".to_string(), Value::Bool(true));
            client_b.set_control_values(&data, 0, false).await
        });

        let (result_a, result_b) = tokio::join!(task_a, task_b);
        assert!(result_a.unwrap().unwrap());
        assert!(result_b.unwrap().unwrap());

        // If the session lock didn't cover the whole POST, B's fast write
        // would land in the middle of A's slow one: [A-start, B-start,
        // B-end, A-end]. Serialized, B cannot even start until A finishes.
        let recorded = transport.events.lock().unwrap().clone();
        assert_eq!(recorded, vec!["A-start", "A-end", "B-start", "B-end"]);
    }
}
