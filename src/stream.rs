//! Streaming client for the transcription service.
//!
//! Composes the TCP control link and the UDP bulk link: control traffic
//! (handshake, token, heartbeats, typed JSON messages) goes over TCP, audio
//! bytes go over UDP to an endpoint the server advertises in an
//! `init_udpaddr` message after authentication. Loss of the control link is
//! promoted to a full close.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::bulk::BulkLink;
use crate::control::{topic as control_topic, ControlLink};
use crate::error::{BotError, BotResult};
use crate::event::{EventBus, HandlerId};

/// Event topics emitted by a [`StreamClient`] itself. Control-link topics
/// are re-exposed through the `on_*` subscription methods.
pub mod topic {
    pub const CONNECTED: &str = "stream.connected";
}

/// UDP endpoint advertised by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct UdpEndpoint {
    pub host: String,
    pub port: u16,
    pub encryption: bool,
}

#[derive(Debug, Deserialize)]
pub struct UdpAddrBody {
    pub udp: UdpEndpoint,
}

/// Typed messages the server sends over the control link.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A transcription fragment. The payload is the entire remaining body;
    /// the textual fragment lives in `msg`.
    #[serde(rename = "msg")]
    Fragment { msg: serde_json::Value },

    #[serde(rename = "init_udpaddr")]
    InitUdpAddr { msg: UdpAddrBody },
}

impl ServerMessage {
    /// Parse one control record. Records that are not valid typed JSON
    /// return `None` and are ignored by callers.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Extract the textual fragment from a `msg` payload.
pub fn fragment_text(msg: &serde_json::Value) -> String {
    match msg {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct StreamClient {
    control: Arc<ControlLink>,
    bulk: std::sync::RwLock<Option<Arc<BulkLink>>>,
    bus: EventBus,
    closed: AtomicBool,
    weak_self: std::sync::Weak<Self>,
}

impl StreamClient {
    pub fn new(host: &str, port: u16, encryption: bool, secret_token: &str) -> Arc<Self> {
        let control = ControlLink::new(format!("{host}:{port}"), encryption, secret_token);
        Arc::new_cyclic(|weak| Self {
            control,
            bulk: std::sync::RwLock::new(None),
            bus: EventBus::new(),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to decoded control-link records (transcription fragments
    /// and typed messages). Queued until the link is connected.
    pub fn on_message<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.control.on_message(handler)
    }

    pub fn off_message(&self, id: HandlerId) {
        self.control.off_message(id);
    }

    pub fn on_connected<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.bus.on(topic::CONNECTED, handler)
    }

    pub fn on_disconnected<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.control.bus().on(control_topic::DISCONNECTED, handler)
    }

    pub fn on_timeout<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.control.bus().on(control_topic::TIMEOUT, handler)
    }

    /// Connect the control link and block until the server has advertised
    /// the UDP endpoint (or the link dies). On success the bulk link is up
    /// and the `connected` event has fired.
    pub async fn connect(&self) -> BotResult<()> {
        let (ready_tx, mut ready_rx) = mpsc::channel::<BotResult<()>>(4);

        // The endpoint waiter goes through the pending queue so it only ever
        // sees post-token traffic. Typed messages other than init_udpaddr
        // are ignored while waiting.
        let tx = ready_tx.clone();
        let weak = self.weak_self.clone();
        let waiter = self.control.on_message(move |raw| {
            let tx = tx.clone();
            let weak = weak.clone();
            async move {
                let Some(ServerMessage::InitUdpAddr { msg }) = ServerMessage::parse(&raw) else {
                    return;
                };
                let Some(client) = weak.upgrade() else { return };
                let endpoint = msg.udp;
                tracing::debug!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    encryption = endpoint.encryption,
                    "Server advertised UDP endpoint"
                );
                let result = BulkLink::connect(
                    &endpoint.host,
                    endpoint.port,
                    endpoint.encryption,
                    client.control.session(),
                );
                match result {
                    Ok(link) => {
                        *client.bulk.write().unwrap() = Some(Arc::new(link));
                        let _ = tx.send(Ok(())).await;
                    }
                    Err(e) => {
                        tracing::error!("Failed to open bulk link: {e}");
                        client.close().await;
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
        });

        // Link death while waiting must unblock the caller.
        let tx = ready_tx.clone();
        let timeout_token = self.control.bus().on(control_topic::TIMEOUT, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx
                    .send(Err(BotError::HandshakeFailed(
                        "link timed out before the UDP endpoint was advertised".into(),
                    )))
                    .await;
            }
        });
        let tx = ready_tx;
        let disconnect_token = self.control.bus().on(control_topic::DISCONNECTED, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx
                    .send(Err(BotError::HandshakeFailed(
                        "link closed before the UDP endpoint was advertised".into(),
                    )))
                    .await;
            }
        });

        let result = match self.control.connect().await {
            Ok(()) => match ready_rx.recv().await {
                Some(outcome) => outcome,
                None => Err(BotError::HandshakeFailed("event channel closed".into())),
            },
            Err(e) => Err(e),
        };

        self.control.off_message(waiter);
        self.control.bus().off(control_topic::TIMEOUT, timeout_token);
        self.control.bus().off(control_topic::DISCONNECTED, disconnect_token);

        if let Err(e) = result {
            self.close().await;
            return Err(e);
        }

        // Promote any later control-link loss to a full close.
        let weak = self.weak_self.clone();
        self.control.bus().on(control_topic::TIMEOUT, move |_| {
            let weak = weak.clone();
            async move {
                if let Some(client) = weak.upgrade() {
                    client.close().await;
                }
            }
        });
        let weak = self.weak_self.clone();
        self.control.bus().on(control_topic::DISCONNECTED, move |_| {
            let weak = weak.clone();
            async move {
                if let Some(client) = weak.upgrade() {
                    client.close().await;
                }
            }
        });

        self.bus.emit(topic::CONNECTED, "connected");
        Ok(())
    }

    /// Send one control record (e.g. a task switch) over the TCP leg.
    pub async fn send_tcp(&self, message: &str) -> BotResult<()> {
        self.control.send(message).await
    }

    /// Send one datagram over the UDP leg.
    pub fn send_udp(&self, data: &[u8]) -> BotResult<()> {
        let bulk = self.bulk.read().unwrap().clone();
        match bulk {
            Some(link) => link.send(data),
            None => Err(BotError::NotConnected),
        }
    }

    /// Byte sink over the UDP leg, suitable for an Ogg writer.
    pub fn sink(&self) -> StreamSink {
        StreamSink {
            client: self.weak_self.clone(),
        }
    }

    /// Tear down the bulk link, then the control link. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bulk.write().unwrap().take();
        self.control.close().await;
    }
}

/// `io::Write` adapter forwarding every buffer to the UDP uplink. Holds a
/// weak reference so a lingering writer cannot keep a dead client alive.
pub struct StreamSink {
    client: std::sync::Weak<StreamClient>,
}

impl io::Write for StreamSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(client) = self.client.upgrade() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream client is gone",
            ));
        };
        match client.send_udp(buf) {
            Ok(()) => Ok(buf.len()),
            Err(BotError::NotConnected) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "bulk link not ready",
            )),
            Err(BotError::Io(e)) => Err(e),
            Err(other) => Err(io::Error::other(other.to_string())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Poll the transcription service's health endpoint until it answers 200,
/// retrying `attempts` times with `retry_delay` between attempts.
pub async fn await_service_ready(
    host: &str,
    health_port: u16,
    attempts: u32,
    retry_delay: Duration,
) -> BotResult<()> {
    let url = format!("http://{host}:{health_port}/health");
    let client = reqwest::Client::new();

    for attempt in 1..=attempts {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("Transcription service is up ({url})");
                return Ok(());
            }
            Ok(response) => {
                tracing::warn!(
                    "Transcription service not healthy yet ({url}): status {}",
                    response.status()
                );
            }
            Err(e) => {
                tracing::warn!("Transcription service unreachable ({url}): {e}");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(retry_delay).await;
        }
    }

    Err(BotError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        "transcription service did not become healthy",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeServerOptions, FakeTranscriptionServer};
    use std::io::Write;

    #[test]
    fn test_parse_fragment_message() {
        let parsed = ServerMessage::parse(r#"{"type":"msg","msg":"hello"}"#);
        match parsed {
            Some(ServerMessage::Fragment { msg }) => assert_eq!(fragment_text(&msg), "hello"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_init_udpaddr_message() {
        let raw = r#"{"type":"init_udpaddr","msg":{"udp":{"host":"10.0.0.1","port":4455,"encryption":true}}}"#;
        match ServerMessage::parse(raw) {
            Some(ServerMessage::InitUdpAddr { msg }) => {
                assert_eq!(msg.udp.host, "10.0.0.1");
                assert_eq!(msg.udp.port, 4455);
                assert!(msg.udp.encryption);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_and_untyped() {
        assert!(ServerMessage::parse(r#"{"type":"nope"}"#).is_none());
        assert!(ServerMessage::parse("not json").is_none());
    }

    #[test]
    fn test_fragment_text_of_structured_payload() {
        let value = serde_json::json!({"text": "hello", "confidence": 0.9});
        assert_eq!(
            fragment_text(&value),
            r#"{"confidence":0.9,"text":"hello"}"#
        );
    }

    #[tokio::test]
    async fn test_connect_waits_for_udp_endpoint_then_uplinks() {
        let server = FakeTranscriptionServer::start(FakeServerOptions::default()).await;
        let client = StreamClient::new(&server.host(), server.port(), true, "secret");

        let connected = crate::testutil::collect_topic(&client.bus, topic::CONNECTED);
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connected.lock().unwrap().len(), 1);

        let mut sink = client.sink();
        sink.write_all(b"audio page").unwrap();
        assert_eq!(server.next_datagram().await, b"audio page".to_vec());

        client.close().await;
    }

    #[tokio::test]
    async fn test_connect_fails_when_link_dies_before_endpoint() {
        let server = FakeTranscriptionServer::start(FakeServerOptions {
            send_init_udpaddr: false,
            drop_after: Some(Duration::from_millis(100)),
            ..Default::default()
        })
        .await;
        let client = StreamClient::new(&server.host(), server.port(), true, "secret");

        assert!(client.connect().await.is_err());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_timeout_promotes_to_full_close() {
        let server = FakeTranscriptionServer::start(FakeServerOptions::default()).await;
        let client = StreamClient::new(&server.host(), server.port(), true, "secret");
        client.connect().await.unwrap();

        server.drop_connection().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(client.is_closed());
        assert!(matches!(
            client.send_udp(b"late"),
            Err(BotError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_sink_before_endpoint_reports_not_connected() {
        let server = FakeTranscriptionServer::start(FakeServerOptions {
            send_init_udpaddr: false,
            ..Default::default()
        })
        .await;
        let client = StreamClient::new(&server.host(), server.port(), true, "secret");
        let mut sink = client.sink();
        let err = sink.write(b"too early").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_await_service_ready() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
        });

        await_service_ready("127.0.0.1", addr.port(), 3, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_await_service_ready_gives_up() {
        // Nothing listens on the target port.
        let result = await_service_ready("127.0.0.1", 1, 2, Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
