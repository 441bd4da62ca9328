//! TCP control channel to the transcription service.
//!
//! Record framing follows the service's protocol: one `read` yields one
//! logical record (up to `read_buffer_size` bytes, no reassembly). After the
//! optional RSA/AES handshake every record is AES-CFB encrypted. The link
//! pushes inbound records onto event topics; all I/O loops run on their own
//! tasks and every I/O error is fatal for the link.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use crate::crypto::CryptoSession;
use crate::error::{BotError, BotResult};
use crate::event::{EventBus, HandlerId};

/// Event topics emitted by a [`ControlLink`].
pub mod topic {
    pub const MESSAGE: &str = "message";
    /// Handlers installed before the link is connected wait here and are
    /// merged onto [`MESSAGE`] once the handshake completes.
    pub const MESSAGE_PENDING: &str = "message.pending";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const TIMEOUT: &str = "timeout";
    pub const PING: &str = "ping";
}

pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

pub struct ControlLink {
    address: String,
    secret_token: String,
    encryption: bool,
    read_buffer_size: usize,
    heartbeat_interval: Duration,
    bus: EventBus,
    state: std::sync::Mutex<LinkState>,
    /// Send mutex: serialises encryption + write. `None` once closed.
    writer: Mutex<Option<OwnedWriteHalf>>,
    session: std::sync::RwLock<Option<CryptoSession>>,
    stop: watch::Sender<bool>,
    /// Back-reference handed to the I/O loops; never upgraded into a cycle.
    weak_self: std::sync::Weak<Self>,
}

impl ControlLink {
    pub fn new(
        address: impl Into<String>,
        encryption: bool,
        secret_token: impl Into<String>,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            address: address.into(),
            secret_token: secret_token.into(),
            encryption,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            bus: EventBus::new(),
            state: std::sync::Mutex::new(LinkState::Disconnected),
            writer: Mutex::new(None),
            session: std::sync::RwLock::new(None),
            stop,
            weak_self: weak.clone(),
        })
    }

    /// Session key material negotiated during connect, shared with the bulk
    /// link. `None` until the handshake has completed.
    pub fn session(&self) -> Option<CryptoSession> {
        *self.session.read().unwrap()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock().unwrap() == LinkState::Connected
    }

    /// Subscribe to inbound records. Handlers installed before the link is
    /// connected are queued and only go live once the handshake and token
    /// exchange have finished, so they never observe handshake traffic.
    pub fn on_message<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.is_connected() {
            self.bus.on(topic::MESSAGE, handler)
        } else {
            self.bus.on(topic::MESSAGE_PENDING, handler)
        }
    }

    pub fn off_message(&self, id: HandlerId) {
        self.bus.off(topic::MESSAGE, id);
        self.bus.off(topic::MESSAGE_PENDING, id);
    }

    /// Dial, handshake, authenticate and bring up the receive and heartbeat
    /// loops. Blocks through the RSA/AES handshake plus the `"OK"`
    /// acknowledgement; on any failure the link ends up closed.
    pub async fn connect(&self) -> BotResult<()> {
        *self.state.lock().unwrap() = LinkState::Connecting;

        let result = self.connect_inner().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn connect_inner(&self) -> BotResult<()> {
        let stream = TcpStream::connect(&self.address).await?;
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        // The first post-handshake record must be the server's "OK". The
        // waiter is installed on the live topic before the key exchange so
        // the acknowledgement cannot slip past it.
        let (ack_tx, mut ack_rx) = mpsc::channel::<BotResult<String>>(4);
        let tx = ack_tx.clone();
        let msg_token = self.bus.on(topic::MESSAGE, move |message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Ok(message)).await;
            }
        });
        let tx = ack_tx.clone();
        let timeout_token = self.bus.on(topic::TIMEOUT, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx
                    .send(Err(BotError::HandshakeFailed("connection timed out".into())))
                    .await;
            }
        });
        let tx = ack_tx;
        let disconnect_token = self.bus.on(topic::DISCONNECTED, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx
                    .send(Err(BotError::HandshakeFailed("link closed".into())))
                    .await;
            }
        });

        let handshake = async {
            if self.encryption {
                self.exchange_keys(&mut reader).await?;
            }
            self.spawn_receive(reader);
            match ack_rx.recv().await {
                Some(ack) => ack,
                None => Err(BotError::HandshakeFailed("event channel closed".into())),
            }
        }
        .await;

        self.bus.off(topic::MESSAGE, msg_token);
        self.bus.off(topic::TIMEOUT, timeout_token);
        self.bus.off(topic::DISCONNECTED, disconnect_token);

        let acknowledgement = handshake?;
        if acknowledgement != "OK" {
            return Err(BotError::HandshakeFailed(format!(
                "unexpected acknowledgement: {acknowledgement:?}"
            )));
        }

        // Authentication is implicit: a wrong token never gets a reply, the
        // server just drops the connection, which surfaces as a timeout.
        let secret = self.secret_token.clone();
        self.send(&secret).await?;

        self.bus.merge(topic::MESSAGE_PENDING, topic::MESSAGE);
        *self.state.lock().unwrap() = LinkState::Connected;
        self.bus.emit(topic::CONNECTED, "connected");
        self.spawn_heartbeat();
        Ok(())
    }

    /// Key exchange: read the server's PEM public key, answer with the
    /// sealed session material.
    async fn exchange_keys(&self, reader: &mut OwnedReadHalf) -> BotResult<()> {
        let mut buf = vec![0u8; self.read_buffer_size];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(BotError::HandshakeFailed(
                "connection closed before key exchange".into(),
            ));
        }
        let pem = std::str::from_utf8(&buf[..n])
            .map_err(|_| BotError::HandshakeFailed("server public key is not valid UTF-8".into()))?;

        let session = CryptoSession::generate();
        let sealed = session.seal(pem)?;

        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(BotError::LinkClosed)?;
        w.write_all(&sealed).await?;
        drop(writer);

        *self.session.write().unwrap() = Some(session);
        Ok(())
    }

    fn spawn_receive(&self, mut reader: OwnedReadHalf) {
        let Some(link) = self.weak_self.upgrade() else { return };
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; link.read_buffer_size];
            loop {
                let n = tokio::select! {
                    _ = stop.changed() => break,
                    result = reader.read(&mut buf) => match result {
                        Ok(n) if n > 0 => n,
                        _ => {
                            // EOF or error; a deliberate close is not a timeout.
                            if !*stop.borrow() {
                                link.bus.emit(topic::TIMEOUT, "connection timed out");
                                link.close().await;
                            }
                            break;
                        }
                    },
                };

                let record = match (link.encryption, link.session()) {
                    (true, Some(session)) => session.decrypt(&buf[..n]),
                    _ => buf[..n].to_vec(),
                };

                if &record[..] == b"PONG" {
                    link.bus.emit(topic::PING, "PONG");
                    continue;
                }

                let text = String::from_utf8_lossy(&record);
                link.bus.emit(topic::MESSAGE, &text);
            }
            tracing::debug!("control receive loop stopped");
        });
    }

    fn spawn_heartbeat(&self) {
        let Some(link) = self.weak_self.upgrade() else { return };
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(link.heartbeat_interval) => {}
                }
                if let Err(e) = link.send("PING").await {
                    // Ends only the heartbeat task; the receive loop notices
                    // a dead socket on its own.
                    tracing::warn!("Heartbeat send failed: {e}");
                    break;
                }
            }
        });
    }

    /// Encrypt (when enabled) and write one record.
    pub async fn send(&self, message: &str) -> BotResult<()> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(BotError::LinkClosed)?;

        let record = if self.encryption {
            let session = self
                .session()
                .ok_or_else(|| BotError::HandshakeFailed("no session key".into()))?;
            session.encrypt(message.as_bytes())
        } else {
            message.as_bytes().to_vec()
        };

        w.write_all(&record).await?;
        Ok(())
    }

    /// Idempotent teardown: stops the loops, drops the socket and emits
    /// `disconnected`.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, LinkState::Disconnected | LinkState::Disconnecting) {
                return;
            }
            *state = LinkState::Disconnecting;
        }
        let _ = self.stop.send(true);
        self.writer.lock().await.take();
        self.bus.emit(topic::DISCONNECTED, "disconnected from the server");
        *self.state.lock().unwrap() = LinkState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{collect_topic, FakeServerOptions, FakeTranscriptionServer};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plaintext_connect_and_message_dispatch() {
        let server = FakeTranscriptionServer::start(FakeServerOptions {
            encryption: false,
            ..Default::default()
        })
        .await;

        let link = ControlLink::new(server.address(), false, "secret");
        let messages = collect_topic(link.bus(), topic::MESSAGE);

        link.connect().await.unwrap();
        assert!(link.is_connected());
        assert_eq!(server.received_token().await, "secret");

        server.push_record("hello there").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(messages.lock().unwrap().iter().any(|m| m == "hello there"));

        link.close().await;
    }

    #[tokio::test]
    async fn test_encrypted_connect_sends_encrypted_token() {
        let server = FakeTranscriptionServer::start(FakeServerOptions::default()).await;

        let link = ControlLink::new(server.address(), true, "token-123");
        link.connect().await.unwrap();

        // The fake decrypts with the negotiated session; a matching token
        // proves the record was AES-CFB under the handshake key.
        assert_eq!(server.received_token().await, "token-123");
        link.close().await;
    }

    #[tokio::test]
    async fn test_handshake_rejection_fails_connect() {
        let server = FakeTranscriptionServer::start(FakeServerOptions {
            acknowledgement: "NO",
            ..Default::default()
        })
        .await;

        let link = ControlLink::new(server.address(), true, "secret");
        match link.connect().await {
            Err(BotError::HandshakeFailed(reason)) => {
                assert!(reason.contains("NO"), "unexpected reason: {reason}")
            }
            other => panic!("expected handshake failure, got {other:?}"),
        }
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_ping_records_emit_ping_event() {
        let server = FakeTranscriptionServer::start(FakeServerOptions::default()).await;
        let link = ControlLink::new(server.address(), true, "secret");
        let pings = collect_topic(link.bus(), topic::PING);

        link.connect().await.unwrap();
        server.push_record("PONG").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pings.lock().unwrap().len(), 1);
        link.close().await;
    }

    #[tokio::test]
    async fn test_server_drop_emits_timeout_and_closes() {
        let server = FakeTranscriptionServer::start(FakeServerOptions::default()).await;
        let link = ControlLink::new(server.address(), true, "secret");
        let timeouts = collect_topic(link.bus(), topic::TIMEOUT);
        let disconnects = collect_topic(link.bus(), topic::DISCONNECTED);

        link.connect().await.unwrap();
        server.drop_connection().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(timeouts.lock().unwrap().len(), 1);
        assert_eq!(disconnects.lock().unwrap().len(), 1);
        assert!(!link.is_connected());
        assert!(matches!(link.send("PING").await, Err(BotError::LinkClosed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = FakeTranscriptionServer::start(FakeServerOptions::default()).await;
        let link = ControlLink::new(server.address(), true, "secret");
        let disconnects = collect_topic(link.bus(), topic::DISCONNECTED);

        link.connect().await.unwrap();
        link.close().await;
        link.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(disconnects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_handlers_merge_on_connect() {
        let server = FakeTranscriptionServer::start(FakeServerOptions {
            send_init_udpaddr: false,
            ..Default::default()
        })
        .await;
        let link = ControlLink::new(server.address(), true, "secret");

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        // Installed before connect: must not observe handshake records.
        link.on_message(move |m| {
            let sink = sink.clone();
            async move { sink.lock().unwrap().push(m) }
        });

        link.connect().await.unwrap();
        server.push_record("fragment").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["fragment"]);
        link.close().await;
    }

    #[tokio::test]
    async fn test_full_buffer_record_is_one_record() {
        // A record of exactly read_buffer_size bytes must come through as a
        // single message.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"OK").await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await; // token
            let record = vec![b'x'; DEFAULT_READ_BUFFER_SIZE];
            socket.write_all(&record).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let link = ControlLink::new(addr.to_string(), false, "secret");
        let messages = collect_topic(link.bus(), topic::MESSAGE);
        link.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let messages = messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len(), DEFAULT_READ_BUFFER_SIZE);
        link.close().await;
    }
}
