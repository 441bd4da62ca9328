//! Shared test doubles: an in-process transcription server speaking the
//! real wire protocol (RSA/AES handshake, token auth, PING/PONG, typed
//! JSON records, UDP uplink), plus fake meeting-client and translator
//! implementations.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};

use crate::config::TranscriptionConfig;
use crate::crypto::CryptoSession;
use crate::event::EventBus;
use crate::meeting::{
    AudioChannel, AudioTrack, CaptionPad, ConnectionStatus, DisconnectHandler, MeetingClient,
    MeetingError, MeetingSession, StatusCell, TrackHandler, TrackKind,
};
use crate::translate::{TranslateError, Translator};

static TEST_RSA_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

/// One 2048-bit key shared by every test; generation is slow in debug.
fn test_rsa_key() -> RsaPrivateKey {
    TEST_RSA_KEY
        .get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
        .clone()
}

/// Record every payload emitted on `topic`.
pub fn collect_topic(bus: &EventBus, topic: &'static str) -> Arc<StdMutex<Vec<String>>> {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let sink = log.clone();
    bus.on(topic, move |payload| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(payload);
        }
    });
    log
}

pub struct FakeServerOptions {
    pub encryption: bool,
    /// First post-handshake record; anything but "OK" fails the client.
    pub acknowledgement: &'static str,
    pub send_init_udpaddr: bool,
    pub udp_encryption: bool,
    /// Give the client a beat to finish its connect bookkeeping before the
    /// endpoint advert, like a real network round-trip would.
    pub init_udpaddr_delay: Duration,
    /// Drop the TCP connection this long after the token exchange.
    pub drop_after: Option<Duration>,
}

impl Default for FakeServerOptions {
    fn default() -> Self {
        Self {
            encryption: true,
            acknowledgement: "OK",
            send_init_udpaddr: true,
            udp_encryption: true,
            init_udpaddr_delay: Duration::from_millis(100),
            drop_after: None,
        }
    }
}

/// Protocol-faithful fake of the transcription service, serving exactly one
/// client connection.
pub struct FakeTranscriptionServer {
    addr: SocketAddr,
    token_rx: Mutex<mpsc::Receiver<String>>,
    message_rx: Mutex<mpsc::Receiver<String>>,
    datagram_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: mpsc::Sender<String>,
    drop_tx: mpsc::Sender<()>,
}

async fn write_record(
    socket: &mut TcpStream,
    session: &Arc<StdMutex<Option<CryptoSession>>>,
    record: &str,
) {
    let payload = match *session.lock().unwrap() {
        Some(session) => session.encrypt(record.as_bytes()),
        None => record.as_bytes().to_vec(),
    };
    let _ = socket.write_all(&payload).await;
}

fn read_record(session: &Arc<StdMutex<Option<CryptoSession>>>, raw: &[u8]) -> Vec<u8> {
    match *session.lock().unwrap() {
        Some(session) => session.decrypt(raw),
        None => raw.to_vec(),
    }
}

impl FakeTranscriptionServer {
    pub async fn start(options: FakeServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = udp.local_addr().unwrap().port();

        let (token_tx, token_rx) = mpsc::channel(4);
        let (message_tx, message_rx) = mpsc::channel(64);
        let (datagram_tx, datagram_rx) = mpsc::channel(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let (drop_tx, mut drop_rx) = mpsc::channel::<()>(4);

        let session: Arc<StdMutex<Option<CryptoSession>>> = Arc::new(StdMutex::new(None));

        let udp_session = session.clone();
        let udp_decrypt = options.encryption && options.udp_encryption;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((n, _)) = udp.recv_from(&mut buf).await else {
                    break;
                };
                let data = match (udp_decrypt, *udp_session.lock().unwrap()) {
                    (true, Some(session)) => session.decrypt(&buf[..n]),
                    _ => buf[..n].to_vec(),
                };
                if datagram_tx.send(data).await.is_err() {
                    break;
                }
            }
        });

        let tcp_session = session.clone();
        tokio::spawn(async move {
            let session = tcp_session;
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };

            if options.encryption {
                let private_key = test_rsa_key();
                let pem = private_key
                    .to_public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .unwrap();
                if socket.write_all(pem.as_bytes()).await.is_err() {
                    return;
                }

                let mut buf = vec![0u8; 1024];
                let n = match socket.read(&mut buf).await {
                    Ok(n) if n > 0 => n,
                    _ => return,
                };
                let Ok(secret) = private_key.decrypt(Oaep::new::<Sha256>(), &buf[..n]) else {
                    return;
                };
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&secret[..16]);
                let mut key = [0u8; 32];
                key.copy_from_slice(&secret[16..48]);
                *session.lock().unwrap() = Some(CryptoSession::from_parts(key, iv));
            }

            write_record(&mut socket, &session, options.acknowledgement).await;

            let mut buf = vec![0u8; 1024];
            let n = match socket.read(&mut buf).await {
                Ok(n) if n > 0 => n,
                _ => return,
            };
            let token = read_record(&session, &buf[..n]);
            let _ = token_tx
                .send(String::from_utf8_lossy(&token).to_string())
                .await;

            if options.send_init_udpaddr {
                tokio::time::sleep(options.init_udpaddr_delay).await;
                let advert = serde_json::json!({
                    "type": "init_udpaddr",
                    "msg": {
                        "udp": {
                            "host": "127.0.0.1",
                            "port": udp_port,
                            "encryption": options.udp_encryption,
                        }
                    }
                })
                .to_string();
                write_record(&mut socket, &session, &advert).await;
            }

            let drop_timer =
                tokio::time::sleep(options.drop_after.unwrap_or(Duration::from_secs(3600)));
            tokio::pin!(drop_timer);
            loop {
                tokio::select! {
                    _ = &mut drop_timer => return,
                    _ = drop_rx.recv() => return,
                    outbound = outbound_rx.recv() => {
                        let Some(record) = outbound else { return };
                        write_record(&mut socket, &session, &record).await;
                    }
                    result = socket.read(&mut buf) => {
                        let n = match result {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let record = read_record(&session, &buf[..n]);
                        if &record[..] == b"PING" {
                            write_record(&mut socket, &session, "PONG").await;
                        } else {
                            let _ = message_tx
                                .send(String::from_utf8_lossy(&record).to_string())
                                .await;
                        }
                    }
                }
            }
        });

        Self {
            addr,
            token_rx: Mutex::new(token_rx),
            message_rx: Mutex::new(message_rx),
            datagram_rx: Mutex::new(datagram_rx),
            outbound_tx,
            drop_tx,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The token record the client sent (decrypted).
    pub async fn received_token(&self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.token_rx.lock().await.recv())
            .await
            .expect("timed out waiting for the client token")
            .expect("server connection ended before the token arrived")
    }

    /// Next non-heartbeat record from the client (decrypted).
    pub async fn next_message(&self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.message_rx.lock().await.recv())
            .await
            .expect("timed out waiting for a client record")
            .expect("server connection ended")
    }

    /// Next UDP datagram (decrypted when the advert enabled encryption).
    pub async fn next_datagram(&self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), self.datagram_rx.lock().await.recv())
            .await
            .expect("timed out waiting for a datagram")
            .expect("udp receiver ended")
    }

    pub async fn try_next_datagram(&self, wait: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(wait, self.datagram_rx.lock().await.recv())
            .await
            .ok()
            .flatten()
    }

    /// Push one record to the client (encrypted when the session exists).
    pub async fn push_record(&self, record: &str) {
        self.outbound_tx
            .send(record.to_string())
            .await
            .expect("server connection ended");
    }

    /// Hard-drop the TCP connection, as a dead or rejecting server would.
    pub async fn drop_connection(&self) {
        let _ = self.drop_tx.send(()).await;
    }
}

pub fn transcription_config(server: &FakeTranscriptionServer) -> TranscriptionConfig {
    TranscriptionConfig {
        host: server.host(),
        port: server.port(),
        secret: "secret".to_string(),
        encryption: true,
        health_port: 0,
    }
}

/// Build a raw RTP packet (12-byte header + payload).
pub fn rtp_frame(sequence: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.push(0x80); // version 2
    frame.push(111); // opus payload type
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes()); // ssrc
    frame.extend_from_slice(payload);
    frame
}

// ─── Fake meeting client ───────────────────────────────────────────────────

pub struct FakeMeetingClient {
    sessions: StdMutex<Vec<Arc<FakeMeetingSession>>>,
}

impl FakeMeetingClient {
    pub fn new() -> Self {
        Self {
            sessions: StdMutex::new(Vec::new()),
        }
    }

    /// Sessions in join order: the primary first, then one per `translate`.
    pub fn session(&self, index: usize) -> Arc<FakeMeetingSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl MeetingClient for FakeMeetingClient {
    async fn join(
        &self,
        meeting_id: &str,
        display_name: &str,
        moderator: bool,
    ) -> Result<Arc<dyn MeetingSession>, MeetingError> {
        let session = Arc::new(FakeMeetingSession {
            meeting_id: meeting_id.to_string(),
            display_name: display_name.to_string(),
            moderator,
            pads: StdMutex::new(Vec::new()),
            audio: StdMutex::new(None),
            left: AtomicBool::new(false),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct FakeMeetingSession {
    meeting_id: String,
    display_name: String,
    moderator: bool,
    pads: StdMutex<Vec<Arc<FakePad>>>,
    audio: StdMutex<Option<Arc<FakeAudioChannel>>>,
    left: AtomicBool,
}

impl FakeMeetingSession {
    pub fn meeting_id(&self) -> String {
        self.meeting_id.clone()
    }

    pub fn display_name(&self) -> String {
        self.display_name.clone()
    }

    pub fn joined_as_moderator(&self) -> bool {
        self.moderator
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    pub fn pads_concrete(&self) -> Vec<Arc<FakePad>> {
        self.pads.lock().unwrap().clone()
    }

    pub fn audio(&self) -> Option<Arc<FakeAudioChannel>> {
        self.audio.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeetingSession for FakeMeetingSession {
    async fn create_pad(&self, language: &str) -> Result<Arc<dyn CaptionPad>, MeetingError> {
        let pad = Arc::new(FakePad::new(language));
        self.pads.lock().unwrap().push(pad.clone());
        Ok(pad)
    }

    fn pads(&self) -> Vec<Arc<dyn CaptionPad>> {
        self.pads
            .lock()
            .unwrap()
            .iter()
            .map(|pad| pad.clone() as Arc<dyn CaptionPad>)
            .collect()
    }

    async fn open_audio(&self) -> Result<Arc<dyn AudioChannel>, MeetingError> {
        let channel = Arc::new(FakeAudioChannel::new());
        *self.audio.lock().unwrap() = Some(channel.clone());
        Ok(channel)
    }

    async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        // Leaving kills the session's pad connections and audio, which is
        // exactly the cascade the agent relies on.
        if let Some(audio) = self.audio.lock().unwrap().clone() {
            audio.status().set(ConnectionStatus::Disconnected);
        }
        let pads = self.pads.lock().unwrap().clone();
        for pad in pads {
            pad.fire_disconnect();
        }
    }
}

pub struct FakePad {
    language: String,
    texts: StdMutex<Vec<String>>,
    handlers: StdMutex<Vec<DisconnectHandler>>,
    fail_writes: AtomicBool,
}

impl FakePad {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_string(),
            texts: StdMutex::new(Vec::new()),
            handlers: StdMutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn last_text(&self) -> Option<String> {
        self.texts.lock().unwrap().last().cloned()
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fire_disconnect(&self) {
        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter() {
            handler();
        }
    }
}

#[async_trait]
impl CaptionPad for FakePad {
    fn language(&self) -> String {
        self.language.clone()
    }

    async fn set_text(&self, text: &str) -> Result<(), MeetingError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeetingError::Pad("scripted pad failure".into()));
        }
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn on_disconnected(&self, handler: DisconnectHandler) {
        self.handlers.lock().unwrap().push(handler);
    }
}

pub struct FakeAudioChannel {
    status: Arc<StatusCell>,
    handlers: StdMutex<Vec<TrackHandler>>,
    listening: AtomicBool,
    closed: AtomicBool,
}

impl FakeAudioChannel {
    fn new() -> Self {
        Self {
            status: Arc::new(StatusCell::new(ConnectionStatus::Connected)),
            handlers: StdMutex::new(Vec::new()),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Announce a new remote track to every registered handler.
    pub fn add_track(&self, track: Arc<dyn AudioTrack>) {
        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter() {
            handler(track.clone());
        }
    }
}

#[async_trait]
impl AudioChannel for FakeAudioChannel {
    async fn listen(&self) -> Result<(), MeetingError> {
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn status(&self) -> Arc<StatusCell> {
        self.status.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Track that plays back a fixed script of reads, then blocks.
pub struct ScriptedTrack {
    kind: TrackKind,
    frames: StdMutex<VecDeque<Result<Vec<u8>, MeetingError>>>,
}

impl ScriptedTrack {
    pub fn new(kind: TrackKind, frames: Vec<Result<Vec<u8>, MeetingError>>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            frames: StdMutex::new(frames.into()),
        })
    }
}

#[async_trait]
impl AudioTrack for ScriptedTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, MeetingError> {
        let next = self.frames.lock().unwrap().pop_front();
        match next {
            Some(Ok(frame)) => {
                if frame.len() > buf.len() {
                    return Err(MeetingError::OversizedFrame);
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            Some(Err(e)) => Err(e),
            None => {
                // Script exhausted: behave like a silent track.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Translator with canned per-target responses.
pub struct ScriptedTranslator {
    responses: StdMutex<HashMap<String, Result<String, ()>>>,
    calls: StdMutex<Vec<(String, String, String)>>,
}

impl ScriptedTranslator {
    pub fn new() -> Self {
        Self {
            responses: StdMutex::new(HashMap::new()),
            calls: StdMutex::new(Vec::new()),
        }
    }

    pub fn with(self, target: &str, translated: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(target.to_string(), Ok(translated.to_string()));
        self
    }

    pub fn with_failure(self, target: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(target.to_string(), Err(()));
        self
    }

    /// Every (text, source, target) triple seen so far.
    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslateError> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), source.to_string(), target.to_string()));
        match self.responses.lock().unwrap().get(target) {
            Some(Ok(translated)) => Ok(translated.clone()),
            Some(Err(())) => Err(TranslateError::Status(500)),
            None => Err(TranslateError::UnsupportedLanguage(target.to_string())),
        }
    }
}
