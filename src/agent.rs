//! The agent: one meeting, one transcription stream, N caption languages.
//!
//! An agent owns a primary meeting session (English pad + audio
//! subscription) plus one secondary session per target language, a stream
//! client to the transcription service, and the audio pumps feeding it.
//! Handlers wired between these parts hold weak back-references so the
//! teardown path never races a reference cycle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::audio::AudioPump;
use crate::config::TranscriptionConfig;
use crate::error::{BotError, BotResult};
use crate::meeting::{
    AudioChannel, ConnectionStatus, MeetingClient, MeetingSession, TrackKind,
};
use crate::ogg::OggWriter;
use crate::router::TranslationRouter;
use crate::stream::{fragment_text, ServerMessage, StreamClient, StreamSink};
use crate::translate::Translator;

const OGG_SAMPLE_RATE: u32 = 48_000;
const OGG_CHANNEL_COUNT: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Transcribe,
    Translate,
}

impl Task {
    /// Control record announcing the task to the transcription service.
    fn control_record(self) -> String {
        match self {
            Task::Transcribe => serde_json::json!({"task": "transcribe"}).to_string(),
            Task::Translate => serde_json::json!({"task": "translate"}).to_string(),
        }
    }
}

/// Mutable agent state, all behind one lock. The lock is never held across
/// meeting-client or transport I/O.
struct AgentState {
    status: ConnectionStatus,
    task: Task,
    meeting_id: String,
    display_name: String,
    /// Ordered language set; `languages[0] == "en"` while connected.
    languages: Vec<String>,
    primary: Option<Arc<dyn MeetingSession>>,
    /// Secondary sessions by language; never contains `"en"`.
    subs: HashMap<String, Arc<dyn MeetingSession>>,
    stream: Option<Arc<StreamClient>>,
    audio: Option<Arc<dyn AudioChannel>>,
    writer: Option<Arc<std::sync::Mutex<OggWriter<StreamSink>>>>,
    pump_shutdown: Option<watch::Sender<bool>>,
}

pub struct Agent {
    id: Uuid,
    meetings: Arc<dyn MeetingClient>,
    router: TranslationRouter,
    transcription: TranscriptionConfig,
    state: Mutex<AgentState>,
    /// Handed to pad/stream handlers; resolved at dispatch time so callbacks
    /// never keep a torn-down agent alive.
    weak_self: std::sync::Weak<Self>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("id", &self.id).finish()
    }
}

impl Agent {
    pub fn new(
        meetings: Arc<dyn MeetingClient>,
        translator: Arc<dyn Translator>,
        transcription: TranscriptionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: Uuid::new_v4(),
            meetings,
            router: TranslationRouter::new(translator),
            transcription,
            weak_self: weak.clone(),
            state: Mutex::new(AgentState {
                status: ConnectionStatus::Disconnected,
                task: Task::Transcribe,
                meeting_id: String::new(),
                display_name: String::new(),
                languages: Vec::new(),
                primary: None,
                subs: HashMap::new(),
                stream: None,
                audio: None,
                writer: None,
                pump_shutdown: None,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn task(&self) -> Task {
        self.state.lock().await.task
    }

    /// Snapshot of the ordered language set.
    pub async fn languages(&self) -> Vec<String> {
        self.state.lock().await.languages.clone()
    }

    /// Join a meeting: primary session, English pad, transcription stream,
    /// audio pumps. A concurrent join is rejected; joining while connected
    /// disconnects first. On failure the agent rolls back to Disconnected.
    pub async fn join(&self, meeting_id: &str, display_name: &str) -> BotResult<()> {
        loop {
            let mut state = self.state.lock().await;
            match state.status {
                ConnectionStatus::Connecting => return Err(BotError::AlreadyConnecting),
                ConnectionStatus::Connected => {
                    drop(state);
                    self.disconnect().await;
                }
                ConnectionStatus::Disconnected => {
                    state.status = ConnectionStatus::Connecting;
                    state.meeting_id = meeting_id.to_string();
                    state.display_name = display_name.to_string();
                    break;
                }
            }
        }

        match self.join_inner(meeting_id, display_name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn join_inner(&self, meeting_id: &str, display_name: &str) -> BotResult<()> {
        let primary = self.meetings.join(meeting_id, display_name, true).await?;
        self.state.lock().await.primary = Some(primary.clone());

        // Loss of the English pad is fatal for the whole agent.
        let pad = primary.create_pad("en").await?;
        let weak = self.weak_self.clone();
        pad.on_disconnected(Box::new(move || {
            if let Some(agent) = weak.upgrade() {
                tracing::warn!(agent = %agent.id, "Primary caption pad lost");
                tokio::spawn(async move { agent.disconnect().await });
            }
        }));

        let stream = StreamClient::new(
            &self.transcription.host,
            self.transcription.port,
            self.transcription.encryption,
            &self.transcription.secret,
        );
        self.state.lock().await.stream = Some(stream.clone());

        // Transport loss pulls the agent out of the meeting; leaving the
        // primary session drops its pad, which escalates to a full
        // disconnect through the handler above.
        let weak = self.weak_self.clone();
        stream.on_disconnected(move |_| {
            let weak = weak.clone();
            async move {
                if let Some(agent) = weak.upgrade() {
                    agent.leave_primary().await;
                }
            }
        });
        let weak = self.weak_self.clone();
        stream.on_timeout(move |_| {
            let weak = weak.clone();
            async move {
                if let Some(agent) = weak.upgrade() {
                    agent.leave_primary().await;
                }
            }
        });
        let weak = self.weak_self.clone();
        stream.on_message(move |raw| {
            let weak = weak.clone();
            async move {
                if let Some(agent) = weak.upgrade() {
                    agent.handle_record(raw).await;
                }
            }
        });

        stream.connect().await?;

        let audio = primary.open_audio().await?;
        audio.listen().await?;

        let writer = Arc::new(std::sync::Mutex::new(OggWriter::new(
            stream.sink(),
            OGG_SAMPLE_RATE,
            OGG_CHANNEL_COUNT,
        )?));
        let (pump_stop, pump_rx) = watch::channel(false);

        {
            let mut state = self.state.lock().await;
            state.audio = Some(audio.clone());
            state.writer = Some(writer.clone());
            state.pump_shutdown = Some(pump_stop);
        }

        let status = audio.status();
        let pump_stream = stream.clone();
        audio.on_track(Box::new(move |track| {
            if track.kind() != TrackKind::Audio {
                return;
            }
            AudioPump::spawn(
                track,
                status.clone(),
                writer.clone(),
                pump_stream.clone(),
                pump_rx.clone(),
            );
        }));

        {
            let mut state = self.state.lock().await;
            state.status = ConnectionStatus::Connected;
            state.languages = vec!["en".to_string()];
        }
        tracing::info!(agent = %self.id, meeting = meeting_id, "Agent joined meeting");
        Ok(())
    }

    /// Tear everything down. Idempotent, and safe to call from handlers
    /// fired by the very systems being torn down.
    pub async fn disconnect(&self) {
        let (primary, subs, stream, audio, writer, pump_shutdown) = {
            let mut state = self.state.lock().await;
            state.status = ConnectionStatus::Disconnected;
            state.languages.clear();
            (
                state.primary.take(),
                std::mem::take(&mut state.subs),
                state.stream.take(),
                state.audio.take(),
                state.writer.take(),
                state.pump_shutdown.take(),
            )
        };

        // Order matters: stop track reads, close the Ogg writer, then the
        // transport (bulk before control), then the meeting memberships.
        if let Some(stop) = pump_shutdown {
            let _ = stop.send(true);
        }
        if let Some(writer) = writer {
            if let Err(e) = writer.lock().unwrap().close() {
                tracing::debug!("Ogg writer close: {e}");
            }
        }
        if let Some(stream) = stream {
            stream.close().await;
        }
        if let Some(audio) = audio {
            audio.close().await;
        }
        for (_, sub) in subs {
            sub.leave().await;
        }
        if let Some(primary) = primary {
            primary.leave().await;
        }
        tracing::info!(agent = %self.id, "Agent disconnected");
    }

    /// Switch between transcribe and translate. Self-transitions are a
    /// no-op, as is calling this on a disconnected agent.
    ///
    /// Returns a boxed future (rather than using `async fn`) because this
    /// method, `translate`, and `stop_translate` call each other indirectly
    /// through the pad-disconnect handler spawned in `translate`; an opaque
    /// `impl Future` return type here makes that cycle unresolvable for the
    /// compiler's auto-trait (`Send`) inference. Boxing gives the future an
    /// explicit, non-opaque type and breaks the cycle without changing
    /// behavior.
    pub fn set_task(
        &self,
        task: Task,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let (current, stream, languages) = {
                let state = self.state.lock().await;
                if state.status != ConnectionStatus::Connected {
                    return;
                }
                (state.task, state.stream.clone(), state.languages.clone())
            };
            if current == task {
                return;
            }

            match task {
                Task::Transcribe => {
                    // Leave every sub-session but keep the language set, so a
                    // later switch back restores the same targets.
                    let subs = {
                        let mut state = self.state.lock().await;
                        state.task = Task::Transcribe;
                        std::mem::take(&mut state.subs)
                    };
                    for (_, sub) in subs {
                        sub.leave().await;
                    }
                    if let Some(stream) = &stream {
                        if let Err(e) = stream.send_tcp(&Task::Transcribe.control_record()).await {
                            tracing::warn!("Failed to announce transcribe task: {e}");
                        }
                    }
                }
                Task::Translate => {
                    self.state.lock().await.task = Task::Translate;
                    if let Some(stream) = &stream {
                        if let Err(e) = stream.send_tcp(&Task::Translate.control_record()).await {
                            tracing::warn!("Failed to announce translate task: {e}");
                        }
                    }
                    for language in languages.iter().filter(|l| l.as_str() != "en") {
                        if let Err(e) = self.translate(language).await {
                            tracing::warn!(
                                "Failed to restart translation for '{language}': {e}"
                            );
                        }
                    }
                }
            }
            tracing::info!(agent = %self.id, ?task, "Task switched");
        })
    }

    /// Spawn a secondary session plus caption pad for `language`.
    pub async fn translate(&self, language: &str) -> BotResult<()> {
        if language == "en" {
            // The English pad always lives on the primary session.
            return Err(BotError::AlreadyActive("en".to_string()));
        }

        let (meeting_id, display_name) = {
            let state = self.state.lock().await;
            if state.status != ConnectionStatus::Connected {
                return Err(BotError::NotConnected);
            }
            if state.task != Task::Translate {
                return Err(BotError::NotInTranslateMode);
            }
            if state.subs.contains_key(language) {
                return Err(BotError::AlreadyActive(language.to_string()));
            }
            (state.meeting_id.clone(), state.display_name.clone())
        };

        let session = self
            .meetings
            .join(&meeting_id, &format!("{display_name}-{language}"), true)
            .await?;
        let pad = match session.create_pad(language).await {
            Ok(pad) => pad,
            Err(e) => {
                session.leave().await;
                return Err(e.into());
            }
        };

        // A secondary pad loss heals just that language, never the agent.
        let weak = self.weak_self.clone();
        let pad_language = language.to_string();
        pad.on_disconnected(Box::new(move || {
            let Some(agent) = weak.upgrade() else { return };
            let language = pad_language.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.stop_translate(&language).await {
                    tracing::debug!("Stop-translate after pad loss: {e}");
                }
            });
        }));

        let replaced = {
            let mut state = self.state.lock().await;
            if state.status != ConnectionStatus::Connected {
                drop(state);
                session.leave().await;
                return Err(BotError::NotConnected);
            }
            let replaced = state.subs.insert(language.to_string(), session);
            if !state.languages.iter().any(|l| l == language) {
                state.languages.push(language.to_string());
            }
            replaced
        };
        // Two racing calls for the same language: the later one wins and
        // the earlier session is dropped.
        if let Some(old) = replaced {
            old.leave().await;
        }

        tracing::info!(agent = %self.id, language, "Translation target added");
        Ok(())
    }

    /// Stop translating into `language`. Stopping `"en"` flips the whole
    /// agent back to transcribe mode instead of touching the primary pad.
    pub async fn stop_translate(&self, language: &str) -> BotResult<()> {
        if language == "en" {
            self.set_task(Task::Transcribe).await;
            return Ok(());
        }

        let session = {
            let mut state = self.state.lock().await;
            match state.subs.remove(language) {
                Some(session) => {
                    state.languages.retain(|l| l != language);
                    session
                }
                None => return Err(BotError::NotFound(language.to_string())),
            }
        };
        session.leave().await;

        tracing::info!(agent = %self.id, language, "Translation target removed");
        Ok(())
    }

    /// Transport death pulls the agent out of the meeting; the primary
    /// pad's disconnect handler finishes the job.
    async fn leave_primary(&self) {
        let primary = self.state.lock().await.primary.clone();
        if let Some(primary) = primary {
            primary.leave().await;
        }
    }

    /// Dispatch one inbound control record to the caption pads.
    async fn handle_record(&self, raw: String) {
        let Some(message) = ServerMessage::parse(&raw) else {
            tracing::debug!("Ignoring unparseable control record");
            return;
        };
        // init_udpaddr is consumed by the stream client.
        let ServerMessage::Fragment { msg } = message else {
            return;
        };
        let text = strip_invalid_utf8(&fragment_text(&msg));

        let (task, pads) = {
            let state = self.state.lock().await;
            if state.status != ConnectionStatus::Connected {
                return;
            }
            let mut pads = state
                .primary
                .as_ref()
                .map(|p| p.pads())
                .unwrap_or_default();
            for sub in state.subs.values() {
                pads.extend(sub.pads());
            }
            (state.task, pads)
        };

        self.router.route(task, &text, &pads).await;
    }
}

/// Drop whatever survived the lossy decode as a replacement character, so
/// invalid input sequences end up removed rather than replaced.
fn strip_invalid_utf8(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect()
}
