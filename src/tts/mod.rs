//! Streaming text-to-speech over the `ElevenLabs` stream-input protocol
//!
//! Text arrives in small deltas and is batched before it goes over the socket:
//! a batch is sent once more than [`MAX_DELAY`] has passed since the previous
//! one or once [`MAX_BUFFER_SIZE`] characters are waiting. Anything still
//! buffered is sent by a deferred flush at the delay boundary. Text that cannot
//! be sent stays buffered until the next call. Audio chunks in the replies are
//! decoded and handed to the audio consumer in arrival order.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TtsConfig;
use crate::socket::{Connection, EventKind, Payload, ReadyState, ReconnectingSocket, SocketEvent};
use crate::voice::{AudioClip, PlaybackQueue};

/// Flush once this many characters are buffered
pub const MAX_BUFFER_SIZE: usize = 100;

/// Flush once this long has passed since the previous flush
pub const MAX_DELAY: Duration = Duration::from_millis(250);

type AudioConsumer = Arc<dyn Fn(AudioClip) + Send + Sync>;

/// Build the stream-input URL for a voice and model
#[must_use]
pub fn stream_url(config: &TtsConfig) -> String {
    format!(
        "{}/v1/text-to-speech/{}/stream-input?model_id={}",
        config.base_url.trim_end_matches('/'),
        config.voice_id,
        config.model_id
    )
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

/// First message on every connection
#[derive(Debug, Serialize)]
struct BeginMessage<'a> {
    text: &'a str,
    voice_settings: VoiceSettings,
    xi_api_key: &'a str,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    text: &'a str,
}

/// Inbound chunk
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    normalized_alignment: Option<serde_json::Value>,
}

/// Text waiting to be sent
#[derive(Debug)]
pub struct SendBuffer {
    text: String,
    last_flush: Instant,
}

impl SendBuffer {
    /// Empty buffer whose flush clock starts at `now`
    #[must_use]
    pub const fn new(now: Instant) -> Self {
        Self {
            text: String::new(),
            last_flush: now,
        }
    }

    /// Append a delta
    pub fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Whether the buffered text should go out at `now`
    #[must_use]
    pub fn should_flush(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_flush) > MAX_DELAY
            || self.text.chars().count() >= MAX_BUFFER_SIZE
    }

    /// Buffered text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// When the deferred flush should fire
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_flush + MAX_DELAY
    }

    /// Take the buffered text
    fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    /// Record a successful flush
    fn flushed(&mut self, now: Instant) {
        self.last_flush = now;
    }

    /// Put unsent text back in front of anything buffered since
    fn restore(&mut self, text: &str) {
        self.text.insert_str(0, text);
    }
}

struct Inner {
    socket: ReconnectingSocket,
    buffer: Mutex<SendBuffer>,
    send_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    state: watch::Receiver<ReadyState>,
}

impl Inner {
    fn buffer(&self) -> MutexGuard<'_, SendBuffer> {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Send whatever is buffered
    ///
    /// Returns `false` when the text could not go out; it stays buffered for
    /// the next caller and nothing retries on its own.
    async fn flush(&self) -> bool {
        let _send = self.send_lock.lock().await;
        if self.buffer().is_empty() {
            return true;
        }

        let conn = match self.socket.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "tts flush failed to connect");
                return false;
            }
        };

        let text = self.buffer().take();
        if text.is_empty() {
            return true;
        }
        match send_text(&conn, &text) {
            Ok(()) => {
                self.buffer().flushed(Instant::now());
                tracing::debug!(chars = text.chars().count(), "tts text sent");
                true
            }
            Err(e) => {
                self.buffer().restore(&text);
                tracing::error!(error = %e, "tts send failed");
                false
            }
        }
    }
}

fn send_text(conn: &Connection, text: &str) -> crate::Result<()> {
    conn.send_text(serde_json::to_string(&TextMessage { text })?)
}

/// Streaming TTS client
#[derive(Clone)]
pub struct SpeechStream {
    inner: Arc<Inner>,
}

impl SpeechStream {
    /// Client for the configured voice, feeding audio to `consumer`
    pub fn new(config: &TtsConfig, consumer: impl Fn(AudioClip) + Send + Sync + 'static) -> Self {
        Self::with_socket(ReconnectingSocket::new(stream_url(config)), config, consumer)
    }

    /// Client that plays audio through `queue`
    #[must_use]
    pub fn with_queue(config: &TtsConfig, queue: PlaybackQueue) -> Self {
        Self::new(config, move |clip| queue.push(clip))
    }

    /// Client over an existing socket
    pub fn with_socket(
        socket: ReconnectingSocket,
        config: &TtsConfig,
        consumer: impl Fn(AudioClip) + Send + Sync + 'static,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ReadyState::Closed);
        register_listeners(&socket, config, Arc::new(consumer), state_tx);

        Self {
            inner: Arc::new(Inner {
                socket,
                buffer: Mutex::new(SendBuffer::new(Instant::now())),
                send_lock: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
                state: state_rx,
            }),
        }
    }

    /// Append text; sends now or schedules a deferred flush
    pub async fn send_text(&self, delta: &str) {
        let flush_now = {
            let mut buffer = self.inner.buffer();
            buffer.push(delta);
            let flush_now = buffer.should_flush(Instant::now());
            if !flush_now {
                tracing::trace!(buffered = buffer.text().len(), "tts buffering");
            }
            flush_now
        };

        if flush_now && !self.inner.flush().await {
            return;
        }
        if !self.inner.buffer().is_empty() {
            self.schedule_flush();
        }
    }

    /// Flush remaining text and mark the end of the utterance
    pub async fn send_text_done(&self) {
        if let Some(timer) = self.inner.timer().take() {
            timer.abort();
        }

        let _send = self.inner.send_lock.lock().await;
        let conn = match self.inner.socket.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "tts done failed to connect");
                return;
            }
        };

        let text = self.inner.buffer().take();
        if !text.is_empty() {
            if let Err(e) = send_text(&conn, &text) {
                self.inner.buffer().restore(&text);
                tracing::error!(error = %e, "tts final flush failed");
                return;
            }
            self.inner.buffer().flushed(Instant::now());
        }

        match send_text(&conn, "") {
            Ok(()) => tracing::debug!("tts end of text sent"),
            Err(e) => tracing::error!(error = %e, "tts end of text failed"),
        }
    }

    /// Open the connection ahead of the first text
    pub fn online(&self) {
        self.inner.socket.warm_up();
    }

    /// Close the connection and drop all listeners
    ///
    /// The client is not usable for audio afterwards.
    pub async fn offline(&self) {
        if let Some(timer) = self.inner.timer().take() {
            timer.abort();
        }
        if let Err(e) = self.inner.socket.close().await {
            tracing::debug!(error = %e, "tts offline");
        }
        self.inner.socket.unsubscribe_all();
    }

    /// Connection state as last reported by the socket
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ReadyState> {
        self.inner.state.clone()
    }

    /// Text currently waiting to be sent
    #[must_use]
    pub fn buffered(&self) -> String {
        self.inner.buffer().text().to_string()
    }

    fn schedule_flush(&self) {
        let mut timer = self.inner.timer();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let deadline = self.inner.buffer().deadline();
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracing::trace!("tts deferred flush");
            inner.flush().await;
        }));
    }
}

impl std::fmt::Debug for SpeechStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechStream")
            .field("socket", &self.inner.socket)
            .field("state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

fn register_listeners(
    socket: &ReconnectingSocket,
    config: &TtsConfig,
    consumer: AudioConsumer,
    state: watch::Sender<ReadyState>,
) {
    let begin = BeginMessage {
        text: " ",
        voice_settings: VoiceSettings {
            stability: config.stability,
            similarity_boost: config.similarity_boost,
        },
        xi_api_key: config.api_key.as_deref().unwrap_or_default(),
    };
    let begin = serde_json::to_string(&begin).unwrap_or_default();

    socket.subscribe(EventKind::Open, move |event| {
        if let SocketEvent::Open(conn) = event {
            tracing::info!(id = conn.id(), "tts stream opened");
            if let Err(e) = conn.send_text(begin.clone()) {
                tracing::error!(error = %e, "tts handshake failed");
            }
        }
    });

    socket.subscribe(EventKind::Message, move |event| {
        if let SocketEvent::Message(_, Payload::Text(text)) = event {
            handle_chunk(text, consumer.as_ref());
        }
    });

    socket.subscribe(EventKind::Error, |event| {
        if let SocketEvent::Error(message) = event {
            tracing::error!(error = %message, "tts stream error");
        }
    });

    socket.subscribe(EventKind::Close, |event| {
        if let SocketEvent::Closed(info) = event {
            if info.was_clean {
                tracing::info!(code = info.code, reason = %info.reason, "tts stream closed cleanly");
            } else {
                tracing::warn!("tts stream died");
            }
        }
    });

    socket.subscribe(EventKind::ReadyStateChange, move |event| {
        if let SocketEvent::ReadyStateChange(s) = event {
            tracing::debug!(state = %s, "tts ready state");
            state.send_replace(*s);
        }
    });
}

fn handle_chunk(text: &str, consumer: &(dyn Fn(AudioClip) + Send + Sync)) {
    let chunk: StreamChunk = match serde_json::from_str(text) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!(error = %e, "malformed tts chunk");
            return;
        }
    };

    match chunk.audio.as_deref().filter(|a| !a.is_empty()) {
        Some(audio) => match BASE64.decode(audio) {
            Ok(bytes) => {
                tracing::debug!(bytes = bytes.len(), "tts audio chunk");
                consumer(AudioClip::from(bytes));
            }
            Err(e) => tracing::warn!(error = %e, "undecodable tts audio"),
        },
        None => tracing::debug!("tts chunk without audio"),
    }

    if chunk.is_final == Some(true) {
        tracing::debug!("tts generation complete");
    }
    if chunk.normalized_alignment.is_some() {
        tracing::trace!("tts alignment received");
    }
}
