//! Shared test utilities
//!
//! Fakes for the audio, camera and recognition seams plus a loopback
//! WebSocket server, so the integration tests run without hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use seer_voice::Settings;
use seer_voice::vision::{Camera, Hand, RecognitionBackend, SpotResult, Stage, StageReport};
use seer_voice::voice::{AudioClip, AudioInput, AudioSink, InputStream};
use seer_voice::{Error, Result};

/// Samples per fake microphone chunk (20 ms at 16 kHz)
pub const CHUNK: usize = 320;

/// Settings with the recognition intervals used throughout the tests
pub fn test_settings() -> Settings {
    Settings {
        image_send_interval: 2.0,
        verify_image_send_interval: 1.0,
        reading_status_check_interval: 1.0,
        error_interval: 5.0,
        ..Settings::default()
    }
}

/// Poll `check` until it holds, failing after `limit`
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !check() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// -- audio output --

/// Sink that records what it was asked to play
#[derive(Clone, Default)]
pub struct RecordingSink {
    played: Arc<Mutex<Vec<Vec<u8>>>>,
    failing: Arc<Mutex<Vec<Vec<u8>>>>,
    delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl RecordingSink {
    /// Each clip takes `delay` to play
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail playback of clips with these bytes
    pub fn failing_on(self, bytes: &[u8]) -> Self {
        self.failing.lock().unwrap().push(bytes.to_vec());
        self
    }

    /// Clips in the order playback was attempted
    pub fn played(&self) -> Vec<Vec<u8>> {
        self.played.lock().unwrap().clone()
    }

    /// Highest number of clips ever playing at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, clip: &AudioClip) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.played.lock().unwrap().push(clip.bytes().to_vec());
        if self.failing.lock().unwrap().iter().any(|b| b == clip.bytes()) {
            return Err(Error::Decode("scripted playback failure".to_string()));
        }
        Ok(())
    }
}

// -- audio input --

/// Microphone that plays back a script of noise amplitudes, then silence
#[derive(Clone, Default)]
pub struct ScriptedInput {
    script: Vec<(f32, Duration)>,
    unavailable: bool,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl ScriptedInput {
    /// Noise at each amplitude for its duration, silence afterwards
    pub fn new(script: Vec<(f32, Duration)>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Input whose device can never be acquired
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct ReleaseGuard {
    released: Arc<AtomicUsize>,
    feeder: JoinHandle<()>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.feeder.abort();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl AudioInput for ScriptedInput {
    fn open(&self) -> Result<InputStream> {
        if self.unavailable {
            return Err(Error::DeviceUnavailable("no microphone".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let script = self.script.clone();
        let feeder = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(7);
            let period = Duration::from_millis(20);
            for (amplitude, duration) in script {
                let chunks = duration.as_millis() / period.as_millis();
                for _ in 0..chunks {
                    if tx.send(noise(&mut rng, amplitude, CHUNK)).is_err() {
                        return;
                    }
                    tokio::time::sleep(period).await;
                }
            }
            while tx.send(vec![0.0; CHUNK]).is_ok() {
                tokio::time::sleep(period).await;
            }
        });

        Ok(InputStream::new(
            16000,
            rx,
            ReleaseGuard {
                released: Arc::clone(&self.released),
                feeder,
            },
        ))
    }
}

/// Seeded uniform noise
pub fn noise(rng: &mut StdRng, amplitude: f32, len: usize) -> Vec<f32> {
    if amplitude <= 0.0 {
        return vec![0.0; len];
    }
    (0..len).map(|_| rng.gen_range(-amplitude..amplitude)).collect()
}

// -- camera and recognition --

/// Camera returning a fixed still
#[derive(Clone, Default)]
pub struct FakeCamera {
    captures: Arc<AtomicUsize>,
}

impl FakeCamera {
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Camera for FakeCamera {
    async fn capture_still(&self, _camera_id: Option<&str>) -> Result<Vec<u8>> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(b"jpeg".to_vec())
    }
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Upload { task_id: Option<String> },
    Status { task_id: String },
    Spot,
}

type Scripted<T> = Mutex<VecDeque<std::result::Result<T, String>>>;

/// Backend replaying scripted replies; `no_cards` once a script runs out
#[derive(Default)]
pub struct ScriptedBackend {
    uploads: Scripted<StageReport>,
    statuses: Scripted<StageReport>,
    spots: Scripted<SpotResult>,
    calls: Mutex<Vec<(Instant, Call)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_reply(self, reply: std::result::Result<StageReport, &str>) -> Self {
        self.uploads
            .lock()
            .unwrap()
            .push_back(reply.map_err(ToString::to_string));
        self
    }

    pub fn status_reply(self, reply: std::result::Result<StageReport, &str>) -> Self {
        self.statuses
            .lock()
            .unwrap()
            .push_back(reply.map_err(ToString::to_string));
        self
    }

    pub fn spot_reply(self, reply: SpotResult) -> Self {
        self.spots.lock().unwrap().push_back(Ok(reply));
        self
    }

    /// Calls with the time they were made
    pub fn calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }
}

fn next<T: Default>(script: &Scripted<T>) -> Result<T> {
    match script.lock().unwrap().pop_front() {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(message)) => Err(Error::Network(message)),
        None => Ok(T::default()),
    }
}

#[async_trait]
impl RecognitionBackend for ScriptedBackend {
    async fn upload_image(&self, _image: Vec<u8>, task_id: Option<&str>) -> Result<StageReport> {
        self.record(Call::Upload {
            task_id: task_id.map(ToString::to_string),
        });
        next(&self.uploads)
    }

    async fn task_status(&self, task_id: &str) -> Result<StageReport> {
        self.record(Call::Status {
            task_id: task_id.to_string(),
        });
        next(&self.statuses)
    }

    async fn spot_cards(&self, _image: Vec<u8>) -> Result<SpotResult> {
        self.record(Call::Spot);
        next(&self.spots)
    }
}

/// Report for a stage with optional task and audio
pub fn report(stage: Stage, task_id: Option<&str>, audio: Option<&str>) -> StageReport {
    StageReport {
        stage,
        task_id: task_id.map(ToString::to_string),
        audio: audio.map(ToString::to_string),
    }
}

/// Spot result with `cards` named cards
pub fn spotted(cards: &[&str], verified: bool) -> SpotResult {
    SpotResult {
        hand: Some(Hand {
            cards: cards.iter().map(|c| serde_json::json!({ "name": c })).collect(),
        }),
        hand_verified: verified,
    }
}

// -- websocket --

type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Loopback WebSocket server recording inbound text frames
pub struct WsServer {
    pub url: String,
    frames: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    refuse: Arc<AtomicUsize>,
    kick: Arc<Notify>,
}

impl WsServer {
    /// Server that never replies
    pub async fn start() -> Self {
        Self::with_replies(|_| Vec::new()).await
    }

    /// Server answering every text frame with the frames `respond` returns
    pub async fn with_replies(respond: impl Fn(&str) -> Vec<String> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let refuse = Arc::new(AtomicUsize::new(0));
        let kick = Arc::new(Notify::new());
        let respond: Responder = Arc::new(respond);

        {
            let frames = Arc::clone(&frames);
            let connections = Arc::clone(&connections);
            let attempts = Arc::clone(&attempts);
            let refuse = Arc::clone(&refuse);
            let kick = Arc::clone(&kick);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let refused = refuse
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    if refused {
                        // hang up before the websocket handshake
                        drop(stream);
                        continue;
                    }
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        ws,
                        Arc::clone(&frames),
                        Arc::clone(&kick),
                        Arc::clone(&respond),
                    ));
                }
            });
        }

        Self {
            url: format!("ws://{addr}"),
            frames,
            connections,
            attempts,
            refuse,
            kick,
        }
    }

    /// Hang up on the next `n` connection attempts
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// TCP connections seen so far, refused ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Text frames received so far, across all connections
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Close every open connection from the server side
    pub fn close_all(&self) {
        self.kick.notify_waiters();
    }
}

async fn serve(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    frames: Arc<Mutex<Vec<String>>>,
    kick: Arc<Notify>,
    respond: Responder,
) {
    loop {
        tokio::select! {
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    frames.lock().unwrap().push(text.clone());
                    for reply in respond(&text) {
                        if ws.send(Message::Text(reply)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            () = kick.notified() => {
                let _ = ws.close(None).await;
                // drain until the client acknowledges
                while let Some(Ok(_)) = ws.next().await {}
                return;
            }
        }
    }
}

/// An address nothing listens on
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}
