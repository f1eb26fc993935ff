//! Sequential playback queue
//!
//! Clips pushed from any task play back-to-back in push order. One drain task
//! owns the sink while the queue is non-empty; a clip that fails to play is
//! logged and dropped so the rest of the queue keeps moving.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use super::playback::{AudioClip, AudioSink};

type Observer = Arc<dyn Fn() + Send + Sync>;

struct State {
    clips: VecDeque<AudioClip>,
    draining: bool,
}

struct Inner {
    state: Mutex<State>,
    // held across an edge transition and its observer call so observers see
    // start/empty strictly alternating; always taken before `state`
    edges: Mutex<()>,
    sink: Arc<dyn AudioSink>,
    on_start: Option<Observer>,
    on_empty: Option<Observer>,
    playing: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_edges(&self) -> MutexGuard<'_, ()> {
        self.edges
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// FIFO audio playback queue
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Inner>,
}

/// Builder for [`PlaybackQueue`] observers
pub struct PlaybackQueueBuilder {
    sink: Arc<dyn AudioSink>,
    on_start: Option<Observer>,
    on_empty: Option<Observer>,
}

impl PlaybackQueueBuilder {
    /// Called once each time the queue goes from empty to non-empty
    ///
    /// Observers must not push onto the same queue.
    #[must_use]
    pub fn on_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    /// Called once each time the queue drains to empty
    #[must_use]
    pub fn on_empty(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_empty = Some(Arc::new(f));
        self
    }

    /// Finish building
    #[must_use]
    pub fn build(self) -> PlaybackQueue {
        let (playing, _) = watch::channel(false);
        PlaybackQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    clips: VecDeque::new(),
                    draining: false,
                }),
                edges: Mutex::new(()),
                sink: self.sink,
                on_start: self.on_start,
                on_empty: self.on_empty,
                playing,
            }),
        }
    }
}

impl PlaybackQueue {
    /// Queue without observers
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self::builder(sink).build()
    }

    /// Start building a queue with observers
    #[must_use]
    pub fn builder(sink: Arc<dyn AudioSink>) -> PlaybackQueueBuilder {
        PlaybackQueueBuilder {
            sink,
            on_start: None,
            on_empty: None,
        }
    }

    /// Append a clip; starts draining if nothing is playing
    ///
    /// Does not wait for playback. Must be called inside a tokio runtime.
    pub fn push(&self, clip: AudioClip) {
        let edge = self.inner.lock_edges();
        let (was_empty, start_drain) = {
            let mut state = self.inner.lock();
            let was_empty = state.clips.is_empty();
            state.clips.push_back(clip);
            let start_drain = !state.draining;
            state.draining = true;
            if was_empty {
                self.inner.playing.send_replace(true);
            }
            (was_empty, start_drain)
        };

        tracing::debug!(was_empty, "clip queued");

        if was_empty {
            if let Some(f) = &self.inner.on_start {
                f();
            }
        }
        drop(edge);

        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
    }

    /// Whether any clip is queued or playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.inner.lock().clips.is_empty()
    }

    /// Number of clips waiting, including the one playing
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().clips.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().clips.is_empty()
    }

    /// Observe the playing flag
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.playing.subscribe()
    }

    /// Wait until the queue has drained
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.playing.subscribe();
        let _ = rx.wait_for(|playing| !*playing).await;
    }

    /// Wait up to `limit` for something to be queued; true if it was
    pub async fn wait_busy(&self, limit: Duration) -> bool {
        let mut rx = self.inner.playing.subscribe();
        matches!(
            tokio::time::timeout(limit, rx.wait_for(|playing| *playing)).await,
            Ok(Ok(_))
        )
    }
}

impl std::fmt::Debug for PlaybackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let head = inner.lock().clips.front().cloned();
        let Some(clip) = head else {
            break;
        };

        if let Err(e) = inner.sink.play(&clip).await {
            tracing::warn!(error = %e, bytes = clip.len(), "clip playback failed, skipping");
        }

        let now_empty = {
            let _edge = inner.lock_edges();
            let now_empty = {
                let mut state = inner.lock();
                state.clips.pop_front();
                if state.clips.is_empty() {
                    state.draining = false;
                    inner.playing.send_replace(false);
                    true
                } else {
                    false
                }
            };
            if now_empty {
                tracing::debug!("playback queue drained");
                if let Some(f) = &inner.on_empty {
                    f();
                }
            }
            now_empty
        };

        if now_empty {
            return;
        }
    }

    inner.lock().draining = false;
}
