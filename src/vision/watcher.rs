//! Single-flight watch-mode loop

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::Error;

/// Outcome of one poll iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep polling while watch mode is on
    Continue,
    /// Finished; watch mode is switched off
    Done,
}

/// One polling state machine driven by a [`Watcher`]
#[async_trait]
pub trait Poller: Send + 'static {
    /// Snapshot published after every iteration
    type Status: Clone + Send + Sync + 'static;

    /// Run one iteration, including its own wait
    async fn step(&mut self) -> crate::Result<Step>;

    /// Current snapshot
    fn status(&self) -> Self::Status;

    /// Called when a loop instance starts
    fn on_start(&mut self) {}

    /// Called when an iteration fails, before the back-off
    fn on_error(&mut self, _error: &Error) {}

    /// Back-off after a failed iteration
    fn error_backoff(&self) -> Duration;

    /// Called once the back-off has elapsed
    fn recover(&mut self) {}
}

struct Shared<P: Poller> {
    poller: Mutex<P>,
    watch_mode: AtomicBool,
    running: watch::Sender<bool>,
    watching: watch::Sender<bool>,
    status: watch::Sender<P::Status>,
}

impl<P: Poller> Shared<P> {
    /// Mark a loop instance as running; false if one already is
    fn claim(&self) -> bool {
        self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        })
    }
}

/// Drives a [`Poller`] while watch mode is on
///
/// Turning watch mode on starts the loop unless one is already running; turning
/// it off lets the current iteration finish and then ends the loop.
pub struct Watcher<P: Poller> {
    shared: Arc<Shared<P>>,
}

impl<P: Poller> Clone for Watcher<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Poller> Watcher<P> {
    /// Wrap a poller; watch mode starts off
    pub fn new(poller: P) -> Self {
        let (status, _) = watch::channel(poller.status());
        let (watching, _) = watch::channel(false);
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                poller: Mutex::new(poller),
                watch_mode: AtomicBool::new(false),
                running,
                watching,
                status,
            }),
        }
    }

    /// Switch watch mode; setting the current value again does nothing
    pub fn set_watch_mode(&self, on: bool) {
        let previous = self.shared.watch_mode.swap(on, Ordering::SeqCst);
        if previous == on {
            return;
        }
        self.shared.watching.send_replace(on);
        tracing::info!(watch_mode = on, "watch mode changed");

        if on && self.shared.claim() {
            tokio::spawn(run(Arc::clone(&self.shared)));
        }
    }

    /// Whether watch mode is on
    #[must_use]
    pub fn is_watch_mode(&self) -> bool {
        self.shared.watch_mode.load(Ordering::SeqCst)
    }

    /// Whether a loop instance is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    /// Observe watch mode
    #[must_use]
    pub fn subscribe_watch_mode(&self) -> watch::Receiver<bool> {
        self.shared.watching.subscribe()
    }

    /// Observe the poller's status
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<P::Status> {
        self.shared.status.subscribe()
    }

    /// Latest published status
    #[must_use]
    pub fn status(&self) -> P::Status {
        self.shared.status.borrow().clone()
    }

    /// Wait until watch mode is off and the loop has exited
    pub async fn wait_stopped(&self) {
        let mut rx = self.shared.watching.subscribe();
        let _ = rx.wait_for(|on| !*on).await;
        let mut running = self.shared.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }
}

async fn run<P: Poller>(shared: Arc<Shared<P>>) {
    loop {
        shared.poller.lock().await.on_start();
        tracing::debug!("watch loop started");

        while shared.watch_mode.load(Ordering::SeqCst) {
            let mut poller = shared.poller.lock().await;
            match poller.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => {
                    shared.watch_mode.store(false, Ordering::SeqCst);
                    shared.watching.send_replace(false);
                    shared.status.send_replace(poller.status());
                    tracing::info!("watch loop finished");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "watch iteration failed");
                    poller.on_error(&e);
                    shared.status.send_replace(poller.status());
                    tokio::time::sleep(poller.error_backoff()).await;
                    poller.recover();
                }
            }
            shared.status.send_replace(poller.status());
        }

        shared.running.send_replace(false);
        // watch mode may have been turned back on while this instance was exiting
        if !shared.watch_mode.load(Ordering::SeqCst) || !shared.claim() {
            break;
        }
    }
    tracing::debug!("watch loop exited");
}
