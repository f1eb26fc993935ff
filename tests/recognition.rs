//! Recognition polling tests with a scripted backend and paused time

use std::sync::Arc;
use std::time::Duration;

use seer_voice::vision::{CardSpotter, FillerClips, ReadingPoller, ReadingState, Stage, Watcher};
use seer_voice::voice::{AudioClip, PlaybackQueue};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

mod common;
use common::{Call, FakeCamera, RecordingSink, ScriptedBackend, report, spotted, test_settings};

struct Rig {
    backend: Arc<ScriptedBackend>,
    camera: Arc<FakeCamera>,
    sink: RecordingSink,
    queue: PlaybackQueue,
    _settings: watch::Sender<seer_voice::Settings>,
    settings: watch::Receiver<seer_voice::Settings>,
}

fn rig(backend: ScriptedBackend) -> Rig {
    let sink = RecordingSink::new(Duration::from_millis(10));
    let (tx, rx) = watch::channel(test_settings());
    Rig {
        backend: Arc::new(backend),
        camera: Arc::new(FakeCamera::default()),
        queue: PlaybackQueue::new(Arc::new(sink.clone())),
        sink,
        _settings: tx,
        settings: rx,
    }
}

fn reading_watcher(rig: &Rig) -> Watcher<ReadingPoller> {
    Watcher::new(ReadingPoller::new(
        rig.backend.clone(),
        rig.camera.clone(),
        rig.queue.clone(),
        rig.settings.clone(),
    ))
}

fn offsets(calls: &[(Instant, Call)], start: Instant) -> Vec<Duration> {
    calls.iter().map(|(at, _)| at.duration_since(start)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_reading_completes_and_resets() {
    let rig = rig(ScriptedBackend::new()
        .upload_reply(Ok(report(Stage::VerifyingTarget, Some("T1"), None)))
        .upload_reply(Ok(report(Stage::TtsComplete, None, Some("QUJD")))));
    let watcher = reading_watcher(&rig);
    let mut status = watcher.subscribe();
    let start = Instant::now();

    watcher.set_watch_mode(true);

    let verifying = status
        .wait_for(|s| s.stage == Stage::VerifyingTarget)
        .await
        .unwrap()
        .clone();
    assert_eq!(verifying.task_id.as_deref(), Some("T1"));

    status
        .wait_for(|s| *s == ReadingState::default())
        .await
        .unwrap();
    rig.queue.wait_idle().await;
    watcher.set_watch_mode(false);
    watcher.wait_stopped().await;

    assert_eq!(rig.sink.played(), vec![vec![0x41, 0x42, 0x43]]);

    let calls = rig.backend.calls();
    assert_eq!(
        calls[..2].iter().map(|(_, c)| c.clone()).collect::<Vec<_>>(),
        vec![
            Call::Upload { task_id: None },
            Call::Upload {
                task_id: Some("T1".to_string())
            },
        ]
    );
    // search interval first, then the shorter verify interval
    let at = offsets(&calls, start);
    assert_eq!(at[0], Duration::from_secs(2));
    assert_eq!(at[1], Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_requested_stages_poll_task_status() {
    let rig = rig(ScriptedBackend::new()
        .upload_reply(Ok(report(Stage::VerifyingTarget, Some("T9"), None)))
        .upload_reply(Ok(report(Stage::ReadingRequested, None, None)))
        .status_reply(Ok(report(Stage::TtsRequested, None, None)))
        .status_reply(Ok(report(Stage::TtsComplete, None, Some("RA==")))));
    let watcher = reading_watcher(&rig);
    let mut status = watcher.subscribe();

    watcher.set_watch_mode(true);
    status
        .wait_for(|s| s.stage == Stage::TtsRequested)
        .await
        .unwrap();
    status
        .wait_for(|s| *s == ReadingState::default())
        .await
        .unwrap();
    watcher.set_watch_mode(false);
    watcher.wait_stopped().await;
    rig.queue.wait_idle().await;

    let calls: Vec<Call> = rig.backend.calls().into_iter().map(|(_, c)| c).collect();
    assert_eq!(
        calls[2..4],
        [
            Call::Status {
                task_id: "T9".to_string()
            },
            Call::Status {
                task_id: "T9".to_string()
            },
        ]
    );
    assert_eq!(rig.sink.played(), vec![b"D".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_iteration_backs_off_then_searches_again() {
    let rig = rig(ScriptedBackend::new().upload_reply(Err("connection refused")));
    let watcher = reading_watcher(&rig);
    let mut status = watcher.subscribe();
    let start = Instant::now();

    watcher.set_watch_mode(true);
    status.wait_for(|s| s.stage == Stage::Error).await.unwrap();

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(watcher.status().stage, Stage::NoTarget);
    assert_eq!(watcher.status().task_id, None);

    watcher.set_watch_mode(false);
    watcher.wait_stopped().await;

    // failure at 2s, 5s back-off, next search interval ends at 9s
    let at = offsets(&rig.backend.calls(), start);
    assert_eq!(at[0], Duration::from_secs(2));
    assert_eq!(at[1], Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_drops_the_failed_task() {
    let rig = rig(ScriptedBackend::new()
        .upload_reply(Ok(report(Stage::VerifyingTarget, Some("T4"), None)))
        .upload_reply(Err("connection reset")));
    let watcher = reading_watcher(&rig);
    let mut status = watcher.subscribe();
    let start = Instant::now();

    watcher.set_watch_mode(true);
    status.wait_for(|s| s.stage == Stage::Error).await.unwrap();
    assert_eq!(watcher.status().task_id.as_deref(), Some("T4"));

    tokio::time::sleep(Duration::from_secs(7)).await;
    watcher.set_watch_mode(false);
    watcher.wait_stopped().await;

    // verify at 3s fails, 5s back-off, fresh search at 10s
    let calls = rig.backend.calls();
    assert_eq!(
        calls.iter().map(|(_, c)| c.clone()).collect::<Vec<_>>(),
        vec![
            Call::Upload { task_id: None },
            Call::Upload {
                task_id: Some("T4".to_string())
            },
            Call::Upload { task_id: None },
        ]
    );
    assert_eq!(
        offsets(&calls, start),
        vec![Duration::from_secs(2), Duration::from_secs(3), Duration::from_secs(10)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_watch_mode_runs_a_single_loop() {
    let rig = rig(ScriptedBackend::new());
    let watcher = reading_watcher(&rig);

    watcher.set_watch_mode(true);
    watcher.set_watch_mode(true);
    watcher.set_watch_mode(false);
    watcher.set_watch_mode(true);
    assert!(watcher.is_running());

    tokio::time::sleep(Duration::from_millis(7000)).await;
    watcher.set_watch_mode(false);
    watcher.wait_stopped().await;

    // one loop polling every 2s: 2s, 4s, 6s, plus the iteration in flight at 7s
    assert_eq!(rig.camera.captures(), 4);
    assert!(!watcher.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_turning_off_lets_iteration_finish() {
    let rig = rig(ScriptedBackend::new());
    let watcher = reading_watcher(&rig);
    let start = Instant::now();

    watcher.set_watch_mode(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    watcher.set_watch_mode(false);
    assert!(!watcher.is_watch_mode());

    watcher.wait_stopped().await;
    // resolves as soon as the in-flight iteration ends at the search interval
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(rig.backend.calls().len(), 1);
    assert!(!watcher.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_spotter_plays_filler_until_verified() {
    let rig = rig(ScriptedBackend::new()
        .spot_reply(spotted(&["The Fool"], false))
        .spot_reply(spotted(&["The Fool", "The Tower"], true)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let filler = FillerClips::new(vec![AudioClip::from(b"hmm".to_vec())]);
    let spotter = CardSpotter::new(
        rig.backend.clone(),
        rig.camera.clone(),
        rig.queue.clone(),
        filler,
        rig.settings.clone(),
        move |hand| {
            let _ = tx.send(hand);
        },
    );
    let watcher = Watcher::new(spotter);
    let start = Instant::now();

    watcher.set_watch_mode(true);
    watcher.wait_stopped().await;
    rig.queue.wait_idle().await;

    let hand = rx.recv().await.unwrap();
    assert_eq!(hand.cards.len(), 2);
    assert!(!watcher.is_watch_mode());
    assert!(watcher.status().hand_verified);
    assert_eq!(rig.sink.played(), vec![b"hmm".to_vec()]);

    // after an unverified hand the verify interval applies
    let at = offsets(&rig.backend.calls(), start);
    assert_eq!(at, vec![Duration::from_secs(2), Duration::from_secs(3)]);
}

#[tokio::test(start_paused = true)]
async fn test_spotter_without_hand_stays_quiet() {
    let rig = rig(ScriptedBackend::new());
    let spotter = CardSpotter::new(
        rig.backend.clone(),
        rig.camera.clone(),
        rig.queue.clone(),
        FillerClips::new(vec![AudioClip::from(b"hmm".to_vec())]),
        rig.settings.clone(),
        |_| panic!("nothing to verify"),
    );
    let watcher = Watcher::new(spotter);

    watcher.set_watch_mode(true);
    tokio::time::sleep(Duration::from_millis(4500)).await;
    watcher.set_watch_mode(false);
    watcher.wait_stopped().await;

    assert!(rig.sink.played().is_empty());
    assert_eq!(rig.backend.calls().len(), 3);
}
