//! Playback queue integration tests

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use seer_voice::voice::{AudioClip, PlaybackQueue};

mod common;
use common::RecordingSink;

fn clip(bytes: &[u8]) -> AudioClip {
    AudioClip::from(bytes.to_vec())
}

#[tokio::test(start_paused = true)]
async fn test_plays_in_push_order_one_at_a_time() {
    let sink = RecordingSink::new(Duration::from_millis(50));
    let queue = PlaybackQueue::new(Arc::new(sink.clone()));

    for n in 1..=3u8 {
        queue.push(clip(&[n]));
    }
    assert!(queue.is_playing());
    queue.wait_idle().await;

    assert_eq!(sink.played(), vec![vec![1], vec![2], vec![3]]);
    assert_eq!(sink.max_concurrent(), 1);
    assert!(!queue.is_playing());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_producers_keep_their_own_order() {
    let sink = RecordingSink::new(Duration::from_millis(10));
    let queue = PlaybackQueue::new(Arc::new(sink.clone()));

    let producers: Vec<_> = (0..3u8)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..5u8 {
                    queue.push(clip(&[p, i]));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    queue.wait_idle().await;

    let played = sink.played();
    assert_eq!(played.len(), 15);
    for p in 0..3u8 {
        let order: Vec<u8> = played.iter().filter(|c| c[0] == p).map(|c| c[1]).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4], "producer {p} out of order");
    }
    assert_eq!(sink.max_concurrent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_clip_does_not_stall_queue() {
    let sink = RecordingSink::new(Duration::from_millis(20)).failing_on(&[2]);
    let emptied = Arc::new(AtomicUsize::new(0));
    let queue = PlaybackQueue::builder(Arc::new(sink.clone()))
        .on_empty({
            let emptied = Arc::clone(&emptied);
            move || {
                emptied.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();

    queue.push(clip(&[1]));
    queue.push(clip(&[2]));
    queue.push(clip(&[3]));
    queue.wait_idle().await;

    assert_eq!(sink.played(), vec![vec![1], vec![2], vec![3]]);
    assert_eq!(emptied.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_observers_fire_once_per_busy_period() {
    let sink = RecordingSink::new(Duration::from_millis(20));
    let started = Arc::new(AtomicUsize::new(0));
    let emptied = Arc::new(AtomicUsize::new(0));
    let queue = PlaybackQueue::builder(Arc::new(sink.clone()))
        .on_start({
            let started = Arc::clone(&started);
            move || {
                started.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_empty({
            let emptied = Arc::clone(&emptied);
            move || {
                emptied.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();

    queue.push(clip(b"a"));
    queue.push(clip(b"b"));
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(emptied.load(Ordering::SeqCst), 0);

    queue.wait_idle().await;
    assert_eq!(emptied.load(Ordering::SeqCst), 1);

    queue.push(clip(b"c"));
    assert_eq!(started.load(Ordering::SeqCst), 2);
    queue.wait_idle().await;
    assert_eq!(emptied.load(Ordering::SeqCst), 2);
    assert_eq!(sink.played().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_push_while_playing_joins_current_drain() {
    let sink = RecordingSink::new(Duration::from_millis(100));
    let emptied = Arc::new(AtomicUsize::new(0));
    let queue = PlaybackQueue::builder(Arc::new(sink.clone()))
        .on_empty({
            let emptied = Arc::clone(&emptied);
            move || {
                emptied.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();

    queue.push(clip(b"first"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.len(), 1);
    queue.push(clip(b"second"));
    assert_eq!(queue.len(), 2);

    queue.wait_idle().await;
    assert_eq!(sink.played(), vec![b"first".to_vec(), b"second".to_vec()]);
    assert_eq!(emptied.load(Ordering::SeqCst), 1);
    assert_eq!(sink.max_concurrent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_tracks_playing_flag() {
    let sink = RecordingSink::new(Duration::from_millis(30));
    let queue = PlaybackQueue::new(Arc::new(sink));
    let mut playing = queue.subscribe();
    assert!(!*playing.borrow());

    queue.push(clip(b"x"));
    assert!(*playing.borrow_and_update());

    playing.changed().await.unwrap();
    assert!(!*playing.borrow());
    assert!(queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edges_alternate_when_push_races_drain() {
    let sink = RecordingSink::new(Duration::from_millis(10));
    let log = Arc::new(Mutex::new(Vec::new()));
    let (entered_tx, mut entered) = tokio::sync::mpsc::unbounded_channel();
    let queue = PlaybackQueue::builder(Arc::new(sink.clone()))
        .on_start({
            let log = Arc::clone(&log);
            move || log.lock().unwrap().push("start")
        })
        .on_empty({
            let log = Arc::clone(&log);
            move || {
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_millis(30));
                log.lock().unwrap().push("empty");
            }
        })
        .build();

    queue.push(clip(b"first"));
    entered.recv().await.unwrap();

    // lands while the first on_empty is still running
    let pusher = tokio::spawn({
        let queue = queue.clone();
        async move { queue.push(clip(b"second")) }
    });
    pusher.await.unwrap();
    entered.recv().await.unwrap();
    queue.wait_idle().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*log.lock().unwrap(), vec!["start", "empty", "start", "empty"]);
    assert_eq!(sink.played(), vec![b"first".to_vec(), b"second".to_vec()]);
    assert!(!queue.is_playing());
}

#[tokio::test(start_paused = true)]
async fn test_wait_busy_sees_push_or_times_out() {
    let sink = RecordingSink::new(Duration::from_millis(20));
    let queue = PlaybackQueue::new(Arc::new(sink));

    let start = tokio::time::Instant::now();
    assert!(!queue.wait_busy(Duration::from_secs(3)).await);
    assert_eq!(start.elapsed(), Duration::from_secs(3));

    let producer = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        producer.push(clip(b"reply"));
    });
    let start = tokio::time::Instant::now();
    assert!(queue.wait_busy(Duration::from_secs(3)).await);
    assert_eq!(start.elapsed(), Duration::from_millis(500));
}
