//! Integration tests for the scheduler queue: ordering, admission,
//! timeouts, and watchdog behaviour.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentgate_core::queue::{
    EnqueueOptions, QueueConfig, SchedulerEvent, SchedulerQueue, StartOptions,
};

fn queue(
    max_concurrent: usize,
    tick: Duration,
) -> (Arc<SchedulerQueue>, mpsc::UnboundedReceiver<SchedulerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(SchedulerQueue::new(
            QueueConfig {
                max_concurrent,
                max_queue_size: 50,
                tick_interval: tick,
            },
            tx,
        )),
        rx,
    )
}

/// Wait for the next Ready event, ignoring StateChange noise.
async fn next_ready(rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for Ready")
            .expect("event channel closed");
        if let SchedulerEvent::Ready { work_order_id } = event {
            return work_order_id;
        }
    }
}

#[tokio::test]
async fn priority_respects_fifo_within_band() {
    // With the single slot held, enqueue A(0), B(10), C(5), D(10). Once
    // the slot frees, the admission order is B, D, C, A.
    let (queue, mut rx) = queue(1, Duration::from_secs(60));

    queue.enqueue("wo_hold", EnqueueOptions::default()).await;
    assert_eq!(next_ready(&mut rx).await, "wo_hold");
    queue.mark_started("wo_hold", StartOptions::default()).await;

    for (id, priority) in [("wo_a", 0), ("wo_b", 10), ("wo_c", 5), ("wo_d", 10)] {
        let outcome = queue
            .enqueue(
                id,
                EnqueueOptions {
                    priority,
                    ..Default::default()
                },
            )
            .await;
        assert!(outcome.accepted);
    }
    queue.mark_completed("wo_hold").await;

    let mut order = Vec::new();
    for _ in 0..4 {
        let id = next_ready(&mut rx).await;
        queue.mark_started(&id, StartOptions::default()).await;
        queue.mark_completed(&id).await;
        order.push(id);
    }

    assert_eq!(order, vec!["wo_b", "wo_d", "wo_c", "wo_a"]);
}

#[tokio::test]
async fn queue_timeout_fires_without_blocking_others() {
    // maxConcurrent=1: X runs, Y has a 50ms max wait. The watchdog drops Y
    // and emits Timeout even though no slot is free; a later enqueue is
    // admitted immediately.
    let (queue, mut rx) = queue(1, Duration::from_millis(20));
    queue.start_watchdogs(CancellationToken::new());

    queue.enqueue("wo_x", EnqueueOptions::default()).await;
    let first = next_ready(&mut rx).await;
    assert_eq!(first, "wo_x");
    queue.mark_started("wo_x", StartOptions::default()).await;

    queue
        .enqueue(
            "wo_y",
            EnqueueOptions {
                max_wait: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await;

    // Wait for the watchdog to observe the expiry.
    let timed_out = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(SchedulerEvent::Timeout { work_order_id }) => break work_order_id,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("Timeout event should fire");
    assert_eq!(timed_out, "wo_y");

    // X completes into an empty queue; nothing becomes ready.
    queue.mark_completed("wo_x").await;
    assert_eq!(queue.stats().await.waiting, 0);

    // A fresh enqueue is admitted immediately.
    queue.enqueue("wo_z", EnqueueOptions::default()).await;
    assert_eq!(next_ready(&mut rx).await, "wo_z");
}

#[tokio::test]
async fn run_timeout_watchdog_reports_overrunning_work() {
    let (queue, mut rx) = queue(2, Duration::from_millis(20));
    queue.start_watchdogs(CancellationToken::new());

    queue.enqueue("wo_long", EnqueueOptions::default()).await;
    queue
        .mark_started(
            "wo_long",
            StartOptions {
                max_wall_clock: Some(Duration::from_millis(40)),
                cancel: None,
            },
        )
        .await;

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(SchedulerEvent::RunTimeout {
                    work_order_id,
                    elapsed,
                    cap,
                }) => break (work_order_id, elapsed, cap),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("RunTimeout should fire");

    assert_eq!(event.0, "wo_long");
    assert!(event.1 > event.2);
    assert_eq!(event.2, Duration::from_millis(40));
}

#[tokio::test]
async fn running_never_exceeds_cap() {
    let (queue, mut rx) = queue(2, Duration::from_secs(60));

    for i in 0..6 {
        queue
            .enqueue(&format!("wo_{i}"), EnqueueOptions::default())
            .await;
    }

    // Start everything the scheduler hands out, checking the cap at each
    // step.
    let mut started = Vec::new();
    for _ in 0..2 {
        let id = next_ready(&mut rx).await;
        queue.mark_started(&id, StartOptions::default()).await;
        started.push(id);
        assert!(queue.stats().await.running <= 2);
    }

    // No third Ready while both slots are held.
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.process().await;
    let mut extra_ready = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SchedulerEvent::Ready { .. }) {
            extra_ready = true;
        }
    }
    assert!(!extra_ready, "no Ready while at the concurrency cap");

    queue.mark_completed(&started[0]).await;
    let id = next_ready(&mut rx).await;
    queue.mark_started(&id, StartOptions::default()).await;
    let stats = queue.stats().await;
    assert_eq!(stats.running, 2);
    assert_eq!(stats.waiting, 3);
}

#[tokio::test]
async fn persistence_roundtrip_preserves_order_and_drops_running() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().to_path_buf();

    let (original, _rx) = queue(2, Duration::from_secs(60));
    original
        .enqueue(
            "wo_high",
            EnqueueOptions {
                priority: 10,
                ..Default::default()
            },
        )
        .await;
    original
        .enqueue(
            "wo_low",
            EnqueueOptions {
                priority: 1,
                ..Default::default()
            },
        )
        .await;
    original.enqueue("wo_active", EnqueueOptions::default()).await;
    original
        .mark_started("wo_active", StartOptions::default())
        .await;
    original.persist(&data_dir).await;

    let (restored, mut rx) = queue(2, Duration::from_secs(60));
    assert!(restored.restore(&data_dir).await);

    let stats = restored.stats().await;
    assert_eq!(stats.waiting, 2);
    assert_eq!(stats.running, 0, "running set must not be restored");

    // Priority order survives the roundtrip.
    assert_eq!(next_ready(&mut rx).await, "wo_high");
}
