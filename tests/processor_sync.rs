//! End-to-end sync processor scenarios.

mod common;

use std::time::Duration;

use common::{wait_until, Fixture};
use rq_share::{File, ShareEvent, SyncProcessor, Tree};

async fn next_matching(
    events: &mut tokio::sync::broadcast::Receiver<ShareEvent>,
    timeout: Duration,
    mut matches: impl FnMut(&ShareEvent) -> bool,
) -> Option<ShareEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if matches(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn create_and_sync_lands_as_wire_post() {
    let fixture = Fixture::with_config(|c| c.no_processor = false).await;
    let tree = fixture.tree();

    tree.create_file("/a.txt").await.unwrap();
    let mut file = tree.open("/a.txt").await.unwrap();
    file.write(b"abcd", 0).await.unwrap();
    file.close().await.unwrap();

    let mut events = fixture.share.events().subscribe();
    let processor = SyncProcessor::spawn(&fixture.share);

    let start = next_matching(&mut events, Duration::from_secs(2), |e| {
        matches!(e, ShareEvent::SyncFileStart { path, .. } if path == "/a.txt")
    })
    .await
    .expect("expected a syncstart event for /a.txt");
    match start {
        ShareEvent::SyncFileStart { method, .. } => assert_eq!(method.to_string(), "POST"),
        _ => unreachable!(),
    }

    let end = next_matching(&mut events, Duration::from_secs(2), |e| {
        matches!(e, ShareEvent::SyncFileEnd { path, .. } if path == "/a.txt")
    })
    .await
    .expect("expected a syncend event for /a.txt");
    match end {
        ShareEvent::SyncFileEnd { method, .. } => assert_eq!(method.to_string(), "POST"),
        _ => unreachable!(),
    }

    assert_eq!(fixture.remote.body_of("/a.txt").unwrap(), b"abcd");
    processor.stop().await;
}

#[tokio::test]
async fn update_of_existing_remote_file_lands_as_wire_put() {
    let fixture = Fixture::with_config(|c| c.no_processor = false).await;
    fixture.remote.seed("/a.txt", b"abcd", 1_000);
    let tree = fixture.tree();

    let mut file = tree.open("/a.txt").await.unwrap();
    file.set_length(100).await.unwrap();
    file.close().await.unwrap();

    let mut events = fixture.share.events().subscribe();
    let processor = SyncProcessor::spawn(&fixture.share);

    let start = next_matching(&mut events, Duration::from_secs(2), |e| {
        matches!(e, ShareEvent::SyncFileStart { path, .. } if path == "/a.txt")
    })
    .await
    .expect("expected a syncstart event");
    match start {
        ShareEvent::SyncFileStart { method, .. } => assert_eq!(method.to_string(), "PUT"),
        _ => unreachable!(),
    }

    let landed = wait_until(
        || fixture.remote.body_of("/a.txt").map(|b| b.len() == 100).unwrap_or(false),
        Duration::from_secs(2),
    )
    .await;
    assert!(landed, "expected the remote to observe a 100-byte body");

    processor.stop().await;
}

#[tokio::test]
async fn second_write_during_upload_aborts_the_first() {
    let fixture = Fixture::with_config(|c| c.no_processor = false).await;
    fixture.remote.seed("/a.txt", b"abcd", 1_000);
    fixture.remote.set_write_delay(Duration::from_millis(300));
    let tree = fixture.tree();

    {
        let mut file = tree.open("/a.txt").await.unwrap();
        file.write(b"first-write", 0).await.unwrap();
        file.close().await.unwrap();
    }

    let mut events = fixture.share.events().subscribe();
    let processor = SyncProcessor::spawn(&fixture.share);

    next_matching(&mut events, Duration::from_secs(2), |e| {
        matches!(e, ShareEvent::SyncFileStart { path, .. } if path == "/a.txt")
    })
    .await
    .expect("expected the first attempt to start");

    {
        let mut file = tree.open("/a.txt").await.unwrap();
        file.write(b"second-write-wins", 0).await.unwrap();
        file.close().await.unwrap();
    }

    let aborted = next_matching(&mut events, Duration::from_secs(2), |e| {
        matches!(e, ShareEvent::SyncAbort { path } if path == "/a.txt")
    })
    .await;
    assert!(aborted.is_some(), "expected the superseded upload to abort");

    let landed = wait_until(
        || {
            fixture
                .remote
                .body_of("/a.txt")
                .map(|b| b == b"second-write-wins")
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(landed, "the superseding write must be the one that eventually syncs");

    processor.stop().await;
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[tokio::test]
async fn remote_rollback_is_detected_on_next_open() {
    let fixture = Fixture::new().await;
    // Seed with a timestamp close to wall-clock "now" so the freshly
    // materialized local copy's mtime lands well inside the
    // modified-threshold window (it would otherwise read as an unsafe
    // local edit rather than a clean, synced copy).
    fixture.remote.seed("/a.txt", b"current-body", now_ms());
    let tree = fixture.tree();

    {
        let mut file = tree.open("/a.txt").await.unwrap();
        let mut buf = [0u8; 32];
        file.read(&mut buf, 0).await.unwrap();
        file.close().await.unwrap();
    }

    // Roll the remote back by more than the divergence window, keeping the
    // local copy and its sync marker untouched.
    fixture.remote.seed("/a.txt", b"rolled-back-body", now_ms() - 3_600_000);

    let mut file = tree.open("/a.txt").await.unwrap();
    let mut buf = [0u8; 32];
    let n = file.read(&mut buf, 0).await.unwrap();
    file.close().await.unwrap();

    assert_eq!(&buf[..n], b"rolled-back-body");
}

#[tokio::test]
async fn exhausted_retries_purge_and_leave_local_file_intact() {
    let fixture = Fixture::with_config(|c| {
        c.no_processor = false;
        c.max_retries = 3;
        c.retry_delay_ms = 0;
        c.frequency_ms = 5;
    })
    .await;
    fixture.remote.set_fail_writes(true);
    let tree = fixture.tree();

    tree.create_file("/a.txt").await.unwrap();
    let mut file = tree.open("/a.txt").await.unwrap();
    file.write(b"abcd", 0).await.unwrap();
    file.close().await.unwrap();

    let mut events = fixture.share.events().subscribe();
    let processor = SyncProcessor::spawn(&fixture.share);

    let purged = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, ShareEvent::SyncPurged { .. })
    })
    .await
    .expect("expected the poisoned entry to be purged");
    match purged {
        ShareEvent::SyncPurged { files } => assert_eq!(files, vec!["/a.txt".to_string()]),
        _ => unreachable!(),
    }

    assert!(!fixture.remote.exists("/a.txt"), "remote never saw a write during this test");
    assert!(tree.exists("/a.txt").await, "local file is preserved across a purge");

    processor.stop().await;
}
