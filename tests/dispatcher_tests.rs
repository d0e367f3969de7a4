//! Dispatcher integration tests over real sockets.
//!
//! These tests verify the request vocabulary, commit placement onto fake
//! runners, and results handling including multi-chunk payloads.

mod test_harness;

use std::time::Duration;

use test_harness::{assert_eventually, send_in_pieces, FakeMode, FakeRunner, TestDispatcher};

/// Test 1: Status and malformed commands
#[tokio::test]
async fn test_status_and_invalid_commands() {
    let dispatcher = TestDispatcher::start().await;

    assert_eq!(dispatcher.send(b"status").await, "OK");
    assert_eq!(dispatcher.send(b"status\n").await, "OK");
    assert_eq!(dispatcher.send(b"").await, "Invalid command");
    assert_eq!(dispatcher.send(b"launch:abc").await, "Invalid command");
    assert_eq!(dispatcher.send(b"ping").await, "Invalid command");
    assert_eq!(dispatcher.send(b"register:nohost").await, "Invalid address");
    assert_eq!(dispatcher.send(b"register:127.0.0.1:notaport").await, "Invalid address");
    assert!(dispatcher.runners().await.is_empty());
}

/// Test 2: Dispatch is refused while no runner is registered
#[tokio::test]
async fn test_dispatch_without_runners() {
    let dispatcher = TestDispatcher::start().await;

    assert_eq!(dispatcher.send(b"dispatch:abc123").await, "No runners are registered");
    assert!(!dispatcher.is_pending("abc123").await);
    assert!(dispatcher.assigned_runner("abc123").await.is_none());
}

/// Test 3: Happy path from dispatch to stored results
#[tokio::test]
async fn test_dispatch_and_results_round_trip() {
    let dispatcher = TestDispatcher::start().await;
    let runner = FakeRunner::start(FakeMode::Accept).await;
    dispatcher.register(&runner).await;

    assert_eq!(dispatcher.send(b"dispatch:abc123").await, "OK");

    assert_eventually(
        || async { dispatcher.assigned_runner("abc123").await.as_ref() == Some(&runner.addr) },
        Duration::from_secs(5),
        "commit should be assigned to the accepting runner",
    )
    .await;
    assert_eq!(runner.runtests().await, vec!["abc123".to_string()]);
    assert!(!dispatcher.is_pending("abc123").await);

    assert_eq!(dispatcher.send(b"results:abc123:11:passed:all:").await, "OK");

    assert!(dispatcher.assigned_runner("abc123").await.is_none());
    let stored = tokio::fs::read(dispatcher.results_path("abc123")).await.unwrap();
    assert_eq!(stored, b"passed\nall\n");
    dispatcher.state.read().await.check_invariants().unwrap();
}

/// Test 4: A busy runner is skipped in favour of a free one
#[tokio::test]
async fn test_busy_runner_is_skipped() {
    let dispatcher = TestDispatcher::start().await;
    let busy = FakeRunner::start(FakeMode::Busy).await;
    let free = FakeRunner::start(FakeMode::Accept).await;
    dispatcher.register(&busy).await;
    dispatcher.register(&free).await;

    assert_eq!(dispatcher.send(b"dispatch:c1").await, "OK");

    assert_eventually(
        || async { dispatcher.assigned_runner("c1").await.as_ref() == Some(&free.addr) },
        Duration::from_secs(5),
        "commit should land on the free runner",
    )
    .await;
    assert_eq!(free.runtests().await, vec!["c1".to_string()]);
}

/// Test 5: Dispatch keeps retrying until a busy runner frees up
#[tokio::test]
async fn test_dispatch_retries_until_runner_frees() {
    let dispatcher = TestDispatcher::start().await;
    let runner = FakeRunner::start(FakeMode::Busy).await;
    dispatcher.register(&runner).await;

    assert_eq!(dispatcher.send(b"dispatch:c2").await, "OK");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dispatcher.is_pending("c2").await);
    assert!(dispatcher.assigned_runner("c2").await.is_none());

    runner.set_mode(FakeMode::Accept).await;

    assert_eventually(
        || async { dispatcher.assigned_runner("c2").await.as_ref() == Some(&runner.addr) },
        Duration::from_secs(5),
        "commit should be assigned once the runner accepts",
    )
    .await;
    assert!(!dispatcher.is_pending("c2").await);
}

/// Test 6: A results payload larger than one frame arrives in overflow reads
#[tokio::test]
async fn test_large_results_payload_in_pieces() {
    let dispatcher = TestDispatcher::start().await;

    let payload: Vec<u8> = (0..5000)
        .map(|i| if i % 100 == 99 { b':' } else { b'a' + (i % 26) as u8 })
        .collect();
    let mut message = format!("results:big:{}:", payload.len()).into_bytes();
    message.extend_from_slice(&payload);

    let reply = send_in_pieces(&dispatcher.addr, &message, 700, Duration::from_millis(10)).await;
    assert_eq!(reply, "OK");

    let stored = tokio::fs::read(dispatcher.results_path("big")).await.unwrap();
    let expected: Vec<u8> = payload
        .iter()
        .map(|&b| if b == b':' { b'\n' } else { b })
        .collect();
    assert_eq!(stored.len(), 5000);
    assert_eq!(stored, expected);
}

/// Test 7: Truncated, oversized and malformed results are rejected
#[tokio::test]
async fn test_bad_results_rejected() {
    let dispatcher = TestDispatcher::start().await;

    assert_eq!(dispatcher.send(b"results:abc:5000:short").await, "Invalid results");
    assert_eq!(dispatcher.send(b"results:abc:100000:x").await, "Invalid results");
    assert_eq!(dispatcher.send(b"results:abc:many:x").await, "Invalid results");
    assert_eq!(dispatcher.send(b"results:..:1:x").await, "Invalid results");

    assert!(!dispatcher.results_path("abc").exists());
    assert_eq!(std::fs::read_dir(dispatcher.results_dir()).map(|d| d.count()).unwrap_or(0), 0);
}

/// Test 8: Registered runners are pinged regularly
#[tokio::test]
async fn test_runners_are_pinged() {
    let dispatcher = TestDispatcher::start().await;
    let runner = FakeRunner::start(FakeMode::Accept).await;
    dispatcher.register(&runner).await;

    assert_eventually(
        || async { runner.ping_count().await >= 3 },
        Duration::from_secs(5),
        "dispatcher should keep pinging the runner",
    )
    .await;
    assert_eq!(dispatcher.runners().await, vec![runner.addr.clone()]);
}

/// Test 9: A dispatch split across TCP segments keeps its full commit id
#[tokio::test]
async fn test_split_dispatch_is_not_truncated() {
    let dispatcher = TestDispatcher::start().await;
    let busy = FakeRunner::start(FakeMode::Busy).await;
    dispatcher.register(&busy).await;

    let reply = send_in_pieces(&dispatcher.addr, b"dispatch:abc123", 12, Duration::from_millis(50)).await;
    assert_eq!(reply, "OK");

    assert!(dispatcher.is_pending("abc123").await);
    assert!(!dispatcher.is_pending("abc").await);
    assert_eventually(
        || async { !busy.runtests().await.is_empty() },
        Duration::from_secs(5),
        "runner should be offered the commit",
    )
    .await;
    assert!(busy.runtests().await.iter().all(|c| c == "abc123"));
}

/// Test 10: A register split across TCP segments keeps its full port
#[tokio::test]
async fn test_split_register_is_not_truncated() {
    let dispatcher = TestDispatcher::start().await;
    let runner = FakeRunner::start(FakeMode::Accept).await;
    let message = format!("register:{}", runner.addr);

    let reply = send_in_pieces(&dispatcher.addr, message.as_bytes(), 20, Duration::from_millis(50)).await;
    assert_eq!(reply, "OK");
    assert_eq!(dispatcher.runners().await, vec![runner.addr.clone()]);

    // Pinged at the registered address, so it stays.
    assert_eventually(
        || async { runner.ping_count().await >= 2 },
        Duration::from_secs(5),
        "registered runner should be pinged",
    )
    .await;
    assert_eq!(dispatcher.runners().await, vec![runner.addr.clone()]);
}

/// Test 11: An oversized results upload still gets its rejection reply
#[tokio::test]
async fn test_oversized_results_upload_gets_reply() {
    let dispatcher = TestDispatcher::start().await;

    let mut message = b"results:huge:100000:".to_vec();
    message.extend_from_slice(&[b'x'; 20_000]);

    let reply = send_in_pieces(&dispatcher.addr, &message, 4096, Duration::from_millis(5)).await;
    assert_eq!(reply, "Invalid results");
    assert!(!dispatcher.results_path("huge").exists());
}
