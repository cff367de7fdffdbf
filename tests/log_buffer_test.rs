//! Contract tests for the per-service log buffer.

use chrono::{Duration as ChronoDuration, Utc};
use devstack::service::{LogBuffer, LogEntry, LogLevel, LogManager};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn entry(message: &str) -> LogEntry {
    LogEntry::new("web", message, false)
}

fn messages(entries: &[LogEntry]) -> Vec<String> {
    entries.iter().map(|e| e.message.clone()).collect()
}

// =============================================================================
// Ring semantics
// =============================================================================

#[test]
fn test_capacity_five_keeps_last_five_in_order() {
    let buffer = LogBuffer::new("web", 5);
    for i in 0..10 {
        buffer.add(entry(&format!("line {}", i)));
    }

    let recent = buffer.get_recent(10);
    assert_eq!(
        messages(&recent),
        vec!["line 5", "line 6", "line 7", "line 8", "line 9"]
    );
    assert_eq!(buffer.len(), 5);
    assert_eq!(buffer.dropped_count(), 5);
}

#[test]
fn test_get_recent_edge_cases() {
    let buffer = LogBuffer::new("web", 100);
    for i in 0..4 {
        buffer.add(entry(&format!("{}", i)));
    }

    assert_eq!(buffer.get_recent(0).len(), 4);
    assert_eq!(buffer.get_recent(-3).len(), 4);
    assert_eq!(buffer.get_recent(50).len(), 4);
    assert_eq!(messages(&buffer.get_recent(2)), vec!["2", "3"]);
    assert!(LogBuffer::new("empty", 3).get_recent(5).is_empty());
}

#[test]
fn test_queries_by_time_and_level() {
    let buffer = LogBuffer::new("api", 10);
    let old = Utc::now() - ChronoDuration::minutes(10);
    buffer.add(LogEntry::new("api", "booting", false).with_timestamp(old));
    buffer.add(LogEntry::new("api", "Error: connection refused", true));
    buffer.add(LogEntry::new("api", "warning: slow query", false));

    let since = Utc::now() - ChronoDuration::minutes(1);
    assert_eq!(buffer.get_since(since).len(), 2);
    assert_eq!(
        messages(&buffer.get_by_level(LogLevel::Error)),
        vec!["Error: connection refused"]
    );
    assert_eq!(buffer.get_by_level(LogLevel::Warn).len(), 1);
    assert_eq!(buffer.get_by_level(LogLevel::Info).len(), 1);
}

#[test]
fn test_clear_empties_the_ring() {
    let buffer = LogBuffer::new("web", 5);
    buffer.add(entry("a"));
    buffer.clear();
    assert!(buffer.is_empty());
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_every_subscriber_gets_every_entry() {
    let buffer = LogBuffer::new("web", 10);
    let mut first = buffer.subscribe();
    let mut second = buffer.subscribe();

    let sent = entry("listening on 3000");
    buffer.add(sent.clone());

    assert_eq!(first.recv().await, Some(sent.clone()));
    assert_eq!(second.recv().await, Some(sent));
}

#[tokio::test]
async fn test_unsubscribed_feed_ends_and_receives_nothing_more() {
    let buffer = LogBuffer::new("web", 10);
    let mut feed = buffer.subscribe();
    let mut other = buffer.subscribe();

    buffer.unsubscribe(&feed);
    buffer.add(entry("after unsubscribe"));

    let next = tokio::time::timeout(Duration::from_secs(1), feed.recv())
        .await
        .expect("unsubscribed feed must end, not hang");
    assert_eq!(next, None);
    assert_eq!(other.recv().await.map(|e| e.message).as_deref(), Some("after unsubscribe"));
    assert_eq!(buffer.subscriber_count(), 1);
}

#[tokio::test]
async fn test_subscribers_see_insertion_order_from_concurrent_writer() {
    let buffer = Arc::new(LogBuffer::new("web", 1000));
    let mut feed = buffer.subscribe();

    let writer = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                buffer.add(entry(&i.to_string()));
            }
        })
    };
    writer.await.unwrap();

    for expected in 0..100 {
        let got = feed.recv().await.unwrap();
        assert_eq!(got.message, expected.to_string());
    }
}

#[tokio::test]
async fn test_close_ends_feeds_and_is_idempotent() {
    let buffer = LogBuffer::new("web", 10);
    let mut feed = buffer.subscribe();
    buffer.add(entry("last words"));

    buffer.close();
    buffer.close();
    buffer.add(entry("ignored"));

    assert_eq!(feed.recv().await.map(|e| e.message).as_deref(), Some("last words"));
    assert_eq!(feed.recv().await, None);
    assert_eq!(messages(&buffer.get_recent(0)), vec!["last words"]);

    let mut late = buffer.subscribe();
    assert_eq!(late.recv().await, None);
}

#[tokio::test]
async fn test_backlog_and_feed_split_same_timestamp_entries() {
    let buffer = LogBuffer::new("web", 10);
    let stamp = Utc::now();
    buffer.add(entry("first").with_timestamp(stamp));
    buffer.add(entry("second").with_timestamp(stamp));

    let (backlog, mut feed) = buffer.subscribe_with_backlog();
    buffer.add(entry("third").with_timestamp(stamp));

    assert_eq!(messages(&backlog), vec!["first", "second"]);
    assert_eq!(feed.recv().await.map(|e| e.message).as_deref(), Some("third"));
}

#[test]
fn test_backlog_and_feed_cover_a_concurrent_writer_exactly_once() {
    let buffer = Arc::new(LogBuffer::new("web", 10_000));
    let stamp = Utc::now();
    let writer = {
        let buffer = buffer.clone();
        std::thread::spawn(move || {
            for i in 0..200 {
                buffer.add(entry(&i.to_string()).with_timestamp(stamp));
            }
        })
    };

    let (backlog, mut feed) = buffer.subscribe_with_backlog();
    writer.join().unwrap();
    buffer.close();

    let mut seen = messages(&backlog);
    while let Some(next) = feed.try_recv() {
        seen.push(next.message);
    }
    let expected: Vec<String> = (0..200).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);
}

// =============================================================================
// Durable logs
// =============================================================================

#[test]
fn test_file_backed_buffer_is_flushed_on_close() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(dir.path());
    let buffer = manager.create_buffer("worker", 10, true);
    buffer.add(LogEntry::new("worker", "job started", false));
    buffer.add(LogEntry::new("worker", "job failed: error 42", true));

    let path = buffer.file_path().unwrap().to_path_buf();
    assert_eq!(path, dir.path().join(".devstack").join("logs").join("worker.log"));
    manager.close_all();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("[INFO] job started"), "{}", lines[0]);
    assert!(lines[1].ends_with("[ERROR] [stderr] job failed: error 42"), "{}", lines[1]);
}

#[test]
fn test_log_file_matches_ring_order_under_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let buffer = Arc::new(LogBuffer::with_file("api", 1000, dir.path()));

    let writers: Vec<_> = [false, true]
        .into_iter()
        .map(|is_stderr| {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    buffer.add(LogEntry::new("api", format!("{}-{}", is_stderr, i), is_stderr));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let ring: Vec<String> = buffer.get_recent(0).iter().map(LogEntry::file_line).collect();
    let path = buffer.file_path().unwrap().to_path_buf();
    buffer.close();

    let contents = std::fs::read_to_string(path).unwrap();
    let file: Vec<&str> = contents.lines().collect();
    assert_eq!(file.len(), 400);
    assert_eq!(file, ring);
}

#[test]
fn test_manager_remove_closes_buffer() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(dir.path());
    let buffer = manager.create_buffer("web", 10, false);
    assert_eq!(manager.names(), vec!["web"]);

    manager.remove("web");
    assert!(buffer.is_closed());
    assert!(manager.get("web").is_none());
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_ring_never_exceeds_capacity(capacity in 1usize..50, adds in 0usize..200, n in -5i64..300) {
        let buffer = LogBuffer::new("p", capacity);
        for i in 0..adds {
            buffer.add(LogEntry::new("p", i.to_string(), false));
        }

        let size = adds.min(capacity);
        prop_assert_eq!(buffer.len(), size);

        let recent = buffer.get_recent(n);
        let expected_len = if n <= 0 { size } else { (n as usize).min(size) };
        prop_assert_eq!(recent.len(), expected_len);

        // Always the newest entries, oldest first.
        let expected: Vec<String> = (adds - expected_len..adds).map(|i| i.to_string()).collect();
        prop_assert_eq!(messages(&recent), expected);
    }
}
