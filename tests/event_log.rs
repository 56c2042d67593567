//! Event Log Integration Tests
//!
//! Tests for durability properties: prefix-consistent re-reads, torn-record
//! detection, and tail behavior across read-chunk boundaries.

use lockstep::{Event, EventLog, EventType};
use tempfile::TempDir;

#[tokio::test]
async fn test_reread_after_clean_cut_is_prefix_consistent() {
    let temp = TempDir::new().unwrap();
    let mut log = EventLog::open(temp.path()).await.unwrap();

    for i in 0..10 {
        let event = Event::new(EventType::StepStarted, "run-1").with_step(format!("step{i}"));
        log.append(event).await.unwrap();
    }

    // Simulate an abrupt stop: keep only the bytes up to some complete line
    let path = temp.path().join("events.jsonl");
    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    let prefix = format!("{}\n", lines[..6].join("\n"));
    std::fs::write(&path, &prefix).unwrap();

    let events = log.read_all().await.unwrap();
    assert_eq!(events.len(), 6);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.step_id.as_deref(), Some(format!("step{i}").as_str()));
    }
}

#[tokio::test]
async fn test_torn_record_is_detected_not_skipped() {
    let temp = TempDir::new().unwrap();
    let mut log = EventLog::open(temp.path()).await.unwrap();

    for i in 0..3 {
        let event = Event::new(EventType::StepStarted, "run-1").with_step(format!("step{i}"));
        log.append(event).await.unwrap();
    }

    // Cut the file mid-record
    let path = temp.path().join("events.jsonl");
    let contents = std::fs::read_to_string(&path).unwrap();
    let cut = contents.len() - 25;
    std::fs::write(&path, &contents[..cut]).unwrap();

    let err = log.read_all().await.unwrap_err();
    assert!(err.to_string().contains("malformed event record"));
}

#[tokio::test]
async fn test_tail_across_chunk_boundaries() {
    let temp = TempDir::new().unwrap();
    let mut log = EventLog::open(temp.path()).await.unwrap();

    // Records large enough that a few of them exceed the 8 KiB read chunk
    let padding = "x".repeat(3000);
    for i in 0..10 {
        let event = Event::new(EventType::StepRetried, "run-1")
            .with_step(format!("step{i}"))
            .with_reason(format!("{padding}-{i}"));
        log.append(event).await.unwrap();
    }

    let tail = log.tail(4).await.unwrap();
    assert_eq!(tail.len(), 4);
    assert_eq!(tail[0].step_id.as_deref(), Some("step6"));
    assert_eq!(tail[3].step_id.as_deref(), Some("step9"));
    assert!(tail[3].reason.as_deref().unwrap().ends_with("-9"));
}

#[tokio::test]
async fn test_concurrent_reader_sees_whole_records_only() {
    let temp = TempDir::new().unwrap();
    let mut log = EventLog::open(temp.path()).await.unwrap();

    // A second log handle over the same file, as a status command would open
    let reader = EventLog::open(temp.path()).await.unwrap();

    log.append(Event::new(EventType::RunCreated, "run-1"))
        .await
        .unwrap();
    assert_eq!(reader.read_all().await.unwrap().len(), 1);

    log.append(Event::new(EventType::RunCompleted, "run-1"))
        .await
        .unwrap();
    let events = reader.read_all().await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event_type, EventType::RunCompleted);
}
