//! Append-only event log with file-based persistence.
//!
//! One `events.jsonl` per run directory, newline-delimited JSON. The append
//! path is the durability boundary of the whole runner: a record is written
//! as a single line and flushed before `append` returns, so a successful
//! return means the event is on disk and visible to concurrent readers.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use crate::domain::Event;

/// File name of the per-run event log
pub const EVENTS_FILE: &str = "events.jsonl";

/// Append-only event log for one run
pub struct EventLog {
    /// Path to the events.jsonl file
    log_path: PathBuf,

    /// Timestamp of the last appended record, for the monotonicity clamp
    last_timestamp: Option<DateTime<Utc>>,
}

impl EventLog {
    /// Create or open the event log under a run directory.
    ///
    /// Seeds the monotonicity clamp from the last existing record so that
    /// timestamps stay non-decreasing across resumptions.
    pub async fn open(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)
            .await
            .with_context(|| format!("failed to create run directory: {}", run_dir.display()))?;

        let mut log = Self {
            log_path: run_dir.join(EVENTS_FILE),
            last_timestamp: None,
        };

        if log.log_path.exists() {
            if let Some(last) = log.tail(1).await?.last() {
                log.last_timestamp = Some(last.timestamp_utc);
            }
        }

        Ok(log)
    }

    /// Path to the events file
    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Append one event as a single flushed line.
    ///
    /// Timestamps are clamped against the previous record so the per-run
    /// sequence is non-decreasing. An I/O failure here is fatal to the run
    /// and must propagate: retrying could leave in-memory state ahead of
    /// durable truth.
    pub async fn append(&mut self, mut event: Event) -> Result<Event> {
        if let Some(last) = self.last_timestamp {
            if event.timestamp_utc < last {
                event.timestamp_utc = last;
            }
        }

        let json = serde_json::to_string(&event).context("failed to serialize event")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .with_context(|| format!("failed to open event log: {}", self.log_path.display()))?;

        file.write_all(format!("{json}\n").as_bytes())
            .await
            .context("failed to write event")?;
        file.flush().await.context("failed to flush event")?;

        self.last_timestamp = Some(event.timestamp_utc);
        Ok(event)
    }

    /// Read the full ordered sequence.
    ///
    /// Any malformed record is a fatal error carrying its line number;
    /// records are never skipped.
    pub async fn read_all(&self) -> Result<Vec<Event>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)
            .await
            .with_context(|| format!("failed to open event log: {}", self.log_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("malformed event record at line {line_no}: {line}"))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Last `n` records, read backwards from the end of the file in chunks
    /// rather than scanning the whole log.
    pub async fn tail(&self, n: usize) -> Result<Vec<Event>> {
        if n == 0 || !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.log_path)
            .await
            .with_context(|| format!("failed to open event log: {}", self.log_path.display()))?;
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(Vec::new());
        }

        const CHUNK: u64 = 8192;
        let mut buf: Vec<u8> = Vec::new();
        let mut pos = len;

        // One newline more than n guarantees n complete records even when
        // the buffer starts mid-line.
        while pos > 0 && count_newlines(&buf) <= n {
            let read_len = CHUNK.min(pos);
            pos -= read_len;
            file.seek(SeekFrom::Start(pos)).await?;
            let mut chunk = vec![0u8; read_len as usize];
            file.read_exact(&mut chunk).await?;
            chunk.extend_from_slice(&buf);
            buf = chunk;
        }

        let start = if pos == 0 {
            0
        } else {
            buf.iter()
                .position(|&b| b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(0)
        };
        let text =
            std::str::from_utf8(&buf[start..]).context("event log is not valid UTF-8")?;

        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let keep = lines.len().saturating_sub(n);

        let mut events = Vec::with_capacity(lines.len() - keep);
        for line in &lines[keep..] {
            let event: Event = serde_json::from_str(line)
                .with_context(|| format!("malformed event record: {line}"))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Open the log for iterative/follow consumption.
    ///
    /// The returned stream holds the only handle; it is released when the
    /// stream is dropped, on every exit path.
    pub async fn stream(&self) -> Result<EventStream> {
        let file = File::open(&self.log_path)
            .await
            .with_context(|| format!("failed to open event log: {}", self.log_path.display()))?;

        Ok(EventStream {
            reader: BufReader::new(file),
        })
    }
}

/// Iterative reader over a live event log
pub struct EventStream {
    reader: BufReader<File>,
}

impl EventStream {
    /// Next complete record, or `None` at the current end of the log.
    ///
    /// Calling again later picks up records appended since; the append
    /// contract (whole-line write, flush before return) means no torn
    /// record is ever observed.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .context("failed to read event stream")?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(trimmed)
                .with_context(|| format!("malformed event record: {trimmed}"))?;
            return Ok(Some(event));
        }
    }
}

fn count_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == b'\n').count()
}

/// Deterministic content hash (first 16 hex chars of SHA-256)
pub fn content_hash(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
