use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Ring capacity per service.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Hard cap on a single log record; longer lines are split at this boundary.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Receive buffer per subscriber; a subscriber that falls this far behind is
/// dropped from the fan-out so writers never stall.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn label(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One captured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub stream: LogStream,
    pub level: LogLevel,
    pub line: String,
    /// Set when this record is a non-final piece of a split oversized line.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continuation: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LogStats {
    pub total_appended: u64,
    pub dropped: u64,
}

/// Supervisor-global sequence counter, shared by every service's buffer.
#[derive(Debug, Default)]
pub struct SequenceSource(AtomicU64);

impl SequenceSource {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct Ring {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    total: u64,
    dropped: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogEntry>,
}

/// Bounded in-memory ring of log entries for one service, with streaming
/// fan-out to subscribers. Appends never block: full subscribers are dropped.
pub struct LogBuffer {
    service: String,
    seq: Arc<SequenceSource>,
    ring: Mutex<Ring>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_sub_id: AtomicU64,
}

pub struct LogSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<LogEntry>,
}

impl LogBuffer {
    pub fn new(service: impl Into<String>, seq: Arc<SequenceSource>) -> Self {
        Self::with_capacity(service, seq, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        service: impl Into<String>,
        seq: Arc<SequenceSource>,
        capacity: usize,
    ) -> Self {
        Self {
            service: service.into(),
            seq,
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                total: 0,
                dropped: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Append one parsed line. Assigns the next global sequence.
    pub fn append(
        &self,
        stream: LogStream,
        line: String,
        continuation: bool,
        timestamp: Option<DateTime<Utc>>,
    ) -> LogEntry {
        let entry = LogEntry {
            sequence: self.seq.next(),
            timestamp: timestamp.unwrap_or_else(Utc::now),
            service: self.service.clone(),
            stream,
            level: classify_level(&line),
            line,
            continuation,
        };
        self.push(entry.clone());
        entry
    }

    fn push(&self, entry: LogEntry) {
        {
            let mut ring = lock(&self.ring);
            if ring.entries.len() == ring.capacity {
                ring.entries.pop_front();
                ring.dropped += 1;
            }
            ring.entries.push_back(entry.clone());
            ring.total += 1;
        }
        // Fan out after releasing the ring lock; prune dead or lagging
        // subscribers in place.
        let mut subs = lock(&self.subscribers);
        subs.retain(|s| s.tx.try_send(entry.clone()).is_ok());
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let ring = lock(&self.ring);
        let skip = ring.entries.len().saturating_sub(n);
        ring.entries.iter().skip(skip).cloned().collect()
    }

    /// Every buffered entry, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let ring = lock(&self.ring);
        ring.entries.iter().cloned().collect()
    }

    pub fn stats(&self) -> LogStats {
        let ring = lock(&self.ring);
        LogStats {
            total_appended: ring.total,
            dropped: ring.dropped,
        }
    }

    /// Attach a consumer. Every entry appended after this call is delivered
    /// until the consumer lags too far or unsubscribes.
    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push(Subscriber { id, tx });
        LogSubscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        lock(&self.subscribers).retain(|s| s.id != id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Read a child's byte stream to EOF, splitting it into log records.
///
/// Lines are `\n`-delimited; anything longer than [`MAX_LINE_BYTES`] is split
/// at the boundary with the continuation flag set on the non-final pieces.
pub async fn read_into<R: AsyncRead + Unpin>(buffer: Arc<LogBuffer>, stream: LogStream, mut reader: R) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        pending.extend_from_slice(&chunk[..n]);
        drain_lines(&buffer, stream, &mut pending, false);
    }
    // Trailing bytes without a final newline still form a record.
    drain_lines(&buffer, stream, &mut pending, true);
}

fn drain_lines(buffer: &LogBuffer, stream: LogStream, pending: &mut Vec<u8>, eof: bool) {
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = &raw[..raw.len() - 1];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            emit_split(buffer, stream, line);
            continue;
        }
        // No newline yet: keep at most one cap-sized piece buffered.
        if pending.len() > MAX_LINE_BYTES {
            let head: Vec<u8> = pending.drain(..MAX_LINE_BYTES).collect();
            append_lossy(buffer, stream, &head, true);
            continue;
        }
        if eof && !pending.is_empty() {
            let rest = std::mem::take(pending);
            emit_split(buffer, stream, &rest);
        }
        break;
    }
}

fn emit_split(buffer: &LogBuffer, stream: LogStream, line: &[u8]) {
    if line.len() <= MAX_LINE_BYTES {
        append_lossy(buffer, stream, line, false);
        return;
    }
    let mut rest = line;
    while rest.len() > MAX_LINE_BYTES {
        let (head, tail) = rest.split_at(MAX_LINE_BYTES);
        append_lossy(buffer, stream, head, true);
        rest = tail;
    }
    append_lossy(buffer, stream, rest, false);
}

fn append_lossy(buffer: &LogBuffer, stream: LogStream, bytes: &[u8], continuation: bool) {
    let text = String::from_utf8_lossy(bytes).into_owned();
    let ts = parse_frame_timestamp(&text);
    buffer.append(stream, text, continuation, ts);
}

/// Best-effort level classification from explicit line prefixes.
pub fn classify_level(line: &str) -> LogLevel {
    let rest = strip_frame(line).trim_start();
    let upper: String = rest.chars().take(16).collect::<String>().to_ascii_uppercase();
    if upper.starts_with("[ERROR]")
        || upper.starts_with("ERR ")
        || upper.starts_with("ERROR:")
        || upper.starts_with("ERROR ")
    {
        LogLevel::Error
    } else if upper.starts_with("[WARN]")
        || upper.starts_with("[WARNING]")
        || upper.starts_with("WARNING")
        || upper.starts_with("WARN:")
    {
        LogLevel::Warn
    } else if upper.starts_with("[DEBUG]") || upper.starts_with("DEBUG:") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// A `[YYYY-MM-DD HH:MM:SS.mmm]` frame at the start of a line overrides the
/// capture time.
pub fn parse_frame_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let rest = line.strip_prefix('[')?;
    let end = rest.find(']')?;
    let stamp = &rest[..end];
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%.3f").ok()?;
    Some(naive.and_utc())
}

/// Strip a leading timestamp frame, if present, for classification.
fn strip_frame(line: &str) -> &str {
    if parse_frame_timestamp(line).is_some() {
        if let Some(rest) = line.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                return &rest[end + 1..];
            }
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize) -> LogBuffer {
        LogBuffer::with_capacity("api", Arc::new(SequenceSource::default()), capacity)
    }

    #[test]
    fn test_tail_returns_last_entries_in_order() {
        let buf = buffer(8);
        for i in 0..5 {
            buf.append(LogStream::Stdout, format!("line {i}"), false, None);
        }
        let tail = buf.tail(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].line, "line 2");
        assert_eq!(tail[2].line, "line 4");
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let buf = buffer(128);
        for _ in 0..50 {
            buf.append(LogStream::Stdout, "x".into(), false, None);
        }
        let all = buf.snapshot();
        for pair in all.windows(2) {
            assert!(pair[1].sequence > pair[0].sequence);
        }
    }

    #[test]
    fn test_global_sequence_shared_across_buffers() {
        let seq = Arc::new(SequenceSource::default());
        let a = LogBuffer::new("a", seq.clone());
        let b = LogBuffer::new("b", seq);
        let e1 = a.append(LogStream::Stdout, "1".into(), false, None);
        let e2 = b.append(LogStream::Stdout, "2".into(), false, None);
        let e3 = a.append(LogStream::Stdout, "3".into(), false, None);
        assert!(e2.sequence > e1.sequence);
        assert!(e3.sequence > e2.sequence);
    }

    #[test]
    fn test_ring_drops_oldest_and_counts() {
        let buf = buffer(4);
        for i in 0..10 {
            buf.append(LogStream::Stdout, format!("line {i}"), false, None);
        }
        let stats = buf.stats();
        assert_eq!(stats.total_appended, 10);
        assert_eq!(stats.dropped, 6);
        let tail = buf.tail(100);
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0].line, "line 6");
    }

    #[tokio::test]
    async fn test_subscribers_receive_appends() {
        let buf = buffer(8);
        let mut sub = buf.subscribe();
        buf.append(LogStream::Stderr, "hello".into(), false, None);
        let got = sub.rx.recv().await.unwrap();
        assert_eq!(got.line, "hello");
        assert_eq!(got.stream, LogStream::Stderr);
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_writer_unblocked() {
        let buf = buffer(2048);
        let sub = buf.subscribe();
        // Never read from `sub` — overflow its channel.
        for i in 0..(SUBSCRIBER_BUFFER + 16) {
            buf.append(LogStream::Stdout, format!("{i}"), false, None);
        }
        assert_eq!(
            buf.stats().total_appended,
            (SUBSCRIBER_BUFFER + 16) as u64
        );
        drop(sub);
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches() {
        let buf = buffer(8);
        let sub = buf.subscribe();
        buf.unsubscribe(sub.id);
        buf.append(LogStream::Stdout, "after".into(), false, None);
        let mut rx = sub.rx;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_into_splits_lines() {
        let buf = Arc::new(buffer(16));
        let data = b"one\ntwo\r\nthree".to_vec();
        read_into(buf.clone(), LogStream::Stdout, std::io::Cursor::new(data)).await;
        let lines: Vec<String> = buf.snapshot().iter().map(|e| e.line.clone()).collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_oversized_line_split_with_continuation() {
        let buf = Arc::new(buffer(16));
        let mut data = vec![b'a'; MAX_LINE_BYTES + 10];
        data.push(b'\n');
        read_into(buf.clone(), LogStream::Stdout, std::io::Cursor::new(data)).await;
        let all = buf.snapshot();
        assert_eq!(all.len(), 2);
        assert!(all[0].continuation);
        assert_eq!(all[0].line.len(), MAX_LINE_BYTES);
        assert!(!all[1].continuation);
        assert_eq!(all[1].line.len(), 10);
        assert!(all.iter().all(|e| e.line.len() <= MAX_LINE_BYTES));
    }

    #[test]
    fn test_classify_levels() {
        assert_eq!(classify_level("[ERROR] boom"), LogLevel::Error);
        assert_eq!(classify_level("error: bad thing"), LogLevel::Error);
        assert_eq!(classify_level("ERR connection refused"), LogLevel::Error);
        assert_eq!(classify_level("[WARN] slow"), LogLevel::Warn);
        assert_eq!(classify_level("WARNING: deprecated"), LogLevel::Warn);
        assert_eq!(classify_level("[DEBUG] verbose"), LogLevel::Debug);
        assert_eq!(classify_level("listening on :3000"), LogLevel::Info);
    }

    #[test]
    fn test_classify_after_timestamp_frame() {
        assert_eq!(
            classify_level("[2024-03-01 10:00:00.123] [ERROR] boom"),
            LogLevel::Error
        );
    }

    #[test]
    fn test_frame_timestamp_overrides_capture_time() {
        let ts = parse_frame_timestamp("[2024-03-01 10:00:00.123] hello").unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 123);
        assert!(parse_frame_timestamp("no frame here").is_none());
        assert!(parse_frame_timestamp("[not a date] hello").is_none());
    }

    #[test]
    fn test_level_ordering_for_filters() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert!(LogLevel::Info > LogLevel::Debug);
    }
}
