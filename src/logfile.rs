use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::logbuf::{LogBuffer, LogEntry, LogLevel, LogStream};

pub fn logs_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".azure").join("logs")
}

pub fn log_path(project_dir: &Path, service: &str) -> PathBuf {
    logs_dir(project_dir).join(format!("{service}.log"))
}

/// Render one entry in the on-disk framing:
/// `[YYYY-MM-DD HH:MM:SS.mmm] [LEVEL] [STREAM] message`.
pub fn format_line(entry: &LogEntry) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        entry.level.label().to_ascii_uppercase(),
        entry.stream.label(),
        entry.line
    )
}

/// Spawn the asynchronous writer task for one service: subscribes to its
/// buffer and appends every entry to `.azure/logs/<service>.log` until the
/// token is cancelled or the buffer closes.
pub fn spawn_writer(
    project_dir: &Path,
    buffer: Arc<LogBuffer>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let path = log_path(project_dir, buffer.service());
    let mut sub = buffer.subscribe();
    tokio::spawn(async move {
        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                tracing::warn!("cannot create {}: {e}", dir.display());
                return;
            }
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("cannot open {}: {e}", path.display());
                return;
            }
        };

        loop {
            tokio::select! {
                entry = sub.rx.recv() => {
                    let Some(entry) = entry else { break };
                    let line = format!("{}\n", format_line(&entry));
                    if file.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        let _ = file.flush().await;
    })
}

/// Parse one framed log-file line back into an entry. `sequence` is assigned
/// by the caller (file order), since the on-disk format does not carry it.
pub fn parse_line(service: &str, sequence: u64, line: &str) -> Option<LogEntry> {
    let (stamp, rest) = take_bracket(line)?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%.3f")
        .ok()?
        .and_utc();
    let (level, rest) = take_bracket(rest)?;
    let level = LogLevel::parse(level)?;
    let (stream, rest) = take_bracket(rest)?;
    let stream = match stream {
        "stdout" => LogStream::Stdout,
        "stderr" => LogStream::Stderr,
        _ => return None,
    };
    Some(LogEntry {
        sequence,
        timestamp,
        service: service.to_string(),
        stream,
        level,
        line: rest.strip_prefix(' ').unwrap_or(rest).to_string(),
        continuation: false,
    })
}

fn take_bracket(s: &str) -> Option<(&str, &str)> {
    let rest = s.trim_start().strip_prefix('[')?;
    let end = rest.find(']')?;
    Some((&rest[..end], &rest[end + 1..]))
}

/// Read a whole log file back as entries, in file order.
pub fn read_log_file(path: &Path, service: &str) -> Result<Vec<LogEntry>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(content
        .lines()
        .enumerate()
        .filter_map(|(i, l)| parse_line(service, i as u64 + 1, l))
        .collect())
}
