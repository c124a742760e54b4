use std::collections::VecDeque;

use crate::logbuf::{LogEntry, LogLevel};

/// Context window bound for `--context N`.
pub const MAX_CONTEXT: usize = 10;

/// Noise every local dev loop produces and nobody wants to read: bundler
/// chatter, browser favicon probes, and our own health checks.
pub const BUILTIN_EXCLUDES: &[&str] = &[
    "webpack compiled",
    "webpack.Progress",
    "[vite] hmr update",
    "[vite] page reload",
    "vite v",
    "favicon.ico",
    "GET /health",
    "GET /healthz",
    "HEAD /health",
    "[HMR]",
];

/// Pure pattern/level filter over log entries. Callers compose it for
/// tailing, streaming, and context replay.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    excludes: Vec<String>,
    min_level: Option<LogLevel>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.excludes.extend(patterns);
        self
    }

    pub fn with_builtins(mut self) -> Self {
        self.excludes
            .extend(BUILTIN_EXCLUDES.iter().map(|s| s.to_string()));
        self
    }

    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    /// False if any exclusion pattern matches the raw line, or the entry's
    /// level is below the minimum.
    pub fn allow(&self, entry: &LogEntry) -> bool {
        if let Some(min) = self.min_level {
            if entry.level < min {
                return false;
            }
        }
        !self.excludes.iter().any(|p| entry.line.contains(p.as_str()))
    }
}

pub fn clamp_context(n: usize) -> usize {
    n.min(MAX_CONTEXT)
}

/// Sliding-window context replay: on a filter match, emit the preceding `n`
/// entries, the match, and the following `n` entries, then resume filtered
/// delivery.
pub struct ContextReplay {
    filter: LogFilter,
    n: usize,
    before: VecDeque<LogEntry>,
    trailing: usize,
}

impl ContextReplay {
    pub fn new(filter: LogFilter, context: usize) -> Self {
        Self {
            filter,
            n: clamp_context(context),
            before: VecDeque::new(),
            trailing: 0,
        }
    }

    /// Feed one entry; returns the entries to deliver now.
    pub fn push(&mut self, entry: LogEntry) -> Vec<LogEntry> {
        if self.filter.allow(&entry) {
            let mut out: Vec<LogEntry> = self.before.drain(..).collect();
            out.push(entry);
            self.trailing = self.n;
            return out;
        }
        if self.trailing > 0 {
            self.trailing -= 1;
            return vec![entry];
        }
        if self.n > 0 {
            self.before.push_back(entry);
            if self.before.len() > self.n {
                self.before.pop_front();
            }
        }
        Vec::new()
    }
}
