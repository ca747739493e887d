//! Bounded per-stack log history.

use crate::lock;
use lab_proto::LogLine;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default number of lines kept per stack.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Fixed-capacity ring buffer of recent log lines; the oldest line is
/// evicted first.
///
/// Fed independently of hub delivery so a client that reconnects can fetch
/// what it missed.
#[derive(Debug)]
pub struct LogHistory {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: LogLine) {
        let mut lines = lock(&self.lines);
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The most recent `limit` lines (all when `None`), oldest first.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<LogLine> {
        let lines = lock(&self.lines);
        let skip = limit.map_or(0, |n| lines.len().saturating_sub(n));
        lines.iter().skip(skip).cloned().collect()
    }

    /// The most recent `limit` lines of one service, oldest first.
    pub fn for_service(&self, service: &str, limit: Option<usize>) -> Vec<LogLine> {
        let lines = lock(&self.lines);
        let mut matched: Vec<LogLine> = lines
            .iter()
            .rev()
            .filter(|l| l.service == service)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.lines).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        lock(&self.lines).clear();
    }
}

impl Default for LogHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
