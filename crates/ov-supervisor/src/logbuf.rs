//! Bounded in-memory log ring

use std::collections::VecDeque;

#[derive(Debug)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: bool,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: false,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            self.dropped = true;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped = true;
        }
        self.lines.push_back(line);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the ring alone can answer a request for `max_lines` lines.
    pub fn covers(&self, max_lines: usize) -> bool {
        !self.dropped || self.lines.len() >= max_lines
    }

    /// Newest `max_lines` lines joined with newlines, oldest first.
    pub fn tail(&self, max_lines: usize) -> Option<String> {
        if self.lines.is_empty() || max_lines == 0 {
            return None;
        }
        let skip = self.lines.len().saturating_sub(max_lines);
        let lines: Vec<&str> = self.lines.iter().skip(skip).map(String::as_str).collect();
        Some(lines.join("\n"))
    }
}
