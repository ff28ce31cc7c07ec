//! Bounded stderr tail for local workers.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Maximum lines retained.
pub const MAX_LINES: usize = 50;
/// Maximum characters per line.
pub const MAX_LINE_CHARS: usize = 1000;

/// Append-only ring of the last [`MAX_LINES`] stderr lines, each
/// truncated to [`MAX_LINE_CHARS`] characters.
#[derive(Default)]
pub struct StderrTail {
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    /// Create an empty tail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line, truncating and evicting as needed.
    pub fn push(&self, line: &str) {
        let truncated: String = line.chars().take(MAX_LINE_CHARS).collect();
        let mut lines = self.lines.lock();
        if lines.len() == MAX_LINES {
            let _ = lines.pop_front();
        }
        lines.push_back(truncated);
    }

    /// Snapshot of the retained lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// The last `n` lines joined with newlines.
    #[must_use]
    pub fn last_joined(&self, n: usize) -> String {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Case-insensitive substring search over the retained lines.
    #[must_use]
    pub fn contains_any(&self, needles: &[&str]) -> bool {
        let lines = self.lines.lock();
        lines.iter().any(|line| {
            let lower = line.to_lowercase();
            needles.iter().any(|needle| lower.contains(needle))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_at_most_fifty_lines() {
        let tail = StderrTail::new();
        for i in 0..60 {
            tail.push(&format!("line {i}"));
        }
        let snap = tail.snapshot();
        assert_eq!(snap.len(), MAX_LINES);
        assert_eq!(snap[0], "line 10");
        assert_eq!(snap[49], "line 59");
    }

    #[test]
    fn truncates_long_lines() {
        let tail = StderrTail::new();
        tail.push(&"x".repeat(5000));
        assert_eq!(tail.snapshot()[0].chars().count(), MAX_LINE_CHARS);
    }

    #[test]
    fn last_joined_takes_suffix() {
        let tail = StderrTail::new();
        for i in 0..10 {
            tail.push(&format!("l{i}"));
        }
        assert_eq!(tail.last_joined(3), "l7\nl8\nl9");
        assert_eq!(tail.last_joined(100).lines().count(), 10);
    }

    #[test]
    fn contains_any_is_case_insensitive() {
        let tail = StderrTail::new();
        tail.push("npm ERR! code E404");
        assert!(tail.contains_any(&["e404"]));
        assert!(tail.contains_any(&["not found", "e404"]));
        assert!(!tail.contains_any(&["enoent"]));
    }

    #[test]
    fn empty_tail() {
        let tail = StderrTail::new();
        assert!(tail.snapshot().is_empty());
        assert_eq!(tail.last_joined(5), "");
        assert!(!tail.contains_any(&["anything"]));
    }
}
