// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Splitting oversized log events on UTF-8 code-point boundaries.

use std::collections::VecDeque;

use super::LogEntry;

/// Maximum bytes per remote log event.
pub const MAX_EVENT_BYTES: usize = 256 * 1000;

/// A log event with its UTF-8 byte size precomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedEvent {
    pub entry: LogEntry,
    pub size: usize,
}

impl SizedEvent {
    pub fn from_message(timestamp_ms: i64, message: String) -> Self {
        let size = message.len();
        Self { entry: LogEntry { timestamp_ms, message }, size }
    }
}

/// Split a message into chunks of at most `size` bytes, never slicing
/// through a multibyte sequence: the cut position backtracks from the byte
/// cap to the nearest code-point boundary. Grapheme clusters are not
/// preserved, matching how log shippers split oversized lines.
pub fn chunk_message(message: &str, size: usize) -> Vec<&str> {
    debug_assert!(size >= 4, "chunk size must fit any UTF-8 code point");
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < message.len() {
        let mut end = (start + size).min(message.len());
        while end > start && !message.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // Unreachable for size >= 4; bail rather than loop forever.
            break;
        }
        chunks.push(&message[start..end]);
        start = end;
    }
    chunks
}

/// Turns raw log entries into upload-ready events that each fit the
/// per-event size cap. Chunks produced from one raw entry share its
/// timestamp and keep their order.
#[derive(Debug, Default)]
pub struct EventPartitioner {
    raw: VecDeque<LogEntry>,
    ready: VecDeque<SizedEvent>,
}

impl EventPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.raw.push_back(entry);
    }

    /// Return an event to the head of the queue (batch-full backpressure).
    pub fn push_front(&mut self, event: SizedEvent) {
        self.ready.push_front(event);
    }

    pub fn has_items(&self) -> bool {
        !self.ready.is_empty() || !self.raw.is_empty()
    }

    pub fn next(&mut self) -> Option<SizedEvent> {
        if let Some(event) = self.ready.pop_front() {
            return Some(event);
        }
        let entry = self.raw.pop_front()?;
        for chunk in chunk_message(&entry.message, MAX_EVENT_BYTES) {
            self.ready.push_back(SizedEvent {
                entry: LogEntry { timestamp_ms: entry.timestamp_ms, message: chunk.to_string() },
                size: chunk.len(),
            });
        }
        self.ready.pop_front()
    }
}

#[cfg(test)]
#[path = "partition_tests.rs"]
mod tests;
