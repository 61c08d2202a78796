// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batch assembly under the remote log service's PutLogEvents limits.

use super::partition::SizedEvent;
use super::LogEntry;

pub const MAX_EVENTS_PER_BATCH: usize = 10_000;
pub const MAX_BATCH_BYTES: usize = 1_048_576;
/// Fixed per-event overhead the service charges against the batch size.
pub const EVENT_PADDING_BYTES: usize = 26;

const HOUR_MS: i64 = 3_600_000;
/// Events more than 2 hours in the future are rejected by the service.
pub const MAX_FUTURE_DRIFT_MS: i64 = 2 * HOUR_MS;
/// Events older than 24 hours are not worth uploading; the shortest log
/// retention the service offers is one day.
pub const MAX_PAST_DRIFT_MS: i64 = 24 * HOUR_MS;
/// All events in one batch must span at most 24 hours.
pub const MAX_BATCH_SPAN_MS: i64 = 24 * HOUR_MS;

/// Why an event could not be added to the batch.
#[derive(Debug)]
pub enum BatchRejection {
    /// The batch is full; keep the event for the next batch.
    Full(SizedEvent),
    /// The event violates a time constraint and is discarded; `reason`
    /// should be surfaced in the stream.
    Dropped { event: SizedEvent, reason: String },
}

#[derive(Debug, Default)]
pub struct EventBatch {
    events: Vec<SizedEvent>,
    size: usize,
    min_timestamp_ms: Option<i64>,
    max_timestamp_ms: Option<i64>,
}

impl EventBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total size as the service accounts it: payload bytes plus the fixed
    /// per-event padding.
    pub fn byte_size(&self) -> usize {
        self.size
    }

    pub fn try_add(&mut self, event: SizedEvent, now_ms: i64) -> Result<(), BatchRejection> {
        if self.events.len() + 1 > MAX_EVENTS_PER_BATCH {
            return Err(BatchRejection::Full(event));
        }
        if self.size + event.size + EVENT_PADDING_BYTES > MAX_BATCH_BYTES {
            return Err(BatchRejection::Full(event));
        }

        let timestamp = event.entry.timestamp_ms;
        if timestamp > now_ms + MAX_FUTURE_DRIFT_MS {
            let reason = format!(
                "Ignoring log event that is too far in the future (max {}s): {}",
                MAX_FUTURE_DRIFT_MS / 1000,
                preview(&event.entry)
            );
            return Err(BatchRejection::Dropped { event, reason });
        }
        if timestamp < now_ms - MAX_PAST_DRIFT_MS {
            let reason = format!(
                "Ignoring log event that is older than 1 day: {}",
                preview(&event.entry)
            );
            return Err(BatchRejection::Dropped { event, reason });
        }
        let min = self.min_timestamp_ms.unwrap_or(timestamp).min(timestamp);
        let max = self.max_timestamp_ms.unwrap_or(timestamp).max(timestamp);
        if max - min > MAX_BATCH_SPAN_MS {
            let reason = format!(
                "Ignoring log event that would exceed the max allowed time span in a batch of {}s: {}",
                MAX_BATCH_SPAN_MS / 1000,
                preview(&event.entry)
            );
            return Err(BatchRejection::Dropped { event, reason });
        }

        self.min_timestamp_ms = Some(min);
        self.max_timestamp_ms = Some(max);
        self.size += event.size + EVENT_PADDING_BYTES;
        self.events.push(event);
        Ok(())
    }

    /// The batch's events in chronological order. The sort is stable, so
    /// events with equal timestamps keep their arrival order.
    pub fn into_events(self) -> Vec<LogEntry> {
        let mut events: Vec<LogEntry> =
            self.events.into_iter().map(|event| event.entry).collect();
        events.sort_by_key(|entry| entry.timestamp_ms);
        events
    }
}

fn preview(entry: &LogEntry) -> String {
    let truncated: String = entry.message.chars().take(100).collect();
    format!("[{}] {truncated} (truncated)", entry.timestamp_ms)
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;
