// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The upload task for one remote log stream.
//!
//! Drains the session's log channel, assembles batches within the service
//! limits, and uploads them at no more than five puts per second. Upload
//! errors retry every second; once the stream is closing, retries are
//! bounded so shutdown cannot hang on a broken sink.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::batch::{BatchRejection, EventBatch};
use super::partition::{EventPartitioner, SizedEvent};
use super::{LogEntry, RemoteLogClient};

pub const MAX_PUTS_PER_SECOND: usize = 5;
const PUT_WINDOW: Duration = Duration::from_secs(1);
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);
const STOPPED_RETRY_LIMIT: usize = 5;
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Control handle for a spawned log stream task.
pub struct LogStreamHandle {
    tx: mpsc::UnboundedSender<LogEntry>,
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl LogStreamHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<LogEntry> {
        self.tx.clone()
    }

    /// Flush what remains and stop the task.
    pub async fn close(self) {
        self.stop.cancel();
        let _ = self.join.await;
    }
}

/// Spawn the upload task for one `group`/`stream` destination.
pub fn spawn_log_stream(
    client: Arc<dyn RemoteLogClient>,
    group: String,
    stream: String,
) -> LogStreamHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let task = LogStreamTask {
        client,
        group,
        stream,
        rx,
        stop: stop.clone(),
        partitioner: EventPartitioner::new(),
        recent_puts: VecDeque::new(),
    };
    LogStreamHandle { tx, stop, join: tokio::spawn(task.run()) }
}

struct LogStreamTask {
    client: Arc<dyn RemoteLogClient>,
    group: String,
    stream: String,
    rx: mpsc::UnboundedReceiver<LogEntry>,
    stop: CancellationToken,
    partitioner: EventPartitioner,
    recent_puts: VecDeque<Instant>,
}

impl LogStreamTask {
    async fn run(mut self) {
        loop {
            while let Ok(entry) = self.rx.try_recv() {
                self.partitioner.push(entry);
            }

            if !self.partitioner.has_items() {
                if self.stop.is_cancelled() {
                    // One last drain so nothing sent just before the close
                    // is lost.
                    let mut drained = false;
                    while let Ok(entry) = self.rx.try_recv() {
                        self.partitioner.push(entry);
                        drained = true;
                    }
                    if !drained {
                        return;
                    }
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = self.stop.cancelled() => {}
                }
                continue;
            }

            let batch = self.collect_batch();
            if batch.is_empty() {
                continue;
            }
            let events = batch.into_events();
            self.throttle().await;
            debug!(count = events.len(), "uploading log events");
            self.upload(&events).await;
        }
    }

    /// Fill one batch from the partitioner. A batch-full rejection returns
    /// the event for the next batch; a time-constraint rejection discards
    /// the event and queues its reason (stamped with the current time) into
    /// the stream instead.
    fn collect_batch(&mut self) -> EventBatch {
        let now_ms = Utc::now().timestamp_millis();
        let mut batch = EventBatch::new();
        while let Some(event) = self.partitioner.next() {
            match batch.try_add(event, now_ms) {
                Ok(()) => {}
                Err(BatchRejection::Full(event)) => {
                    self.partitioner.push_front(event);
                    break;
                }
                Err(BatchRejection::Dropped { reason, .. }) => {
                    warn!(group = %self.group, stream = %self.stream, %reason, "dropped log event");
                    self.partitioner.push_front(SizedEvent::from_message(now_ms, reason));
                }
            }
        }
        batch
    }

    /// Keep at most five puts within any one-second window: when the window
    /// is full, sleep until the oldest put ages out.
    async fn throttle(&mut self) {
        let now = Instant::now();
        while self
            .recent_puts
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= PUT_WINDOW)
        {
            self.recent_puts.pop_front();
        }
        if self.recent_puts.len() >= MAX_PUTS_PER_SECOND {
            if let Some(oldest) = self.recent_puts.front() {
                let wait = PUT_WINDOW.saturating_sub(now.duration_since(*oldest));
                debug!(?wait, "put rate limit reached, sleeping");
                tokio::time::sleep(wait).await;
            }
            self.recent_puts.pop_front();
        }
        self.recent_puts.push_back(Instant::now());
    }

    async fn upload(&self, events: &[LogEntry]) {
        let mut stopped_attempts = STOPPED_RETRY_LIMIT;
        loop {
            match self.client.put_log_events(&self.group, &self.stream, events).await {
                Ok(()) => return,
                Err(log_error) => {
                    if self.stop.is_cancelled() {
                        stopped_attempts -= 1;
                        if stopped_attempts == 0 {
                            error!(
                                group = %self.group,
                                stream = %self.stream,
                                "unable to upload log events before shutdown"
                            );
                            return;
                        }
                    }
                    warn!(
                        group = %self.group,
                        stream = %self.stream,
                        error = %log_error,
                        retry_in = ?ERROR_RETRY_DELAY,
                        "error uploading log events"
                    );
                    tokio::time::sleep(ERROR_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
