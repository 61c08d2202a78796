// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log synchronization to the remote log service.
//!
//! Session logs are written to a local file and queued for upload to a
//! CloudWatch-style log stream. The upload path chunks oversized events on
//! UTF-8 boundaries, assembles batches within the service's limits, and
//! throttles puts to the per-stream rate cap.

pub mod batch;
pub mod config;
pub mod partition;
pub mod stream;

use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

pub use config::{worker_log_target, LogProvisioningError, SessionLogConfig};
pub use stream::{spawn_log_stream, LogStreamHandle};

/// One log event bound for the remote stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("remote log error: {0}")]
pub struct RemoteLogError(String);

impl RemoteLogError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The remote log service; implementations perform one PutLogEvents call.
#[async_trait]
pub trait RemoteLogClient: Send + Sync {
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEntry],
    ) -> Result<(), RemoteLogError>;
}

/// A session's log destination: local file plus the remote stream queue.
#[derive(Clone)]
pub struct SessionLogger {
    tx: mpsc::UnboundedSender<LogEntry>,
    local: Option<Arc<Mutex<File>>>,
}

impl SessionLogger {
    pub fn new(tx: mpsc::UnboundedSender<LogEntry>, local: Option<File>) -> Self {
        Self { tx, local: local.map(|file| Arc::new(Mutex::new(file))) }
    }

    /// Append one line to the local log and queue it for upload. Blank lines
    /// are padded to a single space; the remote service requires a minimum
    /// event length of one.
    pub fn log(&self, message: &str) {
        let message = if message.is_empty() { " " } else { message };
        if let Some(file) = &self.local {
            let _ = writeln!(file.lock(), "{message}");
        }
        let _ = self.tx.send(LogEntry {
            timestamp_ms: Utc::now().timestamp_millis(),
            message: message.to_string(),
        });
    }
}
