// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent process logging.
//!
//! Structured `tracing` output to stderr, optionally duplicated to a daily
//! rolling file under the agent's log directory. The embedding binary calls
//! [`init_telemetry`] once at startup and holds the returned guard for the
//! life of the process.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer flushing; drop on process exit.
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize process logging. The filter comes from `RUST_LOG`, defaulting
/// to `info`. Safe to call more than once; later calls are no-ops.
pub fn init_telemetry(log_dir: Option<&Path>) -> std::io::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            None
        }
    };
    Ok(TelemetryGuard { _file_guard: file_guard })
}
