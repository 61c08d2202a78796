// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! farmhand-agent: the render-farm worker agent's execution core.
//!
//! The agent registers a worker identity with the dispatch service, heartbeats
//! for assigned sessions, and runs each session's actions as subprocesses
//! through an external action runner while streaming structured logs back.
//!
//! The service transport, the subprocess sandbox, and the attachment transfer
//! engine are all external collaborators reached through traits
//! ([`farmhand_api::DispatchService`], [`runner::ActionRunner`],
//! [`attachments::AttachmentEngine`], [`log_sync::RemoteLogClient`]); the
//! deployable binary lives with whichever distribution provides them.

pub mod attachments;
pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod hostmeta;
pub mod log_sync;
pub mod runner;
pub mod scheduler;
pub mod sessions;
pub mod telemetry;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::AgentConfig;
pub use scheduler::{SchedulerError, WorkerScheduler};
pub use sessions::Session;
pub use worker::{exit_code_for, Worker, WorkerError};
