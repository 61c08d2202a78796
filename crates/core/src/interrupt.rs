// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interruptible waits.
//!
//! Retry loops, the credential refresher, and the scheduler's heartbeat sleep
//! all need to block for a bounded time while remaining responsive to an
//! external stop signal. `Interrupt` wraps a [`CancellationToken`] and makes
//! the two wakeup causes distinct so callers can tell a timeout apart from a
//! shutdown.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why an interruptible wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full timeout elapsed without the interrupt firing.
    Elapsed,
    /// The interrupt fired before the timeout elapsed.
    Interrupted,
}

/// A cloneable interrupt signal with interruptible sleeps.
///
/// Setting the interrupt is sticky and idempotent. Clones observe the same
/// underlying signal.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self { token: CancellationToken::new() }
    }

    /// Fire the interrupt. All current and future waits observe it.
    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep for `timeout`, returning early if the interrupt fires.
    pub async fn wait_for(&self, timeout: Duration) -> WaitOutcome {
        tokio::select! {
            _ = self.token.cancelled() => WaitOutcome::Interrupted,
            _ = tokio::time::sleep(timeout) => WaitOutcome::Elapsed,
        }
    }

    /// Wait until the interrupt fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The underlying token, for integrating with `tokio::select!` callers.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl From<CancellationToken> for Interrupt {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[cfg(test)]
#[path = "interrupt_tests.rs"]
mod tests;
