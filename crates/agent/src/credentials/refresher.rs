// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background credential refresh for the lifetime of a scope.
//!
//! [`CredentialsRefresher::enter`] returns a guard; the refresh task starts
//! on the first enter and stops when the last guard drops, so the refresher
//! can be shared by any number of concurrent users of the same credentials.
//!
//! Refresh is scheduled against two thresholds borrowed from SDK credential
//! providers: once the remaining lifetime drops below the advisory
//! threshold, refresh retries every minute; if a refresh completes and the
//! remaining lifetime is still below the mandatory threshold, the failure
//! callback fires and refreshing stops. The owner is expected to drain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmhand_api::RequestError;
use farmhand_core::{Interrupt, WaitOutcome};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

const MIN_ADVISORY_REFRESH: Duration = Duration::from_secs(15 * 60);
const MIN_MANDATORY_REFRESH: Duration = Duration::from_secs(10 * 60);
const THRESHOLD_GAP: Duration = Duration::from_secs(5 * 60);
const ADVISORY_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Credentials the refresher can renew.
#[async_trait]
pub trait RefreshableCredentials: Send + Sync + 'static {
    fn expiry(&self) -> DateTime<Utc>;
    async fn refresh(&self) -> Result<(), RequestError>;
}

/// Why the refresher gave up (or is struggling).
#[derive(Debug)]
pub enum RefreshFailure {
    /// A refresh attempt failed. Refreshing continues only for conditionally
    /// recoverable errors.
    Error(RequestError),
    /// The credentials will expire (or have expired) inside the mandatory
    /// threshold and could not be renewed. Refreshing has stopped.
    Expiring { expiry: DateTime<Utc> },
}

pub type FailureCallback = Arc<dyn Fn(RefreshFailure) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub advisory: Duration,
    pub mandatory: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self { advisory: MIN_ADVISORY_REFRESH, mandatory: MIN_MANDATORY_REFRESH }
    }
}

#[derive(Debug, Error)]
pub enum RefresherConfigError {
    #[error("advisory refresh threshold must be at least 15 minutes")]
    AdvisoryTooSmall,
    #[error("mandatory refresh threshold must be at least 10 minutes")]
    MandatoryTooSmall,
    #[error("advisory threshold must exceed the mandatory threshold by at least 5 minutes")]
    ThresholdsTooClose,
}

impl RefresherConfig {
    fn validate(&self) -> Result<(), RefresherConfigError> {
        if self.advisory < MIN_ADVISORY_REFRESH {
            return Err(RefresherConfigError::AdvisoryTooSmall);
        }
        if self.mandatory < MIN_MANDATORY_REFRESH {
            return Err(RefresherConfigError::MandatoryTooSmall);
        }
        if self.mandatory + THRESHOLD_GAP > self.advisory {
            return Err(RefresherConfigError::ThresholdsTooClose);
        }
        Ok(())
    }
}

struct RefresherEntries {
    count: usize,
    interrupt: Interrupt,
}

struct RefresherShared<S> {
    identifier: String,
    source: Arc<S>,
    config: RefresherConfig,
    callback: FailureCallback,
    entries: Mutex<RefresherEntries>,
}

/// Re-entrant refresh scope for one credential source.
pub struct CredentialsRefresher<S: RefreshableCredentials> {
    shared: Arc<RefresherShared<S>>,
}

impl<S: RefreshableCredentials> CredentialsRefresher<S> {
    pub fn new(
        identifier: impl Into<String>,
        source: Arc<S>,
        callback: FailureCallback,
        config: RefresherConfig,
    ) -> Result<Self, RefresherConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(RefresherShared {
                identifier: identifier.into(),
                source,
                config,
                callback,
                entries: Mutex::new(RefresherEntries { count: 0, interrupt: Interrupt::new() }),
            }),
        })
    }

    /// Enter the refresh scope. The background task runs while at least one
    /// guard is alive.
    pub fn enter(&self) -> RefresherGuard<S> {
        let mut entries = self.shared.entries.lock();
        entries.count += 1;
        if entries.count == 1 {
            let interrupt = Interrupt::new();
            entries.interrupt = interrupt.clone();
            let shared = Arc::clone(&self.shared);
            tokio::spawn(refresh_loop(shared, interrupt));
        }
        RefresherGuard { shared: Arc::clone(&self.shared) }
    }
}

pub struct RefresherGuard<S: RefreshableCredentials> {
    shared: Arc<RefresherShared<S>>,
}

impl<S: RefreshableCredentials> Drop for RefresherGuard<S> {
    fn drop(&mut self) {
        let mut entries = self.shared.entries.lock();
        entries.count = entries.count.saturating_sub(1);
        if entries.count == 0 {
            entries.interrupt.set();
        }
    }
}

async fn refresh_loop<S: RefreshableCredentials>(shared: Arc<RefresherShared<S>>, interrupt: Interrupt) {
    loop {
        let now = Utc::now();
        let remaining = (shared.source.expiry() - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let delay = if remaining > shared.config.advisory {
            remaining - shared.config.advisory
        } else {
            ADVISORY_RETRY_INTERVAL
        };
        info!(
            identifier = %shared.identifier,
            delay_secs = delay.as_secs(),
            "credential refresh scheduled"
        );

        if interrupt.wait_for(delay).await == WaitOutcome::Interrupted {
            return;
        }

        match shared.source.refresh().await {
            Ok(()) => {}
            Err(RequestError::Interrupted) => return,
            Err(error @ (RequestError::ConditionallyRecoverable(_) | RequestError::WorkerOffline(_))) => {
                // The owner decides whether to stop us; keep retrying.
                warn!(identifier = %shared.identifier, %error, "credential refresh failed, will retry");
                (shared.callback)(RefreshFailure::Error(error));
            }
            Err(error) => {
                warn!(identifier = %shared.identifier, %error, "credential refresh failed fatally");
                (shared.callback)(RefreshFailure::Error(error));
                return;
            }
        }

        let remaining = shared.source.expiry() - Utc::now();
        if remaining
            .to_std()
            .unwrap_or(Duration::ZERO)
            < shared.config.mandatory
        {
            (shared.callback)(RefreshFailure::Expiring { expiry: shared.source.expiry() });
            return;
        }
    }
}

#[cfg(test)]
#[path = "refresher_tests.rs"]
mod tests;
