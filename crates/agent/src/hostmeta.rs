// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host-metadata shutdown monitoring.
//!
//! Polls an IMDSv2-style endpoint once a second for spot interruptions and
//! auto-scaling lifecycle transitions, and turns either into a drain request
//! with the appropriate grace time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmhand_core::{Interrupt, WaitOutcome};
use serde::Deserialize;
use tracing::{error, info};

pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Grace granted for an auto-scaling lifecycle termination.
pub const ASG_LIFECYCLE_GRACE: Duration = Duration::from_secs(2 * 60);
const TOKEN_TTL_SECONDS: &str = "10";
const ASG_TERMINATED: &str = "Terminated";

/// A pending host termination the worker should drain for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerShutdown {
    pub grace: Duration,
    pub fail_message: String,
}

/// The spot `instance-action` document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpotInstanceAction {
    pub action: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// Token-authenticated host metadata endpoint.
#[async_trait]
pub trait HostMetadataClient: Send + Sync {
    /// Obtain a short-lived token; `None` when the endpoint is unreachable
    /// (not running on a managed host, or the service is disabled).
    async fn fetch_token(&self) -> Option<String>;

    async fn spot_instance_action(&self, token: &str) -> Option<SpotInstanceAction>;

    async fn autoscaling_lifecycle_state(&self, token: &str) -> Option<String>;
}

/// IMDSv2 over HTTP.
pub struct ImdsClient {
    http: reqwest::Client,
    base_url: String,
}

impl ImdsClient {
    pub fn new() -> Self {
        Self::with_base_url("http://169.254.169.254".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
            base_url,
        }
    }
}

impl Default for ImdsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostMetadataClient for ImdsClient {
    async fn fetch_token(&self) -> Option<String> {
        let response = self
            .http
            .put(format!("{}/latest/api/token", self.base_url))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }

    async fn spot_instance_action(&self, token: &str) -> Option<SpotInstanceAction> {
        let response = self
            .http
            .get(format!("{}/latest/meta-data/spot/instance-action", self.base_url))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    async fn autoscaling_lifecycle_state(&self, token: &str) -> Option<String> {
        let response = self
            .http
            .get(format!("{}/latest/meta-data/autoscaling/target-lifecycle-state", self.base_url))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}

/// Polls the metadata endpoint until a shutdown is imminent, the endpoint
/// disappears, or the stop signal fires.
pub struct ShutdownMonitor {
    client: std::sync::Arc<dyn HostMetadataClient>,
    stop: Interrupt,
}

impl ShutdownMonitor {
    pub fn new(client: std::sync::Arc<dyn HostMetadataClient>, stop: Interrupt) -> Self {
        Self { client, stop }
    }

    /// Returns `Some` when the host is about to terminate; `None` when
    /// monitoring ended without a termination (stopped, or no metadata
    /// endpoint).
    pub async fn run(&self) -> Option<WorkerShutdown> {
        while self.stop.wait_for(MONITOR_POLL_INTERVAL).await == WaitOutcome::Elapsed {
            let Some(token) = self.client.fetch_token().await else {
                info!("host metadata endpoint unavailable; cannot monitor for termination");
                return None;
            };

            if let Some(spot) = self.client.spot_instance_action(&token).await {
                if matches!(spot.action.as_str(), "stop" | "terminate") {
                    match spot.time {
                        Some(time) => {
                            let grace = (time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                            if grace > Duration::ZERO {
                                info!(action = %spot.action, ?grace, "spot interruption detected");
                                return Some(WorkerShutdown {
                                    grace,
                                    fail_message: "The worker received an EC2 spot interruption"
                                        .to_string(),
                                });
                            }
                            error!(action = %spot.action, "spot interruption time is in the past");
                        }
                        None => {
                            error!("spot instance-action response is missing its time");
                        }
                    }
                }
            }

            if self.client.autoscaling_lifecycle_state(&token).await.as_deref()
                == Some(ASG_TERMINATED)
            {
                info!(grace = ?ASG_LIFECYCLE_GRACE, "auto-scaling lifecycle termination detected");
                return Some(WorkerShutdown {
                    grace: ASG_LIFECYCLE_GRACE,
                    fail_message: "The worker received an auto-scaling life-cycle change event"
                        .to_string(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "hostmeta_tests.rs"]
mod tests;
