// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The pending action-update map.
//!
//! This is the single data structure shared between the scheduler loop and
//! the sessions' callback paths, and its mutex is the scheduler-owned
//! "update lock" that must always be taken before any session's state lock.
//! Updates are coalesced per action id (latest wins), except that a stored
//! terminal status is never overwritten by a later non-terminal one.
//!
//! Sending updates is transactional: [`ActionUpdates::snapshot`] captures the
//! wire form plus a commit identity `(action_id, terminal_status_or_
//! update_time)` per entry, and [`ActionUpdates::commit`] removes only the
//! entries whose identity still matches. An update written while the request
//! was in flight survives for the next heartbeat.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use farmhand_api::models::{CompletedStatus, UpdatedActionInfo, UPDATE_SCHEDULE_MAX_MESSAGE_CHARS};
use farmhand_api::SessionActionSpec;
use farmhand_core::ActionId;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::runner::ActionStatus;

/// One action's accumulated status between heartbeats.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionActionStatus {
    pub id: ActionId,
    pub status: Option<ActionStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub completed_status: Option<CompletedStatus>,
}

impl SessionActionStatus {
    /// A non-terminal progress record.
    pub fn progress(id: ActionId, status: ActionStatus, start_time: Option<DateTime<Utc>>, update_time: DateTime<Utc>) -> Self {
        Self {
            id,
            status: Some(status),
            start_time,
            end_time: None,
            update_time: Some(update_time),
            completed_status: None,
        }
    }
    /// A terminal FAILED/NEVER_ATTEMPTED/etc. record with both timestamps set.
    pub fn terminal(
        id: ActionId,
        completed_status: CompletedStatus,
        message: Option<String>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            status: Some(ActionStatus {
                state: crate::runner::ActionState::Failed,
                fail_message: message,
                ..ActionStatus::default()
            }),
            start_time,
            end_time,
            update_time: None,
            completed_status: Some(completed_status),
        }
    }

    fn stamp(&self) -> CommitStamp {
        match self.completed_status {
            Some(status) => CommitStamp::Completed(status),
            None => CommitStamp::Updated(self.update_time),
        }
    }

    /// The wire form carried in the next UpdateWorkerSchedule request.
    pub fn to_wire(&self) -> UpdatedActionInfo {
        let mut info = UpdatedActionInfo {
            started_at: self.start_time,
            ended_at: self.end_time,
            completed_status: self.completed_status,
            ..UpdatedActionInfo::default()
        };
        if self.completed_status.is_none() {
            info.updated_at = self.update_time;
        }
        if let Some(status) = &self.status {
            info.process_exit_code = status.exit_code;
            let message = if self.completed_status.is_some() {
                status.fail_message.as_ref().or(status.status_message.as_ref())
            } else {
                status.status_message.as_ref()
            };
            info.progress_message = message.map(|message| truncate_chars(message, UPDATE_SCHEDULE_MAX_MESSAGE_CHARS));
            info.progress_percent = status.progress.map(|progress| progress.clamp(0.0, 100.0));
        }
        info
    }
}

fn truncate_chars(message: &str, limit: usize) -> String {
    if message.chars().count() <= limit {
        message.to_string()
    } else {
        message.chars().take(limit).collect()
    }
}

/// Identity of one update at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitStamp {
    Completed(CompletedStatus),
    Updated(Option<DateTime<Utc>>),
}

/// The set of update identities captured by a snapshot.
#[derive(Debug)]
pub struct UpdateTransaction {
    entries: Vec<(ActionId, CommitStamp)>,
}

/// The map under the update lock. Obtained via [`ActionUpdates::lock`]; held
/// only for short critical sections, never across awaits.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    map: HashMap<ActionId, SessionActionStatus>,
}

impl PendingUpdates {
    pub fn post(&mut self, status: SessionActionStatus) {
        if let Some(existing) = self.map.get(&status.id) {
            // A terminal status has already been recorded for this action;
            // a late non-terminal update must not regress it.
            if existing.completed_status.is_some() && status.completed_status.is_none() {
                return;
            }
        }
        self.map.insert(status.id.clone(), status);
    }

    /// Whether a terminal status is already pending for the action.
    pub fn is_terminal(&self, id: &ActionId) -> bool {
        self.map.get(id).is_some_and(|status| status.completed_status.is_some())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The scheduler-owned pending-update map plus its wake signal.
#[derive(Debug, Default)]
pub struct ActionUpdates {
    pending: Mutex<PendingUpdates>,
    wakeup: Notify,
}

impl ActionUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the update lock.
    pub fn lock(&self) -> MutexGuard<'_, PendingUpdates> {
        self.pending.lock()
    }

    pub fn post(&self, status: SessionActionStatus) {
        self.lock().post(status);
    }

    /// Wake the scheduler for an immediate heartbeat.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub async fn notified(&self) {
        self.wakeup.notified().await;
    }

    /// Fail every action in an assignment: the first as FAILED, the rest as
    /// NEVER_ATTEMPTED, all with the given message.
    pub fn fail_all_actions(
        &self,
        actions: &[SessionActionSpec],
        message: &str,
        now: DateTime<Utc>,
    ) {
        let mut pending = self.lock();
        for (index, action) in actions.iter().enumerate() {
            let completed_status = if index == 0 {
                CompletedStatus::Failed
            } else {
                CompletedStatus::NeverAttempted
            };
            pending.post(SessionActionStatus::terminal(
                action.action_id().clone(),
                completed_status,
                Some(message.to_string()),
                Some(now),
                Some(now),
            ));
        }
        drop(pending);
        self.wake();
    }

    /// Capture the wire form of every pending update plus the commit
    /// transaction that identifies exactly what was captured.
    pub fn snapshot(&self) -> (HashMap<ActionId, UpdatedActionInfo>, UpdateTransaction) {
        let pending = self.lock();
        let wire = pending
            .map
            .iter()
            .map(|(id, status)| (id.clone(), status.to_wire()))
            .collect();
        let entries = pending
            .map
            .values()
            .map(|status| (status.id.clone(), status.stamp()))
            .collect();
        (wire, UpdateTransaction { entries })
    }

    /// Remove the entries captured by `transaction` whose identity still
    /// matches; entries rewritten while the request was in flight survive.
    pub fn commit(&self, transaction: &UpdateTransaction) {
        let mut pending = self.lock();
        for (id, stamp) in &transaction.entries {
            if pending.map.get(id).is_some_and(|status| status.stamp() == *stamp) {
                pending.map.remove(id);
            }
        }
    }
}

#[cfg(test)]
#[path = "updates_tests.rs"]
mod tests;
