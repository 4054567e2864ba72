// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable run state.
//!
//! The [`StateStore`] trait is the single mutator of run state. Every
//! mutation of the stack, step data or status is a compare-and-set on the
//! run's version counter, and pause consumption is atomic with the step data
//! it writes.
//!
//! # Layout
//!
//! | Per run | Per pause |
//! |---------|-----------|
//! | metadata (status, version, event, flags) | pause record |
//! | stack: ordered step hashes | index `(tenant, event) → pauses` |
//! | step data: hash → JSON | expiry index for timeout scans |
//! | attempts: hash → count | |
//!
//! # Backends
//!
//! - [`MemoryStateStore`]: mutex-guarded maps, for development and tests.
//! - [`SqliteStateStore`]: SQLite via sqlx, one transaction per mutation.

mod memory;
mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::event::Event;
use crate::ids::{FunctionId, PauseId, RunId, TenantId};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Terminal statuses are final; everything else may move anywhere
    /// except back to `Scheduled`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next != Self::Scheduled || *self == Self::Scheduled
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "scheduled" => Self::Scheduled,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown run status '{}'", other)),
        })
    }
}

/// Run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub tenant: TenantId,
    pub function_id: FunctionId,
    pub status: RunStatus,
    /// Bumped by every stack or step-data change and by `set_status`.
    /// Pause bookkeeping moves a run between `Paused` and `Running` without
    /// bumping it.
    pub version: u64,
    /// The triggering event.
    pub event: Event,
    /// The batch the triggering event arrived in, if any.
    pub events: Vec<Event>,
    /// Why the run failed or was cancelled.
    pub cause: Option<Value>,
    /// Return value of a completed run.
    pub output: Option<Value>,
    pub idempotency_key: String,
    /// Hashing version reported by the SDK.
    pub request_version: i32,
    /// Set once the run has executed steps in parallel.
    pub disable_immediate_execution: bool,
    /// Concurrency slot held while the run is active.
    pub concurrency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: RunId,
    pub tenant: TenantId,
    pub function_id: FunctionId,
    pub event: Event,
    pub events: Vec<Event>,
    pub idempotency_key: String,
    pub concurrency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewRun {
    pub(crate) fn into_metadata(self) -> RunMetadata {
        RunMetadata {
            run_id: self.run_id,
            tenant: self.tenant,
            function_id: self.function_id,
            status: RunStatus::Scheduled,
            version: 0,
            event: self.event,
            events: self.events,
            cause: None,
            output: None,
            idempotency_key: self.idempotency_key,
            request_version: 1,
            disable_immediate_execution: false,
            concurrency_key: self.concurrency_key,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Key that makes run creation idempotent.
pub fn idempotency_key(tenant: &TenantId, event_id: &str, function_id: &FunctionId) -> String {
    format!("{}:{}:{}", tenant, event_id, function_id)
}

/// Result of [`StateStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    pub run_id: RunId,
    /// False when an earlier run with the same idempotency key was returned.
    pub created: bool,
}

/// Snapshot of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub meta: RunMetadata,
    pub stack: Vec<String>,
    pub steps: HashMap<String, Value>,
    pub attempts: HashMap<String, u32>,
}

impl RunState {
    pub fn attempt(&self, hash: &str) -> u32 {
        self.attempts.get(hash).copied().unwrap_or(0)
    }

    pub fn has_step(&self, hash: &str) -> bool {
        self.steps.contains_key(hash)
    }

    /// Step data as the JSON object sent to the SDK.
    pub fn steps_object(&self) -> Value {
        Value::Object(
            self.steps
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }
}

/// Result of [`StateStore::append_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The value was written and the hash pushed to the stack.
    Appended { version: u64 },
    /// The hash already had a value; nothing changed.
    AlreadySet { version: u64 },
}

impl AppendOutcome {
    pub fn version(&self) -> u64 {
        match self {
            Self::Appended { version } | Self::AlreadySet { version } => *version,
        }
    }
}

/// What a pause waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseKind {
    /// `waitForEvent` from the SDK, or an async edge.
    Wait,
    /// An invoked function's completion.
    Invoke,
    /// A cancellation rule.
    Cancel,
}

impl PauseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Invoke => "invoke",
            Self::Cancel => "cancel",
        }
    }

    /// Whether a pending pause of this kind holds the run in `Paused`.
    pub fn blocks_run(&self) -> bool {
        !matches!(self, Self::Cancel)
    }
}

/// A durable wait on a future event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pause {
    pub id: PauseId,
    pub tenant: TenantId,
    pub run_id: RunId,
    pub function_id: FunctionId,
    pub kind: PauseKind,
    /// Step that created the pause.
    pub incoming: String,
    /// Step the run continues at once the pause is consumed.
    pub resume_step: String,
    /// Step hash receiving the resume value. `None` for cancellation pauses.
    pub data_key: Option<String>,
    pub event: String,
    pub expression: Option<String>,
    /// The run's triggering event, bound as `event` when matching.
    pub trigger_event: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed: bool,
}

impl Pause {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

/// How a pause is being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    /// A matching event arrived. Fails with `Expired` past the deadline.
    Event,
    /// The pause timed out.
    Timeout,
}

/// Result of [`StateStore::consume_pause`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeResult {
    /// This caller consumed the pause. Carries the pause as it was.
    Consumed(Pause),
    /// Someone else consumed it first, or it was removed with its run.
    AlreadyConsumed,
    /// The deadline passed; the timeout path owns it now.
    Expired,
}

/// Durable, linearizable run state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a run in `Scheduled`. Idempotent on the run's idempotency key.
    async fn create(&self, run: NewRun) -> Result<Created>;

    async fn load(&self, run_id: &RunId) -> Result<Option<RunState>>;

    async fn load_metadata(&self, run_id: &RunId) -> Result<Option<RunMetadata>>;

    /// The run created under `idempotency_key`, if any.
    async fn find_run(&self, idempotency_key: &str) -> Result<Option<RunMetadata>>;

    /// Set `hash` to `data` and push it to the stack, if the run is still at
    /// `expected_version`. First writer wins: an existing value is kept.
    async fn append_step(
        &self,
        run_id: &RunId,
        hash: &str,
        data: Value,
        expected_version: u64,
    ) -> Result<AppendOutcome>;

    async fn set_attempt(&self, run_id: &RunId, hash: &str, attempt: u32) -> Result<()>;

    /// Change status. Terminal statuses are final.
    async fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        cause: Option<Value>,
    ) -> Result<RunMetadata>;

    async fn set_output(&self, run_id: &RunId, output: Value) -> Result<()>;

    async fn set_request_version(&self, run_id: &RunId, version: i32) -> Result<()>;

    async fn mark_parallel(&self, run_id: &RunId) -> Result<()>;

    /// Persist a pause and index it. A blocking pause moves an active run to
    /// `Paused`. Saving over a consumed pause is a no-op.
    async fn save_pause(&self, pause: &Pause) -> Result<()>;

    async fn load_pause(&self, id: &PauseId) -> Result<Option<Pause>>;

    /// Unconsumed pauses for `(tenant, event)`, oldest first, ties by ID.
    async fn pauses_by_event(&self, tenant: &TenantId, event: &str) -> Result<Vec<Pause>>;

    /// Unconsumed pauses owned by a run.
    async fn pauses_for_run(&self, run_id: &RunId) -> Result<Vec<Pause>>;

    /// Consume a pause exactly once.
    ///
    /// In one atomic step: mark the pause consumed, drop it from the
    /// indexes, write `data` to its `data_key` (pushing the stack), and move
    /// a `Paused` run with no other blocking pause back to `Running`.
    async fn consume_pause(
        &self,
        id: &PauseId,
        data: Option<Value>,
        mode: ConsumeMode,
        now: DateTime<Utc>,
    ) -> Result<ConsumeResult>;

    async fn delete_pause(&self, id: &PauseId) -> Result<()>;

    /// Consumed pauses not yet deleted: their resumption may not have been
    /// handed off.
    async fn consumed_pauses(&self, limit: usize) -> Result<Vec<Pause>>;

    /// Unconsumed pauses whose deadline is at or before `now`.
    async fn expired_pauses(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Pause>>;

    /// Release everything a finished run holds: pauses and its concurrency slot.
    async fn cleanup(&self, run_id: &RunId) -> Result<()>;

    /// Take a slot under `key` for `run_id` if fewer than `limit` are held.
    /// Re-acquiring a slot already held succeeds.
    async fn acquire_slot(&self, key: &str, run_id: &RunId, limit: u32) -> Result<bool>;

    /// Count a start against a fixed-window rate limit. False when over.
    async fn rate_limit(
        &self,
        key: &str,
        limit: u32,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Start of the fixed window containing `now`, in milliseconds.
pub(crate) fn window_start(now: DateTime<Utc>, period: Duration) -> i64 {
    let period_ms = (period.as_millis() as i64).max(1);
    let now_ms = now.timestamp_millis();
    now_ms - now_ms.rem_euclid(period_ms)
}
