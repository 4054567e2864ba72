// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor: advances one step of one run per queue item.
//!
//! # Flow
//!
//! ```text
//! lease ──► load run ──► terminal? ──► ack
//!               │
//!               ▼
//!         invoke driver ──► 200 ────► complete run
//!               │      └──► 206 ────► apply opcodes, queue successors
//!               │      └──► error ──► nack(retry-at) or fail run
//!               ▼
//!         ack | nack
//! ```
//!
//! The executor never takes a lock on a run. Step data is written with a
//! compare-and-set on the run version; the first writer of a hash wins and
//! later writers observe `AlreadySet`. A conflicting write is re-read and
//! retried once, then the whole item is requeued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};
use tributary_http::{Backoff, DEFAULT_MAX_BODY_SIZE};
use url::Url;

use crate::driver::{DriverError, DriverRegistry, DriverRequest, Outcome, SdkRequest};
use crate::error::{CoreError, Result};
use crate::event::FN_FINISHED;
use crate::function::{FunctionRegistry, RegisteredFunction, StepDefinition};
use crate::ids::{PauseId, RunId};
use crate::lifecycle::Lifecycle;
use crate::opcode::{Opcode, UserError};
use crate::pauses::PauseManager;
use crate::queue::{ItemKind, Lease, Queue, QueueItem};
use crate::runner::Runner;
use crate::state::{AppendOutcome, Pause, PauseKind, RunState, RunStatus, StateStore};

/// Default cap on the number of steps a run may commit.
pub const DEFAULT_MAX_STEPS: usize = 1000;

/// How long an invoke waits for its child when the opcode names no timeout.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Error name for a step output over the size limit.
pub const STEP_OUTPUT_TOO_LARGE: &str = "StepOutputTooLarge";

/// Error name for a run that went over the step limit.
pub const STEP_LIMIT_ERROR: &str = "StepLimitExceeded";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Environment name sent to SDKs as `ctx.env`.
    pub env: String,
    pub max_steps: usize,
    /// Largest accepted step output, serialized.
    pub max_step_output_size: usize,
    /// Fixed backoff; `None` picks one from the run's request version.
    pub backoff: Option<Backoff>,
    /// Delay before re-checking a full concurrency key.
    pub concurrency_retry: Duration,
    /// Delay before requeueing after a store conflict or outage.
    pub conflict_retry: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            max_step_output_size: DEFAULT_MAX_BODY_SIZE,
            backoff: None,
            concurrency_retry: Duration::from_secs(1),
            conflict_retry: Duration::from_millis(250),
        }
    }
}

/// What to do with the leased item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry { attempt: u32, at: DateTime<Utc> },
}

pub struct Executor {
    registry: Arc<FunctionRegistry>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    drivers: DriverRegistry,
    pauses: Arc<PauseManager>,
    runner: Arc<Runner>,
    lifecycle: Arc<Lifecycle>,
    config: ExecutorConfig,
}

/// Per-item context threaded through opcode handling.
struct Step<'a> {
    item: &'a QueueItem,
    function: &'a RegisteredFunction,
    def: &'a StepDefinition,
    version: u64,
    committed: usize,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FunctionRegistry>,
        state: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        drivers: DriverRegistry,
        pauses: Arc<PauseManager>,
        runner: Arc<Runner>,
        lifecycle: Arc<Lifecycle>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            state,
            queue,
            drivers,
            pauses,
            runner,
            lifecycle,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a leased item and settle the lease. Never fails: every
    /// outcome becomes an ack or a nack.
    pub async fn process(&self, lease: &Lease) {
        let item = &lease.item;
        let disposition = match self.execute(item).await {
            Ok(d) => d,
            Err(e) if e.is_transient() => {
                warn!(run_id = %item.run_id, error = %e, "Transient failure, requeueing");
                Disposition::Retry {
                    attempt: item.attempt,
                    at: Utc::now() + to_delta(self.config.conflict_retry),
                }
            }
            Err(e) => {
                error!(run_id = %item.run_id, error = %e, code = e.error_code(), "Dropping queue item");
                Disposition::Ack
            }
        };

        let settled = match disposition {
            Disposition::Ack => self.queue.ack(lease).await,
            Disposition::Retry { attempt, at } => self.queue.nack(lease, attempt, at).await,
        };
        if let Err(e) = settled {
            error!(run_id = %item.run_id, error = %e, "Failed to settle lease");
        }
    }

    /// Execute one queue item.
    #[instrument(skip(self, item), fields(run_id = %item.run_id, kind = ?item.kind, step = %item.step_id, attempt = item.attempt))]
    pub async fn execute(&self, item: &QueueItem) -> Result<Disposition> {
        match item.kind {
            ItemKind::PauseTimeout => {
                if let Some(pause_id) = &item.pause_id {
                    self.pauses.expire(pause_id, Utc::now()).await?;
                }
                return Ok(Disposition::Ack);
            }
            ItemKind::Cancellation => {
                self.runner.cancel(&item.run_id).await?;
                return Ok(Disposition::Ack);
            }
            ItemKind::StartRun | ItemKind::ContinueRun => {}
        }

        let Some(mut state) = self.state.load(&item.run_id).await? else {
            warn!("Run not found, dropping item");
            return Ok(Disposition::Ack);
        };
        if state.meta.status.is_terminal() {
            debug!(status = %state.meta.status, "Run already finished");
            return Ok(Disposition::Ack);
        }
        if let Some(hash) = &item.step_hash
            && state.has_step(hash)
        {
            debug!(hash = %hash, "Planned step already committed");
            return Ok(Disposition::Ack);
        }

        let Some(function) = self.registry.get(&item.function_id) else {
            let err = UserError::new("FunctionNotFound", format!("function {} is not registered", item.function_id));
            self.lifecycle.fail(&item.run_id, &err).await?;
            return Ok(Disposition::Ack);
        };
        let Some(def) = function.definition.step(&item.step_id) else {
            let err = UserError::new("StepNotFound", format!("step '{}' is not defined", item.step_id));
            self.lifecycle.fail(&item.run_id, &err).await?;
            return Ok(Disposition::Ack);
        };

        if item.kind == ItemKind::StartRun {
            if let (Some(limit), Some(key)) = (
                function.definition.concurrency.as_ref(),
                state.meta.concurrency_key.as_deref(),
            ) && !self
                .state
                .acquire_slot(key, &item.run_id, limit.limit)
                .await?
            {
                debug!(key = %key, "Concurrency limit reached, delaying start");
                return Ok(Disposition::Retry {
                    attempt: item.attempt,
                    at: Utc::now() + to_delta(self.config.concurrency_retry),
                });
            }
            if state.meta.status == RunStatus::Scheduled {
                state.meta = self
                    .state
                    .set_status(&item.run_id, RunStatus::Running, None)
                    .await?;
            }
        }

        if let Some(hash) = &item.wake_step
            && !state.has_step(hash)
        {
            let mut version = state.meta.version;
            self.commit(&item.run_id, hash, Value::Null, &mut version)
                .await?;
            state = self
                .state
                .load(&item.run_id)
                .await?
                .ok_or_else(|| CoreError::RunNotFound {
                    run_id: item.run_id.to_string(),
                })?;
        }

        if state.stack.len() > self.config.max_steps {
            self.fail_step_limit(&item.run_id).await?;
            return Ok(Disposition::Ack);
        }

        let url = match Url::parse(&def.uri) {
            Ok(url) => url,
            Err(e) => {
                let err = DriverError::InvalidUrl(format!("{}: {}", def.uri, e));
                self.lifecycle.fail(&item.run_id, &err.to_user_error()).await?;
                return Ok(Disposition::Ack);
            }
        };
        let driver = match self.drivers.for_runtime(&def.runtime) {
            Ok(driver) => driver,
            Err(e) => {
                self.lifecycle.fail(&item.run_id, &e.to_user_error()).await?;
                return Ok(Disposition::Ack);
            }
        };

        let request = DriverRequest {
            url,
            tenant: state.meta.tenant,
            env: self.config.env.clone(),
            step_id: item.step_id.clone(),
            step_hash: item.step_hash.clone(),
            timeout: def.timeout(),
            payload: SdkRequest::new(&state, &self.config.env, &item.step_id, item.attempt),
        };

        let response = match driver.execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                let user = e.to_user_error();
                return self
                    .retry_or_fail(item, def, &state, user, e.is_retryable(), None)
                    .await;
            }
        };

        if let Some(version) = response.request_version
            && version != state.meta.request_version
        {
            self.state.set_request_version(&item.run_id, version).await?;
            state.meta.request_version = version;
        }

        match response.outcome {
            Outcome::Complete(output) => {
                self.lifecycle.complete(&item.run_id, output).await?;
                Ok(Disposition::Ack)
            }
            Outcome::Error {
                error,
                retryable,
                retry_at,
                status,
            } => {
                debug!(status, error = %error.message, "SDK returned an error");
                self.retry_or_fail(item, def, &state, error, retryable, retry_at)
                    .await
            }
            Outcome::Opcodes(ops) => {
                let mut step = Step {
                    item,
                    function: &function,
                    def,
                    version: state.meta.version,
                    committed: 0,
                };
                self.apply_opcodes(&mut step, &state, ops).await
            }
        }
    }

    async fn apply_opcodes(
        &self,
        step: &mut Step<'_>,
        state: &RunState,
        ops: Vec<Opcode>,
    ) -> Result<Disposition> {
        let run_id = step.item.run_id;
        if ops.is_empty() {
            self.lifecycle.complete(&run_id, Value::Null).await?;
            return Ok(Disposition::Ack);
        }
        if ops.len() > self.config.max_steps {
            self.fail_step_limit(&run_id).await?;
            return Ok(Disposition::Ack);
        }

        let planned = ops
            .iter()
            .filter(|op| matches!(op, Opcode::StepPlanned { .. }))
            .count();
        if planned > 1 && !state.meta.disable_immediate_execution {
            self.state.mark_parallel(&run_id).await?;
        }

        for op in ops {
            debug!(op = op.kind(), hash = op.hash().unwrap_or_default(), "Applying opcode");
            if state.stack.len() + step.committed >= self.config.max_steps
                && matches!(op, Opcode::StepRun { .. } | Opcode::StepError { .. })
            {
                self.fail_step_limit(&run_id).await?;
                return Ok(Disposition::Ack);
            }

            match op {
                Opcode::None => {}
                Opcode::StepRun { hash, data, .. } => {
                    let size = serde_json::to_vec(&data).map(|b| b.len()).unwrap_or(0);
                    let value = if size > self.config.max_step_output_size {
                        warn!(hash = %hash, size, "Step output over the size limit");
                        json!({ "error": UserError::new(
                            STEP_OUTPUT_TOO_LARGE,
                            format!("step output of {} bytes exceeds the {} byte limit", size, self.config.max_step_output_size),
                        ).to_value() })
                    } else {
                        json!({ "data": data })
                    };
                    self.commit_and_continue(step, &hash, value).await?;
                }
                Opcode::StepError { hash, error, .. } => {
                    let attempt = step.item.attempt.max(state.attempt(&hash));
                    if !error.is_non_retriable() && attempt < step.def.retries {
                        self.state.set_attempt(&run_id, &hash, attempt + 1).await?;
                        info!(hash = %hash, attempt, error = %error.message, "Step errored, retrying");
                        return Ok(Disposition::Retry {
                            attempt: attempt + 1,
                            at: Utc::now() + to_delta(self.backoff(state).delay(attempt)),
                        });
                    }
                    info!(hash = %hash, attempt, error = %error.message, "Step failed permanently");
                    self.commit_and_continue(step, &hash, json!({ "error": error.to_value() }))
                        .await?;
                }
                Opcode::StepPlanned { hash, .. } => {
                    if state.has_step(&hash) {
                        continue;
                    }
                    let item = self
                        .successor(step.item)
                        .step_hash(hash.clone())
                        .job_id(format!("step:{}:{}", run_id, hash));
                    self.queue.enqueue(item).await?;
                }
                Opcode::Sleep { hash, sleep, .. } => {
                    if state.has_step(&hash) {
                        continue;
                    }
                    let wake_at = sleep.wake_at(Utc::now());
                    let item = self
                        .successor(step.item)
                        .wake(hash.clone())
                        .at(wake_at)
                        .job_id(format!("sleep:{}:{}", run_id, hash));
                    self.queue.enqueue(item).await?;
                    info!(hash = %hash, wake_at = %wake_at, "Sleeping");
                }
                Opcode::WaitForEvent {
                    hash,
                    event,
                    timeout,
                    expression,
                    ..
                } => {
                    if state.has_step(&hash) {
                        continue;
                    }
                    let pause = self.pause(step, state, PauseKind::Wait, &hash, event, expression, timeout);
                    self.pauses.create(&pause).await?;
                }
                Opcode::InvokeFunction {
                    hash,
                    function,
                    payload,
                    timeout,
                    ..
                } => {
                    if state.has_step(&hash) {
                        continue;
                    }
                    let tenant = step.function.tenant;
                    if self.registry.resolve(tenant, &function).is_none() {
                        let error = UserError::new(
                            "Error",
                            format!("could not find function '{}' to invoke", function),
                        );
                        self.commit_and_continue(step, &hash, json!({ "error": error.to_value() }))
                            .await?;
                        continue;
                    }
                    let correlation = format!("{}.{}", run_id, hash);
                    let pause = self.pause(
                        step,
                        state,
                        PauseKind::Invoke,
                        &hash,
                        FN_FINISHED.to_string(),
                        Some(format!("async.data.correlation_id == '{}'", correlation)),
                        timeout.unwrap_or(DEFAULT_INVOKE_TIMEOUT),
                    );
                    self.pauses.create(&pause).await?;
                    let child = self
                        .runner
                        .invoke(tenant, &function, &payload, &correlation)
                        .await?;
                    info!(hash = %hash, child = ?child, "Invoked function");
                }
            }
        }
        Ok(Disposition::Ack)
    }

    #[allow(clippy::too_many_arguments)]
    fn pause(
        &self,
        step: &Step<'_>,
        state: &RunState,
        kind: PauseKind,
        hash: &str,
        event: String,
        expression: Option<String>,
        timeout: Duration,
    ) -> Pause {
        let now = Utc::now();
        Pause {
            id: PauseId::for_step(&step.item.run_id, hash),
            tenant: step.function.tenant,
            run_id: step.item.run_id,
            function_id: step.function.id,
            kind,
            incoming: step.item.step_id.clone(),
            resume_step: step.item.step_id.clone(),
            data_key: Some(hash.to_string()),
            event,
            expression,
            trigger_event: state.meta.event.to_value(),
            created_at: now,
            expires_at: chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            consumed: false,
        }
    }

    /// A discovery item that re-enters the function at the same step.
    fn successor(&self, item: &QueueItem) -> QueueItem {
        QueueItem::new(ItemKind::ContinueRun, item.tenant, item.run_id, item.function_id)
            .step(item.step_id.clone())
    }

    async fn commit_and_continue(&self, step: &mut Step<'_>, hash: &str, value: Value) -> Result<()> {
        let run_id = step.item.run_id;
        if self.commit(&run_id, hash, value, &mut step.version).await? {
            step.committed += 1;
        }
        let item = self
            .successor(step.item)
            .job_id(format!("continue:{}:{}", run_id, hash));
        self.queue.enqueue(item).await?;
        Ok(())
    }

    /// Write a step value, re-reading the version once on conflict.
    /// Returns false when the hash already had a value.
    async fn commit(&self, run_id: &RunId, hash: &str, value: Value, version: &mut u64) -> Result<bool> {
        let outcome = match self.state.append_step(run_id, hash, value.clone(), *version).await {
            Ok(outcome) => outcome,
            Err(CoreError::StateConflict { actual, .. }) => {
                debug!(hash = %hash, expected = *version, actual, "Version moved, retrying commit");
                self.state.append_step(run_id, hash, value, actual).await?
            }
            Err(e) => return Err(e),
        };
        *version = outcome.version();
        Ok(matches!(outcome, AppendOutcome::Appended { .. }))
    }

    async fn retry_or_fail(
        &self,
        item: &QueueItem,
        def: &StepDefinition,
        state: &RunState,
        error: UserError,
        retryable: bool,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Disposition> {
        if retryable && item.attempt < def.retries {
            let at = retry_at
                .unwrap_or_else(|| Utc::now() + to_delta(self.backoff(state).delay(item.attempt)));
            if let Some(hash) = &item.step_hash {
                self.state
                    .set_attempt(&item.run_id, hash, item.attempt + 1)
                    .await?;
            }
            info!(attempt = item.attempt, retry_at = %at, error = %error.message, "Request failed, retrying");
            return Ok(Disposition::Retry {
                attempt: item.attempt + 1,
                at,
            });
        }
        self.lifecycle.fail(&item.run_id, &error).await?;
        Ok(Disposition::Ack)
    }

    async fn fail_step_limit(&self, run_id: &RunId) -> Result<()> {
        let error = UserError::new(
            STEP_LIMIT_ERROR,
            format!(
                "The function run exceeded the step limit of {} steps.",
                self.config.max_steps
            ),
        );
        self.lifecycle.fail(run_id, &error).await?;
        Ok(())
    }

    fn backoff(&self, state: &RunState) -> Backoff {
        self.config
            .backoff
            .unwrap_or_else(|| Backoff::for_request_version(i64::from(state.meta.request_version)))
    }
}

fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}
