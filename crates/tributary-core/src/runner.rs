// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turns events into executor work.
//!
//! For every event the runner first schedules new runs for matching
//! triggers, then resumes matching pauses. Scheduling first lets a function
//! trigger itself without a stale pause of an earlier run grabbing the event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::duration::parse_duration;
use crate::error::{CoreError, Result};
use crate::event::{Event, SCHEDULED_TIMER};
use crate::expressions::{Env, ExpressionCache};
use crate::function::{FunctionRegistry, RegisteredFunction, Trigger, next_fire, parse_cron};
use crate::ids::{PauseId, RunId, TenantId};
use crate::lifecycle::Lifecycle;
use crate::pauses::{PauseManager, Resumption};
use crate::queue::{ItemKind, Queue, QueueItem};
use crate::state::{
    Created, NewRun, Pause, PauseKind, RunMetadata, RunStatus, StateStore, idempotency_key,
};

/// How long a cancellation rule stays armed when it names no timeout.
pub const DEFAULT_CANCEL_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Event name of runs started by an invoking parent.
pub const FN_INVOKED: &str = "inngest/function.invoked";

/// What one event caused.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventOutcome {
    pub scheduled: Vec<RunId>,
    pub resumed: Vec<Resumption>,
}

pub struct Runner {
    registry: Arc<FunctionRegistry>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    pauses: Arc<PauseManager>,
    lifecycle: Arc<Lifecycle>,
}

impl Runner {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        state: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        pauses: Arc<PauseManager>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            registry,
            state,
            queue,
            pauses,
            lifecycle,
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    fn expressions(&self) -> &'static ExpressionCache {
        self.registry.expressions()
    }

    /// Schedule runs for matching triggers, then resume matching pauses.
    #[instrument(skip(self, event), fields(event = %event.name))]
    pub async fn handle_event(&self, tenant: TenantId, mut event: Event) -> Result<EventOutcome> {
        event.stamp(Utc::now());
        let mut outcome = EventOutcome::default();

        let value = event.to_value();
        for function in self.registry.triggered_by(tenant, &event.name) {
            let matched = function
                .definition
                .event_triggers()
                .filter(|(name, _)| *name == event.name)
                .any(|(_, guard)| match guard {
                    None => true,
                    Some(expr) => self.expressions().matches(expr, &Env::new().event(&value)),
                });
            if !matched {
                continue;
            }
            if let Some(created) = self.schedule(&function, event.clone(), Vec::new()).await?
                && created.created
            {
                outcome.scheduled.push(created.run_id);
            }
        }

        outcome.resumed = self.pauses.handle_event(tenant, &event).await?;
        Ok(outcome)
    }

    /// Create a run of `function` for `event` and queue its first step.
    ///
    /// Returns `None` when the function's rate limit skipped the run.
    /// Creation is idempotent on (tenant, event ID, function). Scheduling an
    /// event whose run exists but never started arms that run again, so a
    /// redelivery repairs a schedule that failed half way. Redeliveries are
    /// not counted against the rate limit.
    pub async fn schedule(
        &self,
        function: &RegisteredFunction,
        event: Event,
        events: Vec<Event>,
    ) -> Result<Option<Created>> {
        let def = &function.definition;
        let now = Utc::now();
        let value = event.to_value();
        let event_id = event.id.clone().unwrap_or_default();
        let key = idempotency_key(&function.tenant, &event_id, &function.id);

        if let Some(existing) = self.state.find_run(&key).await? {
            debug!(run_id = %existing.run_id, function = %def.slug, "Run already exists for event");
            self.rearm(function, &existing).await?;
            return Ok(Some(Created {
                run_id: existing.run_id,
                created: false,
            }));
        }

        if let Some(limit) = &def.rate_limit {
            let period = def
                .rate_limit_period()
                .ok_or_else(|| CoreError::InvalidFunction {
                    function: def.slug.clone(),
                    message: format!("invalid rate limit period '{}'", limit.period),
                })?;
            let key = format!(
                "rl:{}:{}",
                function.id,
                self.key_value(limit.key.as_deref(), &value)
            );
            if !self.state.rate_limit(&key, limit.limit, period, now).await? {
                info!(function = %def.slug, key = %key, "Run skipped by rate limit");
                return Ok(None);
            }
        }

        let concurrency_key = def.concurrency.as_ref().map(|c| {
            format!(
                "cc:{}:{}",
                function.id,
                self.key_value(c.key.as_deref(), &value)
            )
        });

        let run_id = RunId::at(now);
        let created = self
            .state
            .create(NewRun {
                run_id,
                tenant: function.tenant,
                function_id: function.id,
                event,
                events,
                idempotency_key: key,
                concurrency_key,
                created_at: now,
            })
            .await?;
        if !created.created {
            debug!(run_id = %created.run_id, function = %def.slug, "Run created concurrently for event");
            if let Some(existing) = self.state.load_metadata(&created.run_id).await? {
                self.rearm(function, &existing).await?;
            }
            return Ok(Some(created));
        }

        self.arm(function, run_id, now, &value).await?;
        info!(run_id = %run_id, function = %def.slug, "Run scheduled");
        Ok(Some(created))
    }

    /// Arm an existing run again if it is still waiting for its first step.
    async fn rearm(&self, function: &RegisteredFunction, existing: &RunMetadata) -> Result<()> {
        if existing.status != RunStatus::Scheduled {
            return Ok(());
        }
        info!(run_id = %existing.run_id, function = %function.definition.slug, "Re-arming scheduled run");
        self.arm(
            function,
            existing.run_id,
            existing.created_at,
            &existing.event.to_value(),
        )
        .await
    }

    /// Register the run's cancellation pauses and queue its first step.
    ///
    /// Pause IDs and the job ID derive from the run, so arming twice stores
    /// and queues everything once.
    async fn arm(
        &self,
        function: &RegisteredFunction,
        run_id: RunId,
        created_at: DateTime<Utc>,
        trigger: &Value,
    ) -> Result<()> {
        let def = &function.definition;
        let entry = def.entry_step().ok_or_else(|| CoreError::InvalidFunction {
            function: def.slug.clone(),
            message: "no entry step".to_string(),
        })?;

        for (index, rule) in def.cancel.iter().enumerate() {
            let ttl = match &rule.timeout {
                Some(t) => parse_duration(t).map_err(|e| CoreError::InvalidFunction {
                    function: def.slug.clone(),
                    message: e.to_string(),
                })?,
                None => DEFAULT_CANCEL_TTL,
            };
            let pause = Pause {
                id: PauseId::for_step(&run_id, &format!("cancel:{}", index)),
                tenant: function.tenant,
                run_id,
                function_id: function.id,
                kind: PauseKind::Cancel,
                incoming: entry.id.clone(),
                resume_step: entry.id.clone(),
                data_key: None,
                event: rule.event.clone(),
                expression: Some(cancel_expression(rule.expression.as_deref(), created_at)),
                trigger_event: trigger.clone(),
                created_at,
                expires_at: chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|d| created_at.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                consumed: false,
            };
            self.pauses.create(&pause).await?;
        }

        let item = QueueItem::new(ItemKind::StartRun, function.tenant, run_id, function.id)
            .step(entry.id.clone())
            .at(created_at)
            .job_id(format!("start:{}", run_id));
        self.queue.enqueue(item).await?;
        Ok(())
    }

    /// Start `target` (an ID or slug) on behalf of an invoking parent.
    pub async fn invoke(
        &self,
        tenant: TenantId,
        target: &str,
        payload: &Value,
        correlation_id: &str,
    ) -> Result<Option<RunId>> {
        let function =
            self.registry
                .resolve(tenant, target)
                .ok_or_else(|| CoreError::FunctionNotFound {
                    function: target.to_string(),
                })?;

        let mut data = match payload.get("data") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        data.insert(
            "_inngest".to_string(),
            json!({ "correlation_id": correlation_id }),
        );
        let mut event = Event::new(FN_INVOKED, Value::Object(data));
        event.user = payload.get("user").cloned();
        event.id = Some(correlation_id.to_string());
        event.stamp(Utc::now());

        Ok(self
            .schedule(&function, event, Vec::new())
            .await?
            .map(|c| c.run_id))
    }

    /// Fire cron triggers due in `(from, to]`. Returns the runs created.
    pub async fn fire_crons(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<RunId>> {
        let mut scheduled = Vec::new();
        for function in self.registry.all() {
            for trigger in &function.definition.triggers {
                let Trigger::Cron { cron } = trigger else {
                    continue;
                };
                let schedule = match parse_cron(cron) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(function = %function.definition.slug, error = %e, "Skipping cron");
                        continue;
                    }
                };
                let Some(at) = next_fire(&schedule, from).filter(|at| *at <= to) else {
                    continue;
                };

                let mut event = Event::new(SCHEDULED_TIMER, json!({ "cron": cron }));
                event.id = Some(format!("cron:{}:{}", function.id, at.timestamp()));
                event.ts = Some(at.timestamp_millis());
                if let Some(created) = self.schedule(&function, event, Vec::new()).await?
                    && created.created
                {
                    scheduled.push(created.run_id);
                }
            }
        }
        Ok(scheduled)
    }

    /// Cancel a run from outside. Cancelling a finished run is a no-op that
    /// returns its metadata.
    pub async fn cancel(&self, run_id: &RunId) -> Result<RunMetadata> {
        let meta = self
            .state
            .load_metadata(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if meta.status.is_terminal() {
            return Ok(meta);
        }
        match self.lifecycle.cancel(run_id, None).await? {
            Some(meta) => Ok(meta),
            None => self
                .state
                .load_metadata(run_id)
                .await?
                .ok_or_else(|| CoreError::RunNotFound {
                    run_id: run_id.to_string(),
                }),
        }
    }

    /// Evaluate a concurrency or rate-limit key expression.
    fn key_value(&self, expr: Option<&str>, event: &Value) -> String {
        let Some(expr) = expr else {
            return String::new();
        };
        let value = self
            .expressions()
            .compile(expr)
            .ok()
            .and_then(|e| e.evaluate(&Env::new().event(event)).ok());
        match value {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// Cancellation only counts events published after the run started.
fn cancel_expression(expression: Option<&str>, started: DateTime<Utc>) -> String {
    let fence = format!(
        "(async.ts == null || async.ts > {})",
        started.timestamp_millis()
    );
    match expression {
        Some(expr) => format!("({}) && {}", expr, fence),
        None => fence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingSink;
    use crate::function::FunctionDefinition;
    use crate::queue::{FlakyQueue, MemoryQueue};
    use crate::state::MemoryStateStore;

    struct Harness {
        state: Arc<MemoryStateStore>,
        queue: Arc<MemoryQueue>,
        flaky: FlakyQueue,
        runner: Runner,
    }

    fn harness() -> Harness {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let flaky = FlakyQueue::new(queue.clone(), ItemKind::StartRun, 0);
        let shared: Arc<dyn Queue> = Arc::new(flaky.clone());
        let lifecycle = Arc::new(Lifecycle::new(state.clone(), Arc::new(RecordingSink::default())));
        let pauses = Arc::new(PauseManager::new(
            state.clone(),
            shared.clone(),
            lifecycle.clone(),
            ExpressionCache::global(),
        ));
        let runner = Runner::new(
            Arc::new(FunctionRegistry::new()),
            state.clone(),
            shared,
            pauses,
            lifecycle,
        );
        Harness {
            state,
            queue,
            flaky,
            runner,
        }
    }

    fn starts(h: &Harness) -> Vec<QueueItem> {
        h.queue
            .pending()
            .into_iter()
            .filter(|i| i.kind == ItemKind::StartRun)
            .collect()
    }

    fn register(h: &Harness, def: Value) -> Arc<RegisteredFunction> {
        let def: FunctionDefinition = serde_json::from_value(def).unwrap();
        h.runner
            .registry()
            .register(TenantId::default(), def)
            .unwrap()
    }

    fn basic(slug: &str, trigger: Value) -> Value {
        json!({
            "slug": slug,
            "name": slug,
            "triggers": [trigger],
            "steps": {"step": {"id": "step", "uri": "http://127.0.0.1:3000/api"}}
        })
    }

    #[tokio::test]
    async fn test_event_schedules_run_once() {
        let h = harness();
        register(&h, basic("sdk-function-test", json!({"event": "tests/function.test"})));

        let mut evt = Event::new("tests/function.test", json!({"test": true}));
        evt.stamp(Utc::now());
        let outcome = h
            .runner
            .handle_event(TenantId::default(), evt.clone())
            .await
            .unwrap();
        assert_eq!(outcome.scheduled.len(), 1);

        let meta = h
            .state
            .load_metadata(&outcome.scheduled[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.status, RunStatus::Scheduled);
        assert_eq!(meta.event, evt);

        let pending = h.queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ItemKind::StartRun);
        assert_eq!(pending[0].step_id, "step");

        // Redelivery of the same event is idempotent.
        let again = h
            .runner
            .handle_event(TenantId::default(), evt)
            .await
            .unwrap();
        assert!(again.scheduled.is_empty());
        assert_eq!(h.queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_dag_runs_start_at_entry_only() {
        let h = harness();
        register(
            &h,
            json!({
                "slug": "dag",
                "name": "dag",
                "triggers": [{"event": "a/dag"}],
                "steps": {
                    "second": {"id": "second", "uri": "http://127.0.0.1:3000/b",
                        "after": [{"step": "first", "wait": {"event": "c/d", "ttl": "1h"}}]},
                    "first": {"id": "first", "uri": "http://127.0.0.1:3000/a"}
                }
            }),
        );
        let run_id = h
            .runner
            .handle_event(TenantId::default(), Event::new("a/dag", json!({})))
            .await
            .unwrap()
            .scheduled[0];

        let items = starts(&h);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].step_id, "first");
        // The edge's wait opens no pause.
        assert!(h.state.pauses_for_run(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_guard() {
        let h = harness();
        register(
            &h,
            basic(
                "guarded",
                json!({"event": "orders/created", "expression": "event.data.total > 100"}),
            ),
        );
        let small = Event::new("orders/created", json!({"total": 5}));
        let large = Event::new("orders/created", json!({"total": 500}));
        assert!(
            h.runner
                .handle_event(TenantId::default(), small)
                .await
                .unwrap()
                .scheduled
                .is_empty()
        );
        assert_eq!(
            h.runner
                .handle_event(TenantId::default(), large)
                .await
                .unwrap()
                .scheduled
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_rules_register_fenced_pauses() {
        let h = harness();
        let mut def = basic("cancellable", json!({"event": "tests/cancel.test"}));
        def["cancel"] = json!([{"event": "cancel/please", "if": "async.data.request_id == event.data.request_id"}]);
        register(&h, def);

        let outcome = h
            .runner
            .handle_event(
                TenantId::default(),
                Event::new("tests/cancel.test", json!({"request_id": "123"})),
            )
            .await
            .unwrap();
        let run_id = outcome.scheduled[0];
        let pauses = h.state.pauses_for_run(&run_id).await.unwrap();
        assert_eq!(pauses.len(), 1);
        assert_eq!(pauses[0].kind, PauseKind::Cancel);
        let expr = pauses[0].expression.as_deref().unwrap();
        assert!(expr.starts_with("(async.data.request_id == event.data.request_id) && (async.ts == null"));

        // An event stamped before the run started is fenced out.
        let mut stale = Event::new("cancel/please", json!({"request_id": "123"}));
        stale.ts = Some(1);
        let outcome = h
            .runner
            .handle_event(TenantId::default(), stale)
            .await
            .unwrap();
        assert!(outcome.resumed.is_empty());

        let mut fresh = Event::new("cancel/please", json!({"request_id": "123"}));
        fresh.ts = Some(Utc::now().timestamp_millis() + 1_000);
        let outcome = h
            .runner
            .handle_event(TenantId::default(), fresh)
            .await
            .unwrap();
        assert_eq!(outcome.resumed, vec![Resumption::Cancelled { run_id }]);
    }

    #[tokio::test]
    async fn test_rate_limit_skips_runs() {
        let h = harness();
        let mut def = basic("limited", json!({"event": "a/b"}));
        def["rate_limit"] = json!({"limit": 1, "period": "1h", "key": "event.data.user"});
        register(&h, def);

        let send = |user: &str| Event::new("a/b", json!({"user": user}));
        let first = h.runner.handle_event(TenantId::default(), send("u1")).await.unwrap();
        let second = h.runner.handle_event(TenantId::default(), send("u1")).await.unwrap();
        let other = h.runner.handle_event(TenantId::default(), send("u2")).await.unwrap();
        assert_eq!(first.scheduled.len(), 1);
        assert!(second.scheduled.is_empty());
        assert_eq!(other.scheduled.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_ignores_redelivery() {
        let h = harness();
        let mut def = basic("limited", json!({"event": "a/b"}));
        def["rate_limit"] = json!({"limit": 2, "period": "1h", "key": "event.data.user"});
        let function = register(&h, def);

        let send = || {
            let mut evt = Event::new("a/b", json!({"user": "u1"}));
            evt.stamp(Utc::now());
            evt
        };
        let first = send();
        let created = h
            .runner
            .schedule(&function, first.clone(), Vec::new())
            .await
            .unwrap()
            .unwrap();
        assert!(created.created);

        let again = h
            .runner
            .schedule(&function, first, Vec::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.run_id, created.run_id);
        assert!(!again.created);

        // The redelivery did not take the second slot.
        let second = h
            .runner
            .schedule(&function, send(), Vec::new())
            .await
            .unwrap();
        assert!(second.is_some_and(|c| c.created));
        assert!(
            h.runner
                .schedule(&function, send(), Vec::new())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_redelivery_rearms_run_whose_start_was_lost() {
        let h = harness();
        let mut def = basic("cancellable", json!({"event": "tests/cancel.test"}));
        def["cancel"] = json!([{"event": "cancel/please"}]);
        let function = register(&h, def);

        let mut evt = Event::new("tests/cancel.test", json!({}));
        evt.stamp(Utc::now());
        h.flaky.fail_next(1);
        assert!(
            h.runner
                .handle_event(TenantId::default(), evt.clone())
                .await
                .is_err()
        );
        assert!(starts(&h).is_empty());

        let key = idempotency_key(&TenantId::default(), evt.id.as_deref().unwrap(), &function.id);
        let meta = h.state.find_run(&key).await.unwrap().unwrap();
        assert_eq!(meta.status, RunStatus::Scheduled);

        for _ in 0..2 {
            let outcome = h
                .runner
                .handle_event(TenantId::default(), evt.clone())
                .await
                .unwrap();
            assert!(outcome.scheduled.is_empty());
        }
        let items = starts(&h);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].run_id, meta.run_id);
        assert_eq!(items[0].job_id.as_deref(), Some(format!("start:{}", meta.run_id).as_str()));
        assert_eq!(h.state.pauses_for_run(&meta.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_started_run_is_not_rearmed() {
        let h = harness();
        register(&h, basic("once", json!({"event": "a/once"})));
        let mut evt = Event::new("a/once", json!({}));
        evt.stamp(Utc::now());
        let run_id = h
            .runner
            .handle_event(TenantId::default(), evt.clone())
            .await
            .unwrap()
            .scheduled[0];

        // The first step was taken and finished.
        let lease = h
            .queue
            .lease(Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        h.state.set_status(&run_id, RunStatus::Running, None).await.unwrap();
        h.queue.ack(&lease).await.unwrap();

        h.runner
            .handle_event(TenantId::default(), evt)
            .await
            .unwrap();
        assert!(starts(&h).is_empty());
    }

    #[tokio::test]
    async fn test_invoke_stamps_correlation() {
        let h = harness();
        let child = register(&h, basic("child", json!({"event": "never/sent"})));
        let run_id = h
            .runner
            .invoke(
                TenantId::default(),
                "child",
                &json!({"data": {"x": 1}}),
                "parent.hash",
            )
            .await
            .unwrap()
            .unwrap();
        let meta = h.state.load_metadata(&run_id).await.unwrap().unwrap();
        assert_eq!(meta.function_id, child.id);
        assert_eq!(meta.event.name, FN_INVOKED);
        assert_eq!(meta.event.data["x"], 1);
        assert_eq!(
            crate::lifecycle::correlation_id(&meta.event).as_deref(),
            Some("parent.hash")
        );

        assert!(matches!(
            h.runner
                .invoke(TenantId::default(), "missing", &json!({}), "p.h")
                .await,
            Err(CoreError::FunctionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cron_fires_once_per_slot() {
        let h = harness();
        register(&h, basic("hourly", json!({"cron": "0 * * * *"})));
        let from = "2030-01-01T10:15:00Z".parse::<DateTime<Utc>>().unwrap();
        let to = "2030-01-01T11:00:30Z".parse::<DateTime<Utc>>().unwrap();

        assert_eq!(h.runner.fire_crons(from, to).await.unwrap().len(), 1);
        assert!(h.runner.fire_crons(from, to).await.unwrap().is_empty());
        let early = "2030-01-01T10:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(h.runner.fire_crons(from, early).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_cancel() {
        let h = harness();
        register(&h, basic("sdk-function-test", json!({"event": "tests/function.test"})));
        let outcome = h
            .runner
            .handle_event(TenantId::default(), Event::new("tests/function.test", json!({})))
            .await
            .unwrap();
        let run_id = outcome.scheduled[0];

        let meta = h.runner.cancel(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Cancelled);
        // Idempotent.
        assert_eq!(h.runner.cancel(&run_id).await.unwrap().status, RunStatus::Cancelled);
        assert!(matches!(
            h.runner.cancel(&RunId::new()).await,
            Err(CoreError::RunNotFound { .. })
        ));
    }
}
