// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pause creation, matching and resumption.
//!
//! Arriving events are matched against the `(tenant, event)` index. Each
//! pause's expression sees the run's triggering event as `event` and the
//! arriving one as `async`. Consumption goes through
//! [`StateStore::consume_pause`], so a pause resumes its run at most once no
//! matter how many replicas race on the same event or timeout.
//!
//! A consumed pause stays stored until its resumption is handed off (the
//! continue item queued, or the run cancelled). The expiry scan replays the
//! hand-off for any consumed pause left behind by a failed enqueue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::event::Event;
use crate::expressions::{Env, ExpressionCache};
use crate::ids::{PauseId, RunId, TenantId};
use crate::lifecycle::Lifecycle;
use crate::opcode::{INVOKE_TIMEOUT_ERROR, UserError};
use crate::queue::{ItemKind, Queue, QueueItem};
use crate::state::{ConsumeMode, ConsumeResult, Pause, PauseKind, StateStore};

/// What consuming a pause did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// The run was queued to continue at the pause's resume step.
    Continued { run_id: RunId, pause_id: PauseId },
    /// A cancellation rule fired.
    Cancelled { run_id: RunId },
}

pub struct PauseManager {
    state: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    lifecycle: Arc<Lifecycle>,
    expressions: &'static ExpressionCache,
}

impl PauseManager {
    pub fn new(
        state: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        lifecycle: Arc<Lifecycle>,
        expressions: &'static ExpressionCache,
    ) -> Self {
        Self {
            state,
            queue,
            lifecycle,
            expressions,
        }
    }

    /// Persist a pause and schedule its timeout.
    ///
    /// Idempotent on the pause ID: a pause that already exists keeps its
    /// deadline, and one already consumed is left alone. Cancellation pauses
    /// get no timeout item: the expiry scan and run cleanup remove them.
    pub async fn create(&self, pause: &Pause) -> Result<()> {
        let pause = match self.state.load_pause(&pause.id).await? {
            Some(existing) if existing.consumed => return Ok(()),
            Some(existing) => existing,
            None => pause.clone(),
        };
        self.state.save_pause(&pause).await?;
        if pause.kind != PauseKind::Cancel {
            let item = QueueItem::new(
                ItemKind::PauseTimeout,
                pause.tenant,
                pause.run_id,
                pause.function_id,
            )
            .step(pause.resume_step.clone())
            .pause(pause.id)
            .at(pause.expires_at)
            .job_id(format!("timeout:{}", pause.id));
            self.queue.enqueue(item).await?;
        }
        debug!(
            pause_id = %pause.id,
            run_id = %pause.run_id,
            event = %pause.event,
            kind = pause.kind.as_str(),
            "Pause created"
        );
        Ok(())
    }

    /// Resume every pause waiting on `event`. Pauses are visited oldest
    /// first; each one is consumed independently.
    #[instrument(skip(self, event), fields(event = %event.name))]
    pub async fn handle_event(&self, tenant: TenantId, event: &Event) -> Result<Vec<Resumption>> {
        let pauses = self.state.pauses_by_event(&tenant, &event.name).await?;
        if pauses.is_empty() {
            return Ok(Vec::new());
        }

        let arriving = event.to_value();
        let now = Utc::now();
        let mut resumed = Vec::new();
        for pause in pauses {
            if is_own_trigger(&pause, event) {
                continue;
            }
            if let Some(expr) = &pause.expression {
                let env = Env::new()
                    .event(&pause.trigger_event)
                    .async_event(&arriving);
                if !self.expressions.matches(expr, &env) {
                    continue;
                }
            }
            if let Some(r) = self
                .consume(&pause, ConsumeMode::Event, now, Some(event))
                .await?
            {
                resumed.push(r);
            }
        }
        Ok(resumed)
    }

    /// Time out a pause whose deadline has passed. A no-op if it was
    /// consumed, removed or is not yet due.
    pub async fn expire(&self, pause_id: &PauseId, now: DateTime<Utc>) -> Result<Option<Resumption>> {
        let Some(pause) = self.state.load_pause(pause_id).await? else {
            return Ok(None);
        };
        if pause.consumed || !pause.is_expired(now) {
            return Ok(None);
        }
        if pause.kind == PauseKind::Cancel {
            self.state.delete_pause(pause_id).await?;
            return Ok(None);
        }
        self.consume(&pause, ConsumeMode::Timeout, now, None).await
    }

    /// Time out up to `limit` overdue pauses, then finish up to `limit`
    /// consumed pauses whose hand-off failed. Returns how many resumed.
    pub async fn scan_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut resumed = 0;
        for pause in self.state.expired_pauses(now, limit).await? {
            if self.expire(&pause.id, now).await?.is_some() {
                resumed += 1;
            }
        }
        Ok(resumed + self.recover(limit).await?)
    }

    /// Replay the hand-off of consumed pauses still in the store.
    pub async fn recover(&self, limit: usize) -> Result<usize> {
        let stranded = self.state.consumed_pauses(limit).await?;
        for pause in &stranded {
            warn!(run_id = %pause.run_id, pause_id = %pause.id, "Re-queueing consumed pause");
            self.hand_off(pause, None).await?;
        }
        Ok(stranded.len())
    }

    async fn consume(
        &self,
        pause: &Pause,
        mode: ConsumeMode,
        now: DateTime<Utc>,
        event: Option<&Event>,
    ) -> Result<Option<Resumption>> {
        let data = resume_data(pause.kind, event);
        match self.state.consume_pause(&pause.id, data, mode, now).await? {
            ConsumeResult::Consumed(_) => {}
            ConsumeResult::AlreadyConsumed | ConsumeResult::Expired => {
                debug!(pause_id = %pause.id, "Pause already consumed or expired");
                return Ok(None);
            }
        }
        info!(
            run_id = %pause.run_id,
            pause_id = %pause.id,
            timeout = mode == ConsumeMode::Timeout,
            "Pause consumed"
        );
        self.hand_off(pause, event).await.map(Some)
    }

    /// Continue or cancel the run of a consumed pause, then forget the pause.
    ///
    /// Safe to repeat: the continue item is keyed by the pause ID and
    /// cancelling a finished run is a no-op.
    async fn hand_off(&self, pause: &Pause, event: Option<&Event>) -> Result<Resumption> {
        let resumption = if pause.kind == PauseKind::Cancel {
            info!(run_id = %pause.run_id, pause_id = %pause.id, "Cancellation rule matched");
            self.lifecycle.cancel(&pause.run_id, event).await?;
            Resumption::Cancelled {
                run_id: pause.run_id,
            }
        } else {
            let item = QueueItem::new(
                ItemKind::ContinueRun,
                pause.tenant,
                pause.run_id,
                pause.function_id,
            )
            .step(pause.resume_step.clone())
            .job_id(format!("resume:{}", pause.id));
            self.queue.enqueue(item).await?;
            Resumption::Continued {
                run_id: pause.run_id,
                pause_id: pause.id,
            }
        };
        self.state.delete_pause(&pause.id).await?;
        Ok(resumption)
    }
}

/// A run's own triggering event never resumes its pauses.
fn is_own_trigger(pause: &Pause, event: &Event) -> bool {
    match (&event.id, pause.trigger_event.get("id").and_then(Value::as_str)) {
        (Some(arriving), Some(trigger)) => arriving == trigger,
        _ => false,
    }
}

/// Durable value written for the pause's step. `event` is `None` on timeout.
fn resume_data(kind: PauseKind, event: Option<&Event>) -> Option<Value> {
    match (kind, event) {
        (PauseKind::Cancel, _) => None,
        (PauseKind::Wait, Some(evt)) => Some(evt.to_value()),
        (PauseKind::Wait, None) => Some(Value::Null),
        (PauseKind::Invoke, Some(evt)) => Some(match evt.data.get("error") {
            Some(error) => json!({ "error": error }),
            None => json!({ "data": evt.data.get("result").cloned().unwrap_or(Value::Null) }),
        }),
        (PauseKind::Invoke, None) => Some(json!({
            "error": UserError::new(
                INVOKE_TIMEOUT_ERROR,
                "Timed out waiting for invoked function to complete",
            )
            .to_value()
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingSink;
    use crate::ids::FunctionId;
    use crate::queue::{FlakyQueue, MemoryQueue};
    use crate::state::{MemoryStateStore, NewRun, RunStatus};
    use std::time::Duration;

    struct Harness {
        state: Arc<MemoryStateStore>,
        queue: Arc<MemoryQueue>,
        flaky: FlakyQueue,
        pauses: PauseManager,
        run_id: RunId,
        trigger: Event,
    }

    async fn harness() -> Harness {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let flaky = FlakyQueue::new(queue.clone(), ItemKind::ContinueRun, 0);
        let lifecycle = Arc::new(Lifecycle::new(state.clone(), Arc::new(RecordingSink::default())));
        let pauses = PauseManager::new(
            state.clone(),
            Arc::new(flaky.clone()),
            lifecycle,
            ExpressionCache::global(),
        );

        let mut trigger = Event::new("tests/wait.test", json!({"id": "123"}));
        trigger.stamp(Utc::now());
        let run_id = RunId::new();
        state
            .create(NewRun {
                run_id,
                tenant: TenantId::default(),
                function_id: FunctionId::from_canonical(b"wait"),
                event: trigger.clone(),
                events: Vec::new(),
                idempotency_key: run_id.to_string(),
                concurrency_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        state
            .set_status(&run_id, RunStatus::Running, None)
            .await
            .unwrap();
        Harness {
            state,
            queue,
            flaky,
            pauses,
            run_id,
            trigger,
        }
    }

    fn pause(h: &Harness, kind: PauseKind, event: &str, expression: Option<&str>, ttl: Duration) -> Pause {
        let now = Utc::now();
        Pause {
            id: PauseId::new(),
            tenant: TenantId::default(),
            run_id: h.run_id,
            function_id: FunctionId::from_canonical(b"wait"),
            kind,
            incoming: "step".into(),
            resume_step: "step".into(),
            data_key: (kind != PauseKind::Cancel).then(|| "a".repeat(40)),
            event: event.into(),
            expression: expression.map(str::to_string),
            trigger_event: h.trigger.to_value(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap(),
            consumed: false,
        }
    }

    fn arriving(name: &str, data: Value) -> Event {
        let mut evt = Event::new(name, data);
        evt.stamp(Utc::now());
        evt
    }

    #[tokio::test]
    async fn test_matching_event_resumes_once() {
        let h = harness().await;
        let p = pause(
            &h,
            PauseKind::Wait,
            "test/resume",
            Some("async.data.resume == true && async.data.id == event.data.id"),
            Duration::from_secs(10),
        );
        h.pauses.create(&p).await.unwrap();
        assert_eq!(
            h.state.load_metadata(&h.run_id).await.unwrap().unwrap().status,
            RunStatus::Paused
        );

        let unrelated = arriving("test/resume", json!({"id": "other"}));
        assert!(
            h.pauses
                .handle_event(TenantId::default(), &unrelated)
                .await
                .unwrap()
                .is_empty()
        );

        let matching = arriving("test/resume", json!({"id": "123", "resume": true}));
        let resumed = h
            .pauses
            .handle_event(TenantId::default(), &matching)
            .await
            .unwrap();
        assert_eq!(
            resumed,
            vec![Resumption::Continued {
                run_id: h.run_id,
                pause_id: p.id
            }]
        );

        let state = h.state.load(&h.run_id).await.unwrap().unwrap();
        assert_eq!(state.meta.status, RunStatus::Running);
        assert_eq!(state.steps[&"a".repeat(40)], matching.to_value());

        // A replayed event finds nothing left to consume.
        assert!(
            h.pauses
                .handle_event(TenantId::default(), &matching)
                .await
                .unwrap()
                .is_empty()
        );
        let kinds: Vec<ItemKind> = h.queue.pending().iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&ItemKind::ContinueRun));
        assert!(kinds.contains(&ItemKind::PauseTimeout));
    }

    #[tokio::test]
    async fn test_timeout_writes_null_and_event_after_is_ignored() {
        let h = harness().await;
        let p = pause(&h, PauseKind::Wait, "test/resume", None, Duration::ZERO);
        h.pauses.create(&p).await.unwrap();

        let late = arriving("test/resume", json!({}));
        assert!(
            h.pauses
                .handle_event(TenantId::default(), &late)
                .await
                .unwrap()
                .is_empty()
        );

        let resumed = h.pauses.expire(&p.id, Utc::now()).await.unwrap();
        assert!(matches!(resumed, Some(Resumption::Continued { .. })));
        let state = h.state.load(&h.run_id).await.unwrap().unwrap();
        assert_eq!(state.steps[&"a".repeat(40)], Value::Null);

        // The scheduled timeout item and the scanner both find it gone.
        assert!(h.pauses.expire(&p.id, Utc::now()).await.unwrap().is_none());
        assert_eq!(h.pauses.scan_expired(Utc::now(), 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invoke_results_are_wrapped() {
        let h = harness().await;
        let p = pause(&h, PauseKind::Invoke, "inngest/function.finished", None, Duration::from_secs(60));
        h.pauses.create(&p).await.unwrap();

        let finished = arriving("inngest/function.finished", json!({"run_id": "child", "result": {"ok": 1}}));
        h.pauses
            .handle_event(TenantId::default(), &finished)
            .await
            .unwrap();
        let state = h.state.load(&h.run_id).await.unwrap().unwrap();
        assert_eq!(state.steps[&"a".repeat(40)], json!({"data": {"ok": 1}}));
    }

    #[tokio::test]
    async fn test_invoke_timeout_error() {
        let data = resume_data(PauseKind::Invoke, None).unwrap();
        assert_eq!(data["error"]["name"], INVOKE_TIMEOUT_ERROR);
        assert_eq!(resume_data(PauseKind::Cancel, None), None);
    }

    #[tokio::test]
    async fn test_cancel_pause_cancels_run() {
        let h = harness().await;
        let p = pause(
            &h,
            PauseKind::Cancel,
            "cancel/please",
            Some("async.data.request_id == event.data.id"),
            Duration::from_secs(60),
        );
        h.pauses.create(&p).await.unwrap();
        assert_eq!(
            h.state.load_metadata(&h.run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );

        let miss = arriving("cancel/please", json!({"request_id": "12345"}));
        assert!(
            h.pauses
                .handle_event(TenantId::default(), &miss)
                .await
                .unwrap()
                .is_empty()
        );
        let hit = arriving("cancel/please", json!({"request_id": "123"}));
        let resumed = h
            .pauses
            .handle_event(TenantId::default(), &hit)
            .await
            .unwrap();
        assert_eq!(resumed, vec![Resumption::Cancelled { run_id: h.run_id }]);
        assert_eq!(
            h.state.load_metadata(&h.run_id).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_trigger_event_never_matches_its_own_run() {
        let h = harness().await;
        let p = pause(&h, PauseKind::Cancel, "tests/wait.test", None, Duration::from_secs(60));
        h.pauses.create(&p).await.unwrap();
        assert!(
            h.pauses
                .handle_event(TenantId::default(), &h.trigger)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_failed_resume_enqueue_is_recovered_by_scan() {
        let h = harness().await;
        let p = pause(&h, PauseKind::Wait, "test/resume", None, Duration::from_secs(60));
        h.pauses.create(&p).await.unwrap();

        h.flaky.fail_next(1);
        let evt = arriving("test/resume", json!({}));
        assert!(
            h.pauses
                .handle_event(TenantId::default(), &evt)
                .await
                .is_err()
        );
        let continues = |q: &MemoryQueue| {
            q.pending()
                .into_iter()
                .filter(|i| i.kind == ItemKind::ContinueRun)
                .collect::<Vec<_>>()
        };
        assert!(continues(&h.queue).is_empty());
        assert!(h.state.load_pause(&p.id).await.unwrap().unwrap().consumed);

        assert_eq!(h.pauses.scan_expired(Utc::now(), 10).await.unwrap(), 1);
        let items = continues(&h.queue);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].job_id.as_deref(), Some(format!("resume:{}", p.id).as_str()));
        assert!(h.state.load_pause(&p.id).await.unwrap().is_none());
        assert_eq!(h.pauses.scan_expired(Utc::now(), 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_on_pause_id() {
        let h = harness().await;
        let p = pause(&h, PauseKind::Wait, "test/resume", None, Duration::from_secs(60));
        h.pauses.create(&p).await.unwrap();

        let mut again = p.clone();
        again.expires_at = p.expires_at + chrono::Duration::hours(1);
        h.pauses.create(&again).await.unwrap();
        let stored = h.state.pauses_for_run(&h.run_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].expires_at, p.expires_at);
        let timeouts = h
            .queue
            .pending()
            .into_iter()
            .filter(|i| i.kind == ItemKind::PauseTimeout)
            .count();
        assert_eq!(timeouts, 1);

        // Once consumed, replaying the create does not re-open it.
        h.flaky.fail_next(1);
        let evt = arriving("test/resume", json!({}));
        assert!(h.pauses.handle_event(TenantId::default(), &evt).await.is_err());
        h.pauses.create(&p).await.unwrap();
        assert!(h.state.pauses_for_run(&h.run_id).await.unwrap().is_empty());
        assert_eq!(
            h.state.load_metadata(&h.run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }
}
