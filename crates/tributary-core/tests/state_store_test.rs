// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Behavior shared by every state store backend.
//!
//! Each check runs against the in-memory store and a fresh SQLite file.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;
use uuid::Uuid;

use tributary_core::error::CoreError;
use tributary_core::ids::{FunctionId, PauseId, RunId, TenantId};
use tributary_core::state::{
    AppendOutcome, ConsumeMode, ConsumeResult, NewRun, Pause, PauseKind, RunStatus,
    idempotency_key,
};
use tributary_core::{Event, MemoryStateStore, SqliteStateStore, StateStore};

const A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

struct Backend {
    store: Arc<dyn StateStore>,
    // Keeps the SQLite file alive for the test.
    _dir: Option<TempDir>,
}

async fn memory() -> Backend {
    Backend {
        store: Arc::new(MemoryStateStore::new()),
        _dir: None,
    }
}

async fn sqlite() -> Backend {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStateStore::from_path(dir.path().join("state.db"))
        .await
        .unwrap();
    Backend {
        store: Arc::new(store),
        _dir: Some(dir),
    }
}

/// Millisecond precision, which every backend round-trips.
fn now() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

fn tenant() -> TenantId {
    TenantId::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
}

fn new_run(tenant: TenantId, event_id: &str) -> NewRun {
    let function_id = FunctionId(Uuid::nil());
    let mut event = Event::new("tests/state.test", json!({"id": event_id}));
    event.id = Some(event_id.to_string());
    NewRun {
        run_id: RunId::new(),
        tenant,
        function_id,
        event,
        events: Vec::new(),
        idempotency_key: idempotency_key(&tenant, event_id, &function_id),
        concurrency_key: Some(format!("slot:{}", event_id)),
        created_at: now(),
    }
}

async fn running(store: &dyn StateStore, tenant: TenantId, event_id: &str) -> RunId {
    let run_id = store.create(new_run(tenant, event_id)).await.unwrap().run_id;
    store
        .set_status(&run_id, RunStatus::Running, None)
        .await
        .unwrap();
    run_id
}

fn pause(run_id: RunId, tenant: TenantId, kind: PauseKind, event: &str, ttl: Duration) -> Pause {
    let created_at = now();
    Pause {
        id: PauseId::new(),
        tenant,
        run_id,
        function_id: FunctionId(Uuid::nil()),
        kind,
        incoming: "step".to_string(),
        resume_step: "step".to_string(),
        data_key: (kind != PauseKind::Cancel).then(|| A.to_string()),
        event: event.to_string(),
        expression: Some("async.data.ok == true".to_string()),
        trigger_event: json!({"name": "tests/state.test", "data": {}}),
        created_at,
        expires_at: created_at + chrono::Duration::from_std(ttl).unwrap(),
        consumed: false,
    }
}

macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod memory_backend {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::memory().await).await;
                }
            )*
        }

        mod sqlite_backend {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::sqlite().await).await;
                }
            )*
        }
    };
}

backend_tests!(
    create_is_idempotent,
    append_is_compare_and_set,
    first_writer_wins,
    terminal_status_is_final,
    attempts_and_flags_persist,
    pause_index_and_blocking,
    consume_exactly_once,
    expired_pause_rejects_events,
    expiry_scan_orders_by_deadline,
    cleanup_releases_pauses_and_slot,
    concurrency_slots,
    rate_limit_windows,
    pause_flips_keep_version,
    consumed_pause_waits_for_delete,
);

async fn create_is_idempotent(b: Backend) {
    let tenant = tenant();
    let first = b.store.create(new_run(tenant, "evt-1")).await.unwrap();
    assert!(first.created);
    let again = b.store.create(new_run(tenant, "evt-1")).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.run_id, first.run_id);

    let meta = b.store.load_metadata(&first.run_id).await.unwrap().unwrap();
    assert_eq!(meta.status, RunStatus::Scheduled);
    assert_eq!(meta.version, 0);
    assert_eq!(meta.event.data["id"], "evt-1");

    assert!(b.store.load(&RunId::new()).await.unwrap().is_none());

    let key = idempotency_key(&tenant, "evt-1", &FunctionId(Uuid::nil()));
    let found = b.store.find_run(&key).await.unwrap().unwrap();
    assert_eq!(found.run_id, first.run_id);
    assert!(b.store.find_run("missing").await.unwrap().is_none());
}

async fn append_is_compare_and_set(b: Backend) {
    let run_id = running(b.store.as_ref(), tenant(), "evt-1").await;
    let version = b.store.load_metadata(&run_id).await.unwrap().unwrap().version;

    let appended = b
        .store
        .append_step(&run_id, A, json!({"data": 1}), version)
        .await
        .unwrap();
    assert_eq!(appended, AppendOutcome::Appended { version: version + 1 });

    let stale = b
        .store
        .append_step(&run_id, B, json!({"data": 2}), version)
        .await
        .unwrap_err();
    match stale {
        CoreError::StateConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, version);
            assert_eq!(actual, version + 1);
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
    assert!(stale_is_transient(&b, &run_id, version).await);

    let state = b.store.load(&run_id).await.unwrap().unwrap();
    assert_eq!(state.stack, vec![A.to_string()]);
    assert_eq!(state.steps[A], json!({"data": 1}));
    assert!(!state.has_step(B));
}

async fn stale_is_transient(b: &Backend, run_id: &RunId, version: u64) -> bool {
    b.store
        .append_step(run_id, B, Value::Null, version)
        .await
        .unwrap_err()
        .is_transient()
}

async fn first_writer_wins(b: Backend) {
    let run_id = running(b.store.as_ref(), tenant(), "evt-1").await;
    let version = b.store.load_metadata(&run_id).await.unwrap().unwrap().version;
    let appended = b
        .store
        .append_step(&run_id, A, json!({"data": "first"}), version)
        .await
        .unwrap();

    let second = b
        .store
        .append_step(&run_id, A, json!({"data": "second"}), appended.version())
        .await
        .unwrap();
    assert_eq!(
        second,
        AppendOutcome::AlreadySet {
            version: appended.version()
        }
    );

    let state = b.store.load(&run_id).await.unwrap().unwrap();
    assert_eq!(state.stack, vec![A.to_string()]);
    assert_eq!(state.steps[A], json!({"data": "first"}));
}

async fn terminal_status_is_final(b: Backend) {
    let run_id = running(b.store.as_ref(), tenant(), "evt-1").await;
    let meta = b
        .store
        .set_status(&run_id, RunStatus::Failed, Some(json!({"message": "broken"})))
        .await
        .unwrap();
    assert_eq!(meta.status, RunStatus::Failed);
    assert_eq!(meta.cause, Some(json!({"message": "broken"})));

    let err = b
        .store
        .set_status(&run_id, RunStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
    let err = b
        .store
        .set_status(&run_id, RunStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));

    // Repeating the current status is a no-op.
    let same = b
        .store
        .set_status(&run_id, RunStatus::Failed, None)
        .await
        .unwrap();
    assert_eq!(same.version, meta.version);

    let missing = b
        .store
        .set_status(&RunId::new(), RunStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(missing, CoreError::RunNotFound { .. }));
}

async fn attempts_and_flags_persist(b: Backend) {
    let run_id = running(b.store.as_ref(), tenant(), "evt-1").await;
    b.store.set_attempt(&run_id, A, 2).await.unwrap();
    b.store.set_request_version(&run_id, 2).await.unwrap();
    b.store.mark_parallel(&run_id).await.unwrap();
    b.store
        .set_output(&run_id, json!({"ok": true}))
        .await
        .unwrap();

    let state = b.store.load(&run_id).await.unwrap().unwrap();
    assert_eq!(state.attempt(A), 2);
    assert_eq!(state.attempt(B), 0);
    assert_eq!(state.meta.request_version, 2);
    assert!(state.meta.disable_immediate_execution);
    assert_eq!(state.meta.output, Some(json!({"ok": true})));
}

async fn pause_index_and_blocking(b: Backend) {
    let tenant = tenant();
    let run_id = running(b.store.as_ref(), tenant, "evt-1").await;

    let cancel = pause(run_id, tenant, PauseKind::Cancel, "cancel/please", Duration::from_secs(60));
    b.store.save_pause(&cancel).await.unwrap();
    let meta = b.store.load_metadata(&run_id).await.unwrap().unwrap();
    assert_eq!(meta.status, RunStatus::Running);

    let wait = pause(run_id, tenant, PauseKind::Wait, "test/resume", Duration::from_secs(60));
    b.store.save_pause(&wait).await.unwrap();
    let meta = b.store.load_metadata(&run_id).await.unwrap().unwrap();
    assert_eq!(meta.status, RunStatus::Paused);

    let found = b.store.pauses_by_event(&tenant, "test/resume").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, wait.id);
    assert_eq!(found[0].expression, wait.expression);
    assert_eq!(found[0].data_key.as_deref(), Some(A));
    assert!(b.store.pauses_by_event(&tenant, "other/event").await.unwrap().is_empty());
    assert!(
        b.store
            .pauses_by_event(&self::tenant(), "test/resume")
            .await
            .unwrap()
            .is_empty()
    );

    let owned = b.store.pauses_for_run(&run_id).await.unwrap();
    assert_eq!(owned.len(), 2);

    b.store.delete_pause(&cancel.id).await.unwrap();
    assert!(b.store.load_pause(&cancel.id).await.unwrap().is_none());
    assert!(b.store.pauses_by_event(&tenant, "cancel/please").await.unwrap().is_empty());
}

async fn consume_exactly_once(b: Backend) {
    let tenant = tenant();
    let run_id = running(b.store.as_ref(), tenant, "evt-1").await;
    let wait = pause(run_id, tenant, PauseKind::Wait, "test/resume", Duration::from_secs(60));
    b.store.save_pause(&wait).await.unwrap();
    let version = b.store.load_metadata(&run_id).await.unwrap().unwrap().version;

    let data = json!({"name": "test/resume", "data": {"ok": true}});
    let first = b
        .store
        .consume_pause(&wait.id, Some(data.clone()), ConsumeMode::Event, now())
        .await
        .unwrap();
    match first {
        ConsumeResult::Consumed(p) => assert_eq!(p.id, wait.id),
        other => panic!("expected consumption, got {:?}", other),
    }

    let second = b
        .store
        .consume_pause(&wait.id, Some(json!("late")), ConsumeMode::Timeout, now())
        .await
        .unwrap();
    assert_eq!(second, ConsumeResult::AlreadyConsumed);
    let unknown = b
        .store
        .consume_pause(&PauseId::new(), None, ConsumeMode::Event, now())
        .await
        .unwrap();
    assert_eq!(unknown, ConsumeResult::AlreadyConsumed);

    let state = b.store.load(&run_id).await.unwrap().unwrap();
    assert_eq!(state.meta.status, RunStatus::Running);
    assert_eq!(state.meta.version, version + 1);
    assert_eq!(state.stack, vec![A.to_string()]);
    assert_eq!(state.steps[A], data);
    assert!(b.store.pauses_by_event(&tenant, "test/resume").await.unwrap().is_empty());
    assert!(b.store.pauses_for_run(&run_id).await.unwrap().is_empty());
}

async fn expired_pause_rejects_events(b: Backend) {
    let tenant = tenant();
    let run_id = running(b.store.as_ref(), tenant, "evt-1").await;
    let wait = pause(run_id, tenant, PauseKind::Wait, "test/resume", Duration::from_secs(1));
    b.store.save_pause(&wait).await.unwrap();

    let later = wait.expires_at + chrono::Duration::seconds(1);
    let by_event = b
        .store
        .consume_pause(&wait.id, Some(json!("event")), ConsumeMode::Event, later)
        .await
        .unwrap();
    assert_eq!(by_event, ConsumeResult::Expired);

    let by_timeout = b
        .store
        .consume_pause(&wait.id, Some(Value::Null), ConsumeMode::Timeout, later)
        .await
        .unwrap();
    assert!(matches!(by_timeout, ConsumeResult::Consumed(_)));

    let state = b.store.load(&run_id).await.unwrap().unwrap();
    assert_eq!(state.steps[A], Value::Null);
    assert_eq!(state.meta.status, RunStatus::Running);
}

async fn expiry_scan_orders_by_deadline(b: Backend) {
    let tenant = tenant();
    let run_id = running(b.store.as_ref(), tenant, "evt-1").await;
    let long = pause(run_id, tenant, PauseKind::Wait, "e/long", Duration::from_secs(20));
    let short = pause(run_id, tenant, PauseKind::Wait, "e/short", Duration::from_secs(10));
    let never = pause(run_id, tenant, PauseKind::Cancel, "e/never", Duration::from_secs(3600));
    for p in [&long, &short, &never] {
        b.store.save_pause(p).await.unwrap();
    }

    let at = now() + chrono::Duration::seconds(30);
    let due: Vec<PauseId> = b
        .store
        .expired_pauses(at, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(due, vec![short.id, long.id]);

    assert_eq!(b.store.expired_pauses(at, 1).await.unwrap().len(), 1);
    assert!(b.store.expired_pauses(now(), 10).await.unwrap().is_empty());
}

async fn cleanup_releases_pauses_and_slot(b: Backend) {
    let tenant = tenant();
    let run = new_run(tenant, "evt-1");
    let key = run.concurrency_key.clone().unwrap();
    let run_id = b.store.create(run).await.unwrap().run_id;
    let other = RunId::new();
    assert!(b.store.acquire_slot(&key, &run_id, 1).await.unwrap());
    assert!(!b.store.acquire_slot(&key, &other, 1).await.unwrap());

    let wait = pause(run_id, tenant, PauseKind::Wait, "test/resume", Duration::from_secs(60));
    b.store.save_pause(&wait).await.unwrap();
    b.store
        .set_status(&run_id, RunStatus::Cancelled, None)
        .await
        .unwrap();
    b.store.cleanup(&run_id).await.unwrap();

    assert!(b.store.pauses_for_run(&run_id).await.unwrap().is_empty());
    assert!(b.store.pauses_by_event(&tenant, "test/resume").await.unwrap().is_empty());
    let late = b
        .store
        .consume_pause(&wait.id, Some(json!("late")), ConsumeMode::Event, now())
        .await
        .unwrap();
    assert_eq!(late, ConsumeResult::AlreadyConsumed);
    assert!(b.store.acquire_slot(&key, &other, 1).await.unwrap());
}

async fn concurrency_slots(b: Backend) {
    let (first, second, third) = (RunId::new(), RunId::new(), RunId::new());
    assert!(b.store.acquire_slot("fn:key", &first, 2).await.unwrap());
    assert!(b.store.acquire_slot("fn:key", &second, 2).await.unwrap());
    assert!(!b.store.acquire_slot("fn:key", &third, 2).await.unwrap());
    // Re-entrant for a holder.
    assert!(b.store.acquire_slot("fn:key", &first, 2).await.unwrap());
    // Keys are independent.
    assert!(b.store.acquire_slot("fn:other", &third, 2).await.unwrap());
}

async fn rate_limit_windows(b: Backend) {
    let period = Duration::from_secs(60);
    let start = DateTime::from_timestamp_millis(1_700_000_040_000).unwrap();
    assert!(b.store.rate_limit("fn:rl", 2, period, start).await.unwrap());
    assert!(b.store.rate_limit("fn:rl", 2, period, start).await.unwrap());
    assert!(!b.store.rate_limit("fn:rl", 2, period, start).await.unwrap());

    let next_window = start + chrono::Duration::seconds(60);
    assert!(b.store.rate_limit("fn:rl", 2, period, next_window).await.unwrap());
}

async fn pause_flips_keep_version(b: Backend) {
    let tenant = tenant();
    let run_id = running(b.store.as_ref(), tenant, "evt-1").await;
    let version = b.store.load_metadata(&run_id).await.unwrap().unwrap().version;

    let wait = pause(run_id, tenant, PauseKind::Wait, "test/resume", Duration::from_secs(60));
    b.store.save_pause(&wait).await.unwrap();
    let meta = b.store.load_metadata(&run_id).await.unwrap().unwrap();
    assert_eq!(meta.status, RunStatus::Paused);
    assert_eq!(meta.version, version);

    // Writing the step data is what moves the version.
    b.store
        .consume_pause(&wait.id, Some(json!(1)), ConsumeMode::Event, now())
        .await
        .unwrap();
    let meta = b.store.load_metadata(&run_id).await.unwrap().unwrap();
    assert_eq!(meta.status, RunStatus::Running);
    assert_eq!(meta.version, version + 1);

    let cancel = pause(run_id, tenant, PauseKind::Cancel, "cancel/please", Duration::from_secs(60));
    b.store.save_pause(&cancel).await.unwrap();
    b.store
        .consume_pause(&cancel.id, None, ConsumeMode::Event, now())
        .await
        .unwrap();
    assert_eq!(
        b.store.load_metadata(&run_id).await.unwrap().unwrap().version,
        version + 1
    );
}

async fn consumed_pause_waits_for_delete(b: Backend) {
    let tenant = tenant();
    let run_id = running(b.store.as_ref(), tenant, "evt-1").await;
    let wait = pause(run_id, tenant, PauseKind::Wait, "test/resume", Duration::from_secs(60));
    b.store.save_pause(&wait).await.unwrap();
    b.store
        .consume_pause(&wait.id, Some(json!(1)), ConsumeMode::Event, now())
        .await
        .unwrap();

    let stranded = b.store.consumed_pauses(10).await.unwrap();
    assert_eq!(stranded.len(), 1);
    assert_eq!(stranded[0].id, wait.id);
    assert!(stranded[0].consumed);

    // Saving it again neither re-opens it nor pauses the run.
    b.store.save_pause(&wait).await.unwrap();
    assert!(b.store.load_pause(&wait.id).await.unwrap().unwrap().consumed);
    assert!(b.store.pauses_for_run(&run_id).await.unwrap().is_empty());
    assert_eq!(
        b.store.load_metadata(&run_id).await.unwrap().unwrap().status,
        RunStatus::Running
    );

    b.store.delete_pause(&wait.id).await.unwrap();
    assert!(b.store.consumed_pauses(10).await.unwrap().is_empty());
}
