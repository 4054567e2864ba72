// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory state store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    AppendOutcome, ConsumeMode, ConsumeResult, Created, NewRun, Pause, RunMetadata, RunState,
    RunStatus, StateStore, window_start,
};
use crate::error::{CoreError, Result};
use crate::ids::{PauseId, RunId, TenantId};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<RunId, RunState>,
    idempotency: HashMap<String, RunId>,
    pauses: HashMap<PauseId, Pause>,
    by_event: HashMap<(TenantId, String), BTreeSet<(DateTime<Utc>, PauseId)>>,
    by_expiry: BTreeSet<(DateTime<Utc>, PauseId)>,
    slots: HashMap<String, HashSet<RunId>>,
    windows: HashMap<String, (i64, u32)>,
}

impl Inner {
    fn run_mut(&mut self, run_id: &RunId) -> Result<&mut RunState> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    fn unindex(&mut self, pause: &Pause) {
        let key = (pause.tenant, pause.event.clone());
        if let Some(set) = self.by_event.get_mut(&key) {
            set.remove(&(pause.created_at, pause.id));
            if set.is_empty() {
                self.by_event.remove(&key);
            }
        }
        self.by_expiry.remove(&(pause.expires_at, pause.id));
    }

    fn has_blocking_pause(&self, run_id: &RunId) -> bool {
        self.pauses
            .values()
            .any(|p| p.run_id == *run_id && !p.consumed && p.kind.blocks_run())
    }
}

/// State store backed by process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::database("lock", "state store mutex poisoned"))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create(&self, run: NewRun) -> Result<Created> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.idempotency.get(&run.idempotency_key) {
            return Ok(Created {
                run_id: *existing,
                created: false,
            });
        }
        let run_id = run.run_id;
        inner.idempotency.insert(run.idempotency_key.clone(), run_id);
        inner.runs.insert(
            run_id,
            RunState {
                meta: run.into_metadata(),
                stack: Vec::new(),
                steps: HashMap::new(),
                attempts: HashMap::new(),
            },
        );
        Ok(Created {
            run_id,
            created: true,
        })
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<RunState>> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn load_metadata(&self, run_id: &RunId) -> Result<Option<RunMetadata>> {
        Ok(self.lock()?.runs.get(run_id).map(|r| r.meta.clone()))
    }

    async fn find_run(&self, idempotency_key: &str) -> Result<Option<RunMetadata>> {
        let inner = self.lock()?;
        Ok(inner
            .idempotency
            .get(idempotency_key)
            .and_then(|id| inner.runs.get(id))
            .map(|r| r.meta.clone()))
    }

    async fn append_step(
        &self,
        run_id: &RunId,
        hash: &str,
        data: Value,
        expected_version: u64,
    ) -> Result<AppendOutcome> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        if run.meta.version != expected_version {
            return Err(CoreError::StateConflict {
                run_id: run_id.to_string(),
                expected: expected_version,
                actual: run.meta.version,
            });
        }
        if run.steps.contains_key(hash) {
            return Ok(AppendOutcome::AlreadySet {
                version: run.meta.version,
            });
        }
        run.steps.insert(hash.to_string(), data);
        run.stack.push(hash.to_string());
        run.meta.version += 1;
        run.meta.updated_at = Utc::now();
        Ok(AppendOutcome::Appended {
            version: run.meta.version,
        })
    }

    async fn set_attempt(&self, run_id: &RunId, hash: &str, attempt: u32) -> Result<()> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        run.attempts.insert(hash.to_string(), attempt);
        Ok(())
    }

    async fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        cause: Option<Value>,
    ) -> Result<RunMetadata> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        if run.meta.status == status {
            return Ok(run.meta.clone());
        }
        if !run.meta.status.can_transition_to(status) {
            return Err(CoreError::InvalidTransition {
                run_id: run_id.to_string(),
                from: run.meta.status.to_string(),
                to: status.to_string(),
            });
        }
        run.meta.status = status;
        if cause.is_some() {
            run.meta.cause = cause;
        }
        run.meta.version += 1;
        run.meta.updated_at = Utc::now();
        Ok(run.meta.clone())
    }

    async fn set_output(&self, run_id: &RunId, output: Value) -> Result<()> {
        let mut inner = self.lock()?;
        inner.run_mut(run_id)?.meta.output = Some(output);
        Ok(())
    }

    async fn set_request_version(&self, run_id: &RunId, version: i32) -> Result<()> {
        let mut inner = self.lock()?;
        inner.run_mut(run_id)?.meta.request_version = version;
        Ok(())
    }

    async fn mark_parallel(&self, run_id: &RunId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.run_mut(run_id)?.meta.disable_immediate_execution = true;
        Ok(())
    }

    async fn save_pause(&self, pause: &Pause) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.pauses.get(&pause.id).is_some_and(|p| p.consumed) {
            return Ok(());
        }
        let run = inner.run_mut(&pause.run_id)?;
        if pause.kind.blocks_run()
            && matches!(run.meta.status, RunStatus::Scheduled | RunStatus::Running)
        {
            run.meta.status = RunStatus::Paused;
            run.meta.updated_at = Utc::now();
        }

        if let Some(previous) = inner.pauses.insert(pause.id, pause.clone()) {
            inner.unindex(&previous);
        }
        if !pause.consumed {
            inner
                .by_event
                .entry((pause.tenant, pause.event.clone()))
                .or_default()
                .insert((pause.created_at, pause.id));
            inner.by_expiry.insert((pause.expires_at, pause.id));
        }
        Ok(())
    }

    async fn load_pause(&self, id: &PauseId) -> Result<Option<Pause>> {
        Ok(self.lock()?.pauses.get(id).cloned())
    }

    async fn pauses_by_event(&self, tenant: &TenantId, event: &str) -> Result<Vec<Pause>> {
        let inner = self.lock()?;
        let Some(ids) = inner.by_event.get(&(*tenant, event.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|(_, id)| inner.pauses.get(id))
            .filter(|p| !p.consumed)
            .cloned()
            .collect())
    }

    async fn pauses_for_run(&self, run_id: &RunId) -> Result<Vec<Pause>> {
        let inner = self.lock()?;
        let mut pauses: Vec<Pause> = inner
            .pauses
            .values()
            .filter(|p| p.run_id == *run_id && !p.consumed)
            .cloned()
            .collect();
        pauses.sort_by_key(|p| (p.created_at, p.id));
        Ok(pauses)
    }

    async fn consume_pause(
        &self,
        id: &PauseId,
        data: Option<Value>,
        mode: ConsumeMode,
        now: DateTime<Utc>,
    ) -> Result<ConsumeResult> {
        let mut inner = self.lock()?;
        let Some(pause) = inner.pauses.get(id).cloned() else {
            return Ok(ConsumeResult::AlreadyConsumed);
        };
        if pause.consumed {
            return Ok(ConsumeResult::AlreadyConsumed);
        }
        if mode == ConsumeMode::Event && pause.is_expired(now) {
            return Ok(ConsumeResult::Expired);
        }

        if let Some(stored) = inner.pauses.get_mut(id) {
            stored.consumed = true;
        }
        inner.unindex(&pause);
        let still_blocked = inner.has_blocking_pause(&pause.run_id);

        if let Some(run) = inner.runs.get_mut(&pause.run_id) {
            if let (Some(key), Some(data)) = (&pause.data_key, data)
                && !run.steps.contains_key(key)
            {
                run.steps.insert(key.clone(), data);
                run.stack.push(key.clone());
                run.meta.version += 1;
            }
            if run.meta.status == RunStatus::Paused && !still_blocked {
                run.meta.status = RunStatus::Running;
            }
            run.meta.updated_at = now;
        }
        Ok(ConsumeResult::Consumed(pause))
    }

    async fn delete_pause(&self, id: &PauseId) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(pause) = inner.pauses.remove(id) {
            inner.unindex(&pause);
        }
        Ok(())
    }

    async fn consumed_pauses(&self, limit: usize) -> Result<Vec<Pause>> {
        let inner = self.lock()?;
        let mut pauses: Vec<Pause> = inner
            .pauses
            .values()
            .filter(|p| p.consumed)
            .cloned()
            .collect();
        pauses.sort_by_key(|p| (p.created_at, p.id));
        pauses.truncate(limit);
        Ok(pauses)
    }

    async fn expired_pauses(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Pause>> {
        let inner = self.lock()?;
        Ok(inner
            .by_expiry
            .iter()
            .take_while(|(at, _)| *at <= now)
            .filter_map(|(_, id)| inner.pauses.get(id))
            .filter(|p| !p.consumed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn cleanup(&self, run_id: &RunId) -> Result<()> {
        let mut inner = self.lock()?;
        let owned: Vec<PauseId> = inner
            .pauses
            .values()
            .filter(|p| p.run_id == *run_id)
            .map(|p| p.id)
            .collect();
        for id in owned {
            if let Some(pause) = inner.pauses.remove(&id) {
                inner.unindex(&pause);
            }
        }

        let slot = inner
            .runs
            .get(run_id)
            .and_then(|r| r.meta.concurrency_key.clone());
        if let Some(key) = slot
            && let Some(holders) = inner.slots.get_mut(&key)
        {
            holders.remove(run_id);
            if holders.is_empty() {
                inner.slots.remove(&key);
            }
        }
        Ok(())
    }

    async fn acquire_slot(&self, key: &str, run_id: &RunId, limit: u32) -> Result<bool> {
        let mut inner = self.lock()?;
        let holders = inner.slots.entry(key.to_string()).or_default();
        if holders.contains(run_id) {
            return Ok(true);
        }
        if holders.len() >= limit as usize {
            return Ok(false);
        }
        holders.insert(*run_id);
        Ok(true)
    }

    async fn rate_limit(
        &self,
        key: &str,
        limit: u32,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let window = window_start(now, period);
        let entry = inner.windows.entry(key.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        if entry.1 >= limit {
            return Ok(false);
        }
        entry.1 += 1;
        Ok(true)
    }
}
