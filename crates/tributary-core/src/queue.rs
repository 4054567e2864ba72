// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work queue.
//!
//! The executor consumes [`QueueItem`]s through the [`Queue`] trait, which
//! promises at-least-once delivery with a `lease → ack | nack(retry_at)`
//! cycle. A lease that is neither acked nor nacked before it expires is
//! delivered again.
//!
//! [`MemoryQueue`] is the in-process implementation: delay-aware, with
//! job-key de-duplication of pending items. [`FlakyQueue`] wraps it and
//! rejects chosen enqueues, for exercising recovery paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::function::DEFAULT_STEP_ID;
use crate::ids::{FunctionId, PauseId, RunId, TenantId};

/// What a queue item asks the executor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    StartRun,
    ContinueRun,
    PauseTimeout,
    Cancellation,
}

/// One unit of executor work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub kind: ItemKind,
    pub tenant: TenantId,
    pub run_id: RunId,
    pub function_id: FunctionId,
    /// Step definition to invoke.
    pub step_id: String,
    /// Planned step hash to execute (`stepId` query parameter), if any.
    pub step_hash: Option<String>,
    /// Zero-based attempt of this item.
    pub attempt: u32,
    pub earliest_run_at: DateTime<Utc>,
    /// Pause a `PauseTimeout` item refers to.
    pub pause_id: Option<PauseId>,
    /// Sleep step recorded as finished when this item runs.
    pub wake_step: Option<String>,
    /// De-duplication key; a second pending item with the same key is dropped.
    pub job_id: Option<String>,
}

impl QueueItem {
    pub fn new(kind: ItemKind, tenant: TenantId, run_id: RunId, function_id: FunctionId) -> Self {
        Self {
            kind,
            tenant,
            run_id,
            function_id,
            step_id: DEFAULT_STEP_ID.to_string(),
            step_hash: None,
            attempt: 0,
            earliest_run_at: Utc::now(),
            pause_id: None,
            wake_step: None,
            job_id: None,
        }
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = step_id.into();
        self
    }

    pub fn step_hash(mut self, hash: impl Into<String>) -> Self {
        self.step_hash = Some(hash.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.earliest_run_at = at;
        self
    }

    pub fn pause(mut self, pause_id: PauseId) -> Self {
        self.pause_id = Some(pause_id);
        self
    }

    pub fn wake(mut self, hash: impl Into<String>) -> Self {
        self.wake_step = Some(hash.into());
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// A leased item. Hand it back through `ack` or `nack`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub item: QueueItem,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Add an item. Returns false when a pending item has the same job ID.
    async fn enqueue(&self, item: QueueItem) -> Result<bool>;

    /// Wait up to `wait` for a due item and lease it for `lease_for`.
    async fn lease(&self, wait: Duration, lease_for: Duration) -> Result<Option<Lease>>;

    /// The item is done.
    async fn ack(&self, lease: &Lease) -> Result<()>;

    /// Return the item with a new attempt number, due at `retry_at`.
    async fn nack(&self, lease: &Lease, attempt: u32, retry_at: DateTime<Utc>) -> Result<()>;

    /// Pending plus leased items.
    async fn len(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeMap<(DateTime<Utc>, u64), QueueItem>,
    leased: HashMap<u64, (QueueItem, DateTime<Utc>)>,
    jobs: HashSet<String>,
}

impl QueueState {
    /// Put expired leases back so another worker can take them.
    fn reclaim(&mut self, now: DateTime<Utc>, seq: &AtomicU64) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, (_, until))| *until <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some((item, _)) = self.leased.remove(&token) {
                debug!(run_id = %item.run_id, kind = ?item.kind, "Lease expired, redelivering");
                self.ready
                    .insert((now, seq.fetch_add(1, Ordering::Relaxed)), item);
            }
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.ready.keys().next().map(|(at, _)| *at)
    }
}

/// In-process queue.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    seq: AtomicU64,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state.lock().map_err(|_| CoreError::QueueError {
            operation: "lock".to_string(),
            details: "queue mutex poisoned".to_string(),
        })
    }

    fn try_lease(&self, lease_for: Duration) -> Result<(Option<Lease>, Option<DateTime<Utc>>)> {
        let now = Utc::now();
        let mut state = self.lock()?;
        state.reclaim(now, &self.seq);

        let due = state.ready.keys().next().copied().filter(|(at, _)| *at <= now);
        let Some(key) = due else {
            return Ok((None, state.next_due()));
        };
        let Some(item) = state.ready.remove(&key) else {
            return Ok((None, state.next_due()));
        };

        let expires_at = now + chrono::Duration::from_std(lease_for).unwrap_or(chrono::Duration::hours(3));
        let token = self.seq.fetch_add(1, Ordering::Relaxed);
        state.leased.insert(token, (item.clone(), expires_at));
        Ok((
            Some(Lease {
                item,
                token,
                expires_at,
            }),
            None,
        ))
    }

    /// Items waiting to be leased, in due order. For inspection in tests.
    pub fn pending(&self) -> Vec<QueueItem> {
        self.lock()
            .map(|s| s.ready.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<bool> {
        {
            let mut state = self.lock()?;
            if let Some(job) = &item.job_id
                && !state.jobs.insert(job.clone())
            {
                debug!(job_id = %job, "Duplicate job dropped");
                return Ok(false);
            }
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            state.ready.insert((item.earliest_run_at, seq), item);
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn lease(&self, wait: Duration, lease_for: Duration) -> Result<Option<Lease>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let (lease, next_due) = self.try_lease(lease_for)?;
            if lease.is_some() {
                return Ok(lease);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut until = deadline;
            if let Some(due) = next_due {
                let delta = (due - Utc::now()).to_std().unwrap_or_default();
                until = until.min(now + delta);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let mut state = self.lock()?;
        if let Some((item, _)) = state.leased.remove(&lease.token)
            && let Some(job) = &item.job_id
        {
            state.jobs.remove(job);
        }
        Ok(())
    }

    async fn nack(&self, lease: &Lease, attempt: u32, retry_at: DateTime<Utc>) -> Result<()> {
        {
            let mut state = self.lock()?;
            let Some((mut item, _)) = state.leased.remove(&lease.token) else {
                return Ok(());
            };
            item.attempt = attempt;
            item.earliest_run_at = retry_at;
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            state.ready.insert((retry_at, seq), item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.ready.len() + state.leased.len())
    }
}

/// A [`MemoryQueue`] whose next `n` enqueues of one kind fail with
/// [`CoreError::QueueError`]. Everything else passes through.
#[derive(Debug, Clone)]
pub struct FlakyQueue {
    inner: Arc<MemoryQueue>,
    kind: ItemKind,
    failures: Arc<AtomicU32>,
}

impl FlakyQueue {
    pub fn new(inner: Arc<MemoryQueue>, kind: ItemKind, failures: u32) -> Self {
        Self {
            inner,
            kind,
            failures: Arc::new(AtomicU32::new(failures)),
        }
    }

    /// Arm another `n` failures.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &Arc<MemoryQueue> {
        &self.inner
    }
}

#[async_trait]
impl Queue for FlakyQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<bool> {
        if item.kind == self.kind
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            debug!(run_id = %item.run_id, kind = ?item.kind, "Injected enqueue failure");
            return Err(CoreError::QueueError {
                operation: "enqueue".to_string(),
                details: format!("injected failure for {:?}", item.kind),
            });
        }
        self.inner.enqueue(item).await
    }

    async fn lease(&self, wait: Duration, lease_for: Duration) -> Result<Option<Lease>> {
        self.inner.lease(wait, lease_for).await
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        self.inner.ack(lease).await
    }

    async fn nack(&self, lease: &Lease, attempt: u32, retry_at: DateTime<Utc>) -> Result<()> {
        self.inner.nack(lease, attempt, retry_at).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: ItemKind) -> QueueItem {
        QueueItem::new(kind, TenantId::default(), RunId::new(), FunctionId::from_canonical(b"f"))
    }

    #[tokio::test]
    async fn test_lease_ack_cycle() {
        let queue = MemoryQueue::new();
        assert!(queue.enqueue(item(ItemKind::StartRun)).await.unwrap());

        let lease = queue
            .lease(Duration::from_millis(10), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.item.kind, ItemKind::StartRun);
        assert_eq!(queue.len().await.unwrap(), 1);

        queue.ack(&lease).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
        assert!(
            queue
                .lease(Duration::from_millis(10), Duration::from_secs(60))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_delayed_items_wait_until_due() {
        let queue = MemoryQueue::new();
        let due = Utc::now() + chrono::Duration::milliseconds(150);
        queue.enqueue(item(ItemKind::ContinueRun).at(due)).await.unwrap();

        assert!(
            queue
                .lease(Duration::from_millis(20), Duration::from_secs(60))
                .await
                .unwrap()
                .is_none()
        );
        let lease = queue
            .lease(Duration::from_secs(2), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(Utc::now() >= due);
        assert_eq!(lease.item.kind, ItemKind::ContinueRun);
    }

    #[tokio::test]
    async fn test_due_order() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        queue
            .enqueue(item(ItemKind::ContinueRun).step_hash("late").at(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        queue
            .enqueue(item(ItemKind::ContinueRun).step_hash("early").at(now - chrono::Duration::seconds(5)))
            .await
            .unwrap();

        let first = queue
            .lease(Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.item.step_hash.as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn test_job_id_dedupes_until_ack() {
        let queue = MemoryQueue::new();
        assert!(queue.enqueue(item(ItemKind::ContinueRun).job_id("run:a")).await.unwrap());
        assert!(!queue.enqueue(item(ItemKind::ContinueRun).job_id("run:a")).await.unwrap());

        let lease = queue
            .lease(Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(!queue.enqueue(item(ItemKind::ContinueRun).job_id("run:a")).await.unwrap());
        queue.ack(&lease).await.unwrap();
        assert!(queue.enqueue(item(ItemKind::ContinueRun).job_id("run:a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_nack_reschedules_with_attempt() {
        let queue = MemoryQueue::new();
        queue.enqueue(item(ItemKind::ContinueRun)).await.unwrap();
        let lease = queue
            .lease(Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue.nack(&lease, 1, Utc::now()).await.unwrap();

        let again = queue
            .lease(Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.item.attempt, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryQueue::new();
        queue.enqueue(item(ItemKind::StartRun)).await.unwrap();
        let first = queue
            .lease(Duration::ZERO, Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();

        let second = queue
            .lease(Duration::from_secs(1), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.item, first.item);
        assert_ne!(second.token, first.token);

        // Acking the stale lease is a no-op.
        queue.ack(&first).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiting_lease_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .lease(Duration::from_secs(5), Duration::from_secs(60))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(item(ItemKind::StartRun)).await.unwrap();
        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_flaky_queue_fails_only_its_kind() {
        let inner = std::sync::Arc::new(MemoryQueue::new());
        let queue = FlakyQueue::new(inner.clone(), ItemKind::ContinueRun, 1);

        assert!(queue.enqueue(item(ItemKind::StartRun)).await.unwrap());
        let err = queue.enqueue(item(ItemKind::ContinueRun)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(queue.enqueue(item(ItemKind::ContinueRun)).await.unwrap());
        assert_eq!(inner.pending().len(), 2);
    }
}
