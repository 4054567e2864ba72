// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed state store.
//!
//! Every multi-statement mutation opens with a write so the transaction takes
//! the database write lock up front; compare-and-set checks are `UPDATE ...
//! WHERE version = ?` statements whose affected-row count decides the outcome.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use super::{
    AppendOutcome, ConsumeMode, ConsumeResult, Created, NewRun, Pause, RunMetadata, RunState,
    RunStatus, StateStore, window_start,
};
use crate::error::{CoreError, Result};
use crate::ids::{PauseId, RunId, TenantId};
use crate::migrations;

/// Run row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RunRow {
    run_id: String,
    tenant: String,
    function_id: String,
    status: String,
    version: i64,
    event: String,
    events: String,
    cause: Option<String>,
    output: Option<String>,
    idempotency_key: String,
    request_version: i64,
    disable_immediate_execution: bool,
    concurrency_key: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn decode<T>(what: &str, result: std::result::Result<T, impl ToString>) -> Result<T> {
    result.map_err(|e| CoreError::database(format!("decode {}", what), e.to_string()))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

impl TryFrom<RunRow> for RunMetadata {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(RunMetadata {
            run_id: decode("run_id", row.run_id.parse())?,
            tenant: decode("tenant", row.tenant.parse())?,
            function_id: decode("function_id", row.function_id.parse())?,
            status: decode("status", row.status.parse())?,
            version: row.version as u64,
            event: decode("event", serde_json::from_str(&row.event))?,
            events: decode("events", serde_json::from_str(&row.events))?,
            cause: row
                .cause
                .map(|c| decode("cause", serde_json::from_str(&c)))
                .transpose()?,
            output: row
                .output
                .map(|o| decode("output", serde_json::from_str(&o)))
                .transpose()?,
            idempotency_key: row.idempotency_key,
            request_version: row.request_version as i32,
            disable_immediate_execution: row.disable_immediate_execution,
            concurrency_key: row.concurrency_key,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

const RUN_COLUMNS: &str = "run_id, tenant, function_id, status, version, event, events, cause, \
     output, idempotency_key, request_version, disable_immediate_execution, concurrency_key, \
     created_at, updated_at";

fn decode_pause(body: &str, consumed: bool) -> Result<Pause> {
    let mut pause: Pause = decode("pause", serde_json::from_str(body))?;
    pause.consumed = consumed;
    Ok(pause)
}

/// SQLite-backed state store.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    /// Wrap an existing pool. Migrations must already have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let store = SqliteStateStore::from_path(".data/tributary.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::from_url(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| {
                CoreError::database("connect", format!("Failed to connect to {}: {}", url, e))
            })?;

        migrations::run_sqlite(&pool).await.map_err(|e| {
            CoreError::database("migrate", format!("Failed to run migrations: {}", e))
        })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn current_version(&self, run_id: &RunId) -> Result<Option<u64>> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT version FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v as u64))
    }

    fn not_found(run_id: &RunId) -> CoreError {
        CoreError::RunNotFound {
            run_id: run_id.to_string(),
        }
    }

    async fn update_run_flag(&self, run_id: &RunId, sql: &str, value: i64) -> Result<()> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Self::not_found(run_id));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create(&self, run: NewRun) -> Result<Created> {
        let meta = run.into_metadata();
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO runs ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, 0, ?, ?, ?)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
            RUN_COLUMNS
        ))
        .bind(meta.run_id.to_string())
        .bind(meta.tenant.to_string())
        .bind(meta.function_id.to_string())
        .bind(meta.status.as_str())
        .bind(meta.version as i64)
        .bind(serde_json::to_string(&meta.event)?)
        .bind(serde_json::to_string(&meta.events)?)
        .bind(&meta.idempotency_key)
        .bind(meta.request_version as i64)
        .bind(&meta.concurrency_key)
        .bind(millis(meta.created_at))
        .bind(millis(meta.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(Created {
                run_id: meta.run_id,
                created: true,
            });
        }

        let (existing,) =
            sqlx::query_as::<_, (String,)>("SELECT run_id FROM runs WHERE idempotency_key = ?")
                .bind(&meta.idempotency_key)
                .fetch_one(&self.pool)
                .await?;
        debug!(idempotency_key = %meta.idempotency_key, "Run already exists");
        Ok(Created {
            run_id: decode("run_id", existing.parse())?,
            created: false,
        })
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<RunState>> {
        let id = run_id.to_string();
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs WHERE run_id = ?",
            RUN_COLUMNS
        ))
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let stack: Vec<(String,)> =
            sqlx::query_as("SELECT hash FROM run_stack WHERE run_id = ? ORDER BY position")
                .bind(&id)
                .fetch_all(&mut *tx)
                .await?;
        let steps: Vec<(String, String)> =
            sqlx::query_as("SELECT hash, data FROM run_steps WHERE run_id = ?")
                .bind(&id)
                .fetch_all(&mut *tx)
                .await?;
        let attempts: Vec<(String, i64)> =
            sqlx::query_as("SELECT hash, attempt FROM run_attempts WHERE run_id = ?")
                .bind(&id)
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;

        let mut step_data = HashMap::with_capacity(steps.len());
        for (hash, data) in steps {
            let value: Value = decode("step data", serde_json::from_str(&data))?;
            step_data.insert(hash, value);
        }

        Ok(Some(RunState {
            meta: row.try_into()?,
            stack: stack.into_iter().map(|(h,)| h).collect(),
            steps: step_data,
            attempts: attempts
                .into_iter()
                .map(|(h, a)| (h, a.max(0) as u32))
                .collect(),
        }))
    }

    async fn load_metadata(&self, run_id: &RunId) -> Result<Option<RunMetadata>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs WHERE run_id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(RunMetadata::try_from)
        .transpose()
    }

    async fn find_run(&self, idempotency_key: &str) -> Result<Option<RunMetadata>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs WHERE idempotency_key = ?",
            RUN_COLUMNS
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?
        .map(RunMetadata::try_from)
        .transpose()
    }

    async fn append_step(
        &self,
        run_id: &RunId,
        hash: &str,
        data: Value,
        expected_version: u64,
    ) -> Result<AppendOutcome> {
        let id = run_id.to_string();
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            r#"
            UPDATE runs SET version = version + 1, updated_at = ?
            WHERE run_id = ? AND version = ?
            "#,
        )
        .bind(millis(Utc::now()))
        .bind(&id)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if bumped.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.current_version(run_id).await? {
                None => Err(Self::not_found(run_id)),
                Some(actual) => Err(CoreError::StateConflict {
                    run_id: id,
                    expected: expected_version,
                    actual,
                }),
            };
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO run_steps (run_id, hash, data) VALUES (?, ?, ?)
            ON CONFLICT (run_id, hash) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(hash)
        .bind(serde_json::to_string(&data)?)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(AppendOutcome::AlreadySet {
                version: expected_version,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO run_stack (run_id, position, hash)
            VALUES (?, (SELECT COUNT(*) FROM run_stack WHERE run_id = ?), ?)
            "#,
        )
        .bind(&id)
        .bind(&id)
        .bind(hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AppendOutcome::Appended {
            version: expected_version + 1,
        })
    }

    async fn set_attempt(&self, run_id: &RunId, hash: &str, attempt: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_attempts (run_id, hash, attempt) VALUES (?, ?, ?)
            ON CONFLICT (run_id, hash) DO UPDATE SET attempt = excluded.attempt
            "#,
        )
        .bind(run_id.to_string())
        .bind(hash)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => Self::not_found(run_id),
            other => other.into(),
        })?;
        Ok(())
    }

    async fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        cause: Option<Value>,
    ) -> Result<RunMetadata> {
        if status != RunStatus::Scheduled {
            let cause = cause.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                r#"
                UPDATE runs
                SET status = ?, cause = COALESCE(?, cause), version = version + 1, updated_at = ?
                WHERE run_id = ?
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                  AND status <> ?
                "#,
            )
            .bind(status.as_str())
            .bind(cause)
            .bind(millis(Utc::now()))
            .bind(run_id.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        }

        let meta = self
            .load_metadata(run_id)
            .await?
            .ok_or_else(|| Self::not_found(run_id))?;
        if meta.status != status {
            return Err(CoreError::InvalidTransition {
                run_id: run_id.to_string(),
                from: meta.status.to_string(),
                to: status.to_string(),
            });
        }
        Ok(meta)
    }

    async fn set_output(&self, run_id: &RunId, output: Value) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET output = ? WHERE run_id = ?")
            .bind(serde_json::to_string(&output)?)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Self::not_found(run_id));
        }
        Ok(())
    }

    async fn set_request_version(&self, run_id: &RunId, version: i32) -> Result<()> {
        self.update_run_flag(
            run_id,
            "UPDATE runs SET request_version = ? WHERE run_id = ?",
            version as i64,
        )
        .await
    }

    async fn mark_parallel(&self, run_id: &RunId) -> Result<()> {
        self.update_run_flag(
            run_id,
            "UPDATE runs SET disable_immediate_execution = ? WHERE run_id = ?",
            1,
        )
        .await
    }

    async fn save_pause(&self, pause: &Pause) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let saved = sqlx::query(
            r#"
            INSERT INTO pauses (pause_id, run_id, tenant, event, kind, created_at, expires_at, consumed, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (pause_id) DO UPDATE SET
                event = excluded.event,
                expires_at = excluded.expires_at,
                consumed = excluded.consumed,
                body = excluded.body
            WHERE pauses.consumed = 0
            "#,
        )
        .bind(pause.id.to_string())
        .bind(pause.run_id.to_string())
        .bind(pause.tenant.to_string())
        .bind(&pause.event)
        .bind(pause.kind.as_str())
        .bind(millis(pause.created_at))
        .bind(millis(pause.expires_at))
        .bind(pause.consumed)
        .bind(serde_json::to_string(pause)?)
        .execute(&mut *tx)
        .await?;
        if saved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        let exists = sqlx::query_as::<_, (i64,)>("SELECT 1 FROM runs WHERE run_id = ?")
            .bind(pause.run_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Err(Self::not_found(&pause.run_id));
        }

        if pause.kind.blocks_run() {
            sqlx::query(
                r#"
                UPDATE runs SET status = 'paused', updated_at = ?
                WHERE run_id = ? AND status IN ('scheduled', 'running')
                "#,
            )
            .bind(millis(Utc::now()))
            .bind(pause.run_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_pause(&self, id: &PauseId) -> Result<Option<Pause>> {
        sqlx::query_as::<_, (String, bool)>("SELECT body, consumed FROM pauses WHERE pause_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|(body, consumed)| decode_pause(&body, consumed))
            .transpose()
    }

    async fn pauses_by_event(&self, tenant: &TenantId, event: &str) -> Result<Vec<Pause>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT body FROM pauses
            WHERE tenant = ? AND event = ? AND consumed = 0
            ORDER BY created_at, pause_id
            "#,
        )
        .bind(tenant.to_string())
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|(body,)| decode_pause(body, false))
            .collect()
    }

    async fn pauses_for_run(&self, run_id: &RunId) -> Result<Vec<Pause>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT body FROM pauses
            WHERE run_id = ? AND consumed = 0
            ORDER BY created_at, pause_id
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|(body,)| decode_pause(body, false))
            .collect()
    }

    async fn consume_pause(
        &self,
        id: &PauseId,
        data: Option<Value>,
        mode: ConsumeMode,
        now: DateTime<Utc>,
    ) -> Result<ConsumeResult> {
        let pause_id = id.to_string();
        let now_ms = millis(now);
        let mut tx = self.pool.begin().await?;

        let claimed = match mode {
            ConsumeMode::Event => {
                sqlx::query(
                    "UPDATE pauses SET consumed = 1 WHERE pause_id = ? AND consumed = 0 AND expires_at > ?",
                )
                .bind(&pause_id)
                .bind(now_ms)
                .execute(&mut *tx)
                .await?
            }
            ConsumeMode::Timeout => {
                sqlx::query("UPDATE pauses SET consumed = 1 WHERE pause_id = ? AND consumed = 0")
                    .bind(&pause_id)
                    .execute(&mut *tx)
                    .await?
            }
        };

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            let row = sqlx::query_as::<_, (bool, i64)>(
                "SELECT consumed, expires_at FROM pauses WHERE pause_id = ?",
            )
            .bind(&pause_id)
            .fetch_optional(&self.pool)
            .await?;
            return Ok(match row {
                Some((false, expires_at)) if mode == ConsumeMode::Event && expires_at <= now_ms => {
                    ConsumeResult::Expired
                }
                _ => ConsumeResult::AlreadyConsumed,
            });
        }

        let (body,) = sqlx::query_as::<_, (String,)>("SELECT body FROM pauses WHERE pause_id = ?")
            .bind(&pause_id)
            .fetch_one(&mut *tx)
            .await?;
        let pause = decode_pause(&body, false)?;
        let run_id = pause.run_id.to_string();

        if let (Some(key), Some(data)) = (&pause.data_key, data) {
            let inserted = sqlx::query(
                r#"
                INSERT INTO run_steps (run_id, hash, data)
                SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM runs WHERE run_id = ?)
                ON CONFLICT (run_id, hash) DO NOTHING
                "#,
            )
            .bind(&run_id)
            .bind(key)
            .bind(serde_json::to_string(&data)?)
            .bind(&run_id)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 1 {
                sqlx::query(
                    r#"
                    INSERT INTO run_stack (run_id, position, hash)
                    VALUES (?, (SELECT COUNT(*) FROM run_stack WHERE run_id = ?), ?)
                    "#,
                )
                .bind(&run_id)
                .bind(&run_id)
                .bind(key)
                .execute(&mut *tx)
                .await?;
                sqlx::query("UPDATE runs SET version = version + 1 WHERE run_id = ?")
                    .bind(&run_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            UPDATE runs SET status = 'running', updated_at = ?
            WHERE run_id = ? AND status = 'paused'
              AND NOT EXISTS (
                  SELECT 1 FROM pauses
                  WHERE run_id = ? AND consumed = 0 AND kind <> 'cancel'
              )
            "#,
        )
        .bind(now_ms)
        .bind(&run_id)
        .bind(&run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ConsumeResult::Consumed(pause))
    }

    async fn delete_pause(&self, id: &PauseId) -> Result<()> {
        sqlx::query("DELETE FROM pauses WHERE pause_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consumed_pauses(&self, limit: usize) -> Result<Vec<Pause>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT body FROM pauses
            WHERE consumed = 1
            ORDER BY created_at, pause_id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|(body,)| decode_pause(body, true))
            .collect()
    }

    async fn expired_pauses(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Pause>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT body FROM pauses
            WHERE consumed = 0 AND expires_at <= ?
            ORDER BY expires_at, pause_id
            LIMIT ?
            "#,
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|(body,)| decode_pause(body, false))
            .collect()
    }

    async fn cleanup(&self, run_id: &RunId) -> Result<()> {
        let id = run_id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pauses WHERE run_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM concurrency_slots WHERE run_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn acquire_slot(&self, key: &str, run_id: &RunId, limit: u32) -> Result<bool> {
        let id = run_id.to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO concurrency_slots (slot_key, run_id)
            SELECT ?, ? WHERE (SELECT COUNT(*) FROM concurrency_slots WHERE slot_key = ?) < ?
            ON CONFLICT (slot_key, run_id) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(&id)
        .bind(key)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(true);
        }

        let held = sqlx::query_as::<_, (i64,)>(
            "SELECT 1 FROM concurrency_slots WHERE slot_key = ? AND run_id = ?",
        )
        .bind(key)
        .bind(&id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(held.is_some())
    }

    async fn rate_limit(
        &self,
        key: &str,
        limit: u32,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let window = window_start(now, period);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO rate_limits (limit_key, window_start, count) VALUES (?, ?, 0)
            ON CONFLICT (limit_key) DO UPDATE SET
                count = CASE WHEN rate_limits.window_start = excluded.window_start
                             THEN rate_limits.count ELSE 0 END,
                window_start = excluded.window_start
            "#,
        )
        .bind(key)
        .bind(window)
        .execute(&mut *tx)
        .await?;

        let counted = sqlx::query(
            "UPDATE rate_limits SET count = count + 1 WHERE limit_key = ? AND count < ?",
        )
        .bind(key)
        .bind(limit as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(counted.rows_affected() == 1)
    }
}
