// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terminal transitions of a run.
//!
//! Completing, failing and cancelling share the same tail: move the status,
//! release everything the run holds, and publish lifecycle events so that
//! invoking parents (and anyone else listening) learn about it.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::event::{Event, EventSink, FN_CANCELLED, FN_FAILED, FN_FINISHED};
use crate::ids::RunId;
use crate::opcode::UserError;
use crate::state::{RunMetadata, RunStatus, StateStore};

/// Error name recorded for cancelled runs.
pub const CANCELLED_ERROR: &str = "FunctionCancelledError";

/// Field of `event.data._inngest` carrying an invoke correlation ID.
const CORRELATION_ID: &str = "correlation_id";

pub struct Lifecycle {
    state: Arc<dyn StateStore>,
    events: Arc<dyn EventSink>,
}

impl Lifecycle {
    pub fn new(state: Arc<dyn StateStore>, events: Arc<dyn EventSink>) -> Self {
        Self { state, events }
    }

    /// Mark a run completed with `output`. Returns `None` if the run had
    /// already finished.
    pub async fn complete(&self, run_id: &RunId, output: Value) -> Result<Option<RunMetadata>> {
        self.state.set_output(run_id, output.clone()).await?;
        let Some(meta) = self.finish(run_id, RunStatus::Completed, None).await? else {
            return Ok(None);
        };
        info!(run_id = %run_id, "Run completed");
        self.publish(&meta, FN_FINISHED, "result", output).await;
        Ok(Some(meta))
    }

    /// Mark a run failed with `error`.
    pub async fn fail(&self, run_id: &RunId, error: &UserError) -> Result<Option<RunMetadata>> {
        let cause = error.to_value();
        let Some(meta) = self
            .finish(run_id, RunStatus::Failed, Some(cause.clone()))
            .await?
        else {
            return Ok(None);
        };
        warn!(run_id = %run_id, error = %error.message, "Run failed");
        self.publish(&meta, FN_FAILED, "error", cause.clone()).await;
        self.publish(&meta, FN_FINISHED, "error", cause).await;
        Ok(Some(meta))
    }

    /// Cancel a run. `trigger` is the event that cancelled it, if any.
    pub async fn cancel(&self, run_id: &RunId, trigger: Option<&Event>) -> Result<Option<RunMetadata>> {
        let mut cause = UserError::new(CANCELLED_ERROR, "Function cancelled").to_value();
        if let (Some(evt), Value::Object(map)) = (trigger, &mut cause) {
            map.insert("event".to_string(), evt.to_value());
        }
        let Some(meta) = self
            .finish(run_id, RunStatus::Cancelled, Some(cause.clone()))
            .await?
        else {
            return Ok(None);
        };
        info!(run_id = %run_id, "Run cancelled");
        self.publish(&meta, FN_CANCELLED, "error", cause.clone()).await;
        self.publish(&meta, FN_FINISHED, "error", cause).await;
        Ok(Some(meta))
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        cause: Option<Value>,
    ) -> Result<Option<RunMetadata>> {
        let current = self
            .state
            .load_metadata(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if current.status.is_terminal() {
            return Ok(None);
        }
        let meta = match self.state.set_status(run_id, status, cause).await {
            Ok(meta) => meta,
            Err(CoreError::InvalidTransition { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.state.cleanup(run_id).await?;
        Ok(Some(meta))
    }

    async fn publish(&self, meta: &RunMetadata, name: &str, key: &str, value: Value) {
        let mut data = Map::new();
        data.insert("function_id".to_string(), json!(meta.function_id));
        data.insert("run_id".to_string(), json!(meta.run_id));
        data.insert("event".to_string(), meta.event.to_value());
        data.insert(key.to_string(), value);
        if let Some(correlation) = correlation_id(&meta.event) {
            data.insert(CORRELATION_ID.to_string(), Value::String(correlation));
        }

        let event = Event::new(name, Value::Object(data));
        if let Err(e) = self.events.publish(meta.tenant, event).await {
            warn!(run_id = %meta.run_id, event = name, error = %e, "Failed to publish lifecycle event");
        }
    }
}

/// Correlation ID stamped on an invoke event by the parent.
pub fn correlation_id(event: &Event) -> Option<String> {
    event
        .data
        .get("_inngest")
        .and_then(|meta| meta.get(CORRELATION_ID))
        .and_then(Value::as_str)
        .map(str::to_string)
}
