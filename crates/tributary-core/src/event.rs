// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events and the internal event bus.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};
use crate::ids::TenantId;

/// Published when any run reaches a terminal state.
pub const FN_FINISHED: &str = "inngest/function.finished";
/// Published when a run fails.
pub const FN_FAILED: &str = "inngest/function.failed";
/// Published when a run is cancelled.
pub const FN_CANCELLED: &str = "inngest/function.cancelled";
/// Name of events synthesized for cron triggers.
pub const SCHEDULED_TIMER: &str = "inngest/scheduled.timer";

const INTERNAL_PREFIX: &str = "inngest/";

/// An event as published by producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            name: name.into(),
            data,
            ..Default::default()
        }
    }

    /// Fill in `id` and `ts` if the producer left them out.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        if self.id.as_deref().is_none_or(str::is_empty) {
            self.id = Some(ulid::Ulid::from_datetime(now.into()).to_string());
        }
        if self.ts.is_none_or(|ts| ts <= 0) {
            self.ts = Some(now.timestamp_millis());
        }
    }

    /// Engine-generated events.
    pub fn is_internal(&self) -> bool {
        self.name.starts_with(INTERNAL_PREFIX)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// An event bound to the tenant it was published for.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEvent {
    pub tenant: TenantId,
    pub event: Event,
}

/// Where the engine publishes events it produces (lifecycle, invokes).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, tenant: TenantId, event: Event) -> Result<()>;
}

/// Sink that forwards into the runtime's event pump.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TrackedEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TrackedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, tenant: TenantId, mut event: Event) -> Result<()> {
        event.stamp(Utc::now());
        self.tx
            .send(TrackedEvent { tenant, event })
            .map_err(|_| CoreError::QueueError {
                operation: "publish".to_string(),
                details: "event pump stopped".to_string(),
            })
    }
}

/// Sink that keeps everything it receives. Useful in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TrackedEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn named(&self, name: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event.name == name)
            .map(|e| e.event)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, tenant: TenantId, mut event: Event) -> Result<()> {
        event.stamp(Utc::now());
        if let Ok(mut events) = self.events.lock() {
            events.push(TrackedEvent { tenant, event });
        }
        Ok(())
    }
}
