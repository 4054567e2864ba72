// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tributary-core E2E tests.
//!
//! Provides [`TestEngine`]: a running engine whose functions point at a
//! wiremock server playing the SDK.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use tributary_core::driver::HttpDriverConfig;
use tributary_core::executor::ExecutorConfig;
use tributary_core::function::{FunctionDefinition, RegisteredFunction};
use tributary_core::queue::{FlakyQueue, ItemKind, MemoryQueue, Queue};
use tributary_core::runner::EventOutcome;
use tributary_core::runtime::EngineRuntime;
use tributary_core::state::{RunMetadata, RunStatus, StateStore};
use tributary_core::{Event, MemoryStateStore, RunId, TenantId};
use tributary_http::{Backoff, HttpClientConfig, SsrfPolicy};

pub const SIGNING_KEY: &[u8] = b"signkey-test-12345678";
pub const SDK_HEADER: &str = "js:v3.0.0";
pub const SDK_PATH: &str = "/api/inngest";

/// A running engine plus the mock SDK it calls.
pub struct TestEngine {
    pub runtime: EngineRuntime,
    pub sdk: MockServer,
    pub state: Arc<dyn StateStore>,
}

impl TestEngine {
    /// Start an engine on in-memory state.
    pub async fn start() -> Self {
        Self::with_state(Arc::new(MemoryStateStore::new())).await
    }

    /// Start an engine on `state`.
    pub async fn with_state(state: Arc<dyn StateStore>) -> Self {
        Self::with_parts(state, Arc::new(MemoryQueue::new())).await
    }

    /// Start an engine on in-memory state whose queue fails the next
    /// `failures` enqueues of `kind`.
    pub async fn with_flaky_queue(kind: ItemKind, failures: u32) -> (Self, FlakyQueue) {
        let queue = FlakyQueue::new(Arc::new(MemoryQueue::new()), kind, failures);
        let engine = Self::with_parts(Arc::new(MemoryStateStore::new()), Arc::new(queue.clone())).await;
        (engine, queue)
    }

    async fn with_parts(state: Arc<dyn StateStore>, queue: Arc<dyn Queue>) -> Self {
        let sdk = MockServer::start().await;
        let runtime = EngineRuntime::builder()
            .state(state.clone())
            .queue(queue)
            .http_client(HttpClientConfig {
                ssrf: SsrfPolicy::permissive(),
                ..Default::default()
            })
            .http_driver(HttpDriverConfig {
                signing_key: SIGNING_KEY.to_vec(),
                ..Default::default()
            })
            .executor(ExecutorConfig {
                env: "test".to_string(),
                backoff: Some(Backoff::fixed(Duration::from_millis(100))),
                concurrency_retry: Duration::from_millis(50),
                ..Default::default()
            })
            .workers(4)
            .lease_timeout(Duration::from_secs(30))
            .expiry_interval(Duration::from_millis(100))
            .build()
            .expect("runtime config")
            .start()
            .await
            .expect("runtime start");
        Self {
            runtime,
            sdk,
            state,
        }
    }

    /// Answer every SDK call with `responder`.
    pub async fn serve<F>(&self, responder: F)
    where
        F: Fn(&Request) -> ResponseTemplate + Send + Sync + 'static,
    {
        Mock::given(method("POST"))
            .and(path(SDK_PATH))
            .respond_with(responder)
            .mount(&self.sdk)
            .await;
    }

    /// Register a single-step function served by the mock SDK.
    pub fn register(&self, definition: Value) -> Arc<RegisteredFunction> {
        let mut definition = definition;
        let uri = format!(
            "{}{}?fnId={}",
            self.sdk.uri(),
            SDK_PATH,
            definition["slug"].as_str().unwrap_or_default()
        );
        definition["steps"] = json!({"step": {"id": "step", "name": "step", "uri": uri}});
        let definition: FunctionDefinition =
            serde_json::from_value(definition).expect("valid definition");
        self.runtime
            .registry()
            .register(TenantId::default(), definition)
            .expect("function registers")
    }

    /// Publish `event` as is. False when the engine returned an error.
    pub async fn try_publish(&self, event: Event) -> bool {
        self.runtime.publish(TenantId::default(), event).await.is_ok()
    }

    pub async fn publish(&self, name: &str, data: Value) -> EventOutcome {
        self.runtime
            .publish(TenantId::default(), Event::new(name, data))
            .await
            .expect("event accepted")
    }

    /// Publish and return the single run it scheduled.
    pub async fn trigger(&self, name: &str, data: Value) -> RunId {
        let outcome = self.publish(name, data).await;
        assert_eq!(outcome.scheduled.len(), 1, "expected one run");
        outcome.scheduled[0]
    }

    pub async fn metadata(&self, run_id: &RunId) -> RunMetadata {
        self.state
            .load_metadata(run_id)
            .await
            .expect("state readable")
            .expect("run exists")
    }

    /// Wait until the run reaches `status`.
    pub async fn wait_for_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        timeout: Duration,
    ) -> RunMetadata {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let meta = self.metadata(run_id).await;
            if meta.status == status {
                return meta;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "run {} is {} after {:?}, expected {}",
                    run_id, meta.status, timeout, status
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until the SDK has received `count` requests.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> Vec<Request> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.sdk.received_requests().await.unwrap_or_default();
            if received.len() >= count {
                return received;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("SDK saw {} requests, expected {}", received.len(), count);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Request bodies received by the SDK so far.
    pub async fn sdk_bodies(&self) -> Vec<Value> {
        self.sdk
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(body)
            .collect()
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.expect("clean shutdown");
    }
}

/// JSON body of an SDK request.
pub fn body(request: &Request) -> Value {
    serde_json::from_slice(&request.body).expect("SDK request is JSON")
}

/// `ctx.stack.stack` of an SDK request.
pub fn stack(request: &Request) -> Vec<String> {
    serde_json::from_value(body(request)["ctx"]["stack"]["stack"].clone()).unwrap_or_default()
}

/// The `stepId` query parameter.
pub fn step_id(request: &Request) -> String {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == "stepId")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// A terminal SDK reply.
pub fn complete(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("x-inngest-sdk", SDK_HEADER)
        .set_body_json(body)
}

/// A generator reply carrying `ops`.
pub fn opcodes(ops: Value) -> ResponseTemplate {
    ResponseTemplate::new(206)
        .insert_header("x-inngest-sdk", SDK_HEADER)
        .set_body_json(ops)
}
