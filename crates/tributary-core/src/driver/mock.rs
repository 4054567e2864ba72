// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted driver for tests and local development.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tributary_http::retry::RetryWindow;
use tributary_http::{HttpError, TransportKind};

use super::http::{Reply, normalize};
use super::{DriverError, DriverRequest, DriverResponse};

const MOCK_SDK: &str = "mock:v1.0.0";

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// HTTP 200 with this body.
    Complete(Value),
    /// HTTP 206 with this opcode body.
    Opcodes(Value),
    /// Any other status with this body.
    Status(u16, Value),
    /// The SDK could not be reached.
    Unreachable,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<MockReply>,
    requests: Vec<DriverRequest>,
}

/// Answers requests from a FIFO of [`MockReply`]s and records every request.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    script: Arc<Mutex<Script>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: MockReply) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.replies.push_back(reply);
        }
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<DriverRequest> {
        self.script
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.replies.len()).unwrap_or(0)
    }

    pub async fn execute(&self, request: &DriverRequest) -> Result<DriverResponse, DriverError> {
        let reply = {
            let mut script = self.script.lock().map_err(|_| DriverError::Exhausted)?;
            script.requests.push(request.clone());
            script.replies.pop_front().ok_or(DriverError::Exhausted)?
        };

        let (status, body) = match reply {
            MockReply::Complete(body) => (200, body),
            MockReply::Opcodes(body) => (206, body),
            MockReply::Status(status, body) => (status, body),
            MockReply::Unreachable => {
                return Err(DriverError::Http(HttpError::Transport {
                    kind: TransportKind::Unreachable,
                    message: "connection refused".to_string(),
                }));
            }
        };
        let body = serde_json::to_vec(&body).map_err(|e| DriverError::Encode(e.to_string()))?;
        normalize(
            Reply {
                status,
                body,
                sdk: Some(MOCK_SDK.to_string()),
                ..Default::default()
            },
            RetryWindow::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Outcome, SdkRequest};
    use crate::event::Event;
    use crate::ids::{FunctionId, RunId, TenantId};
    use crate::state::{NewRun, RunState};
    use chrono::Utc;
    use serde_json::json;

    fn request() -> DriverRequest {
        let meta = NewRun {
            run_id: RunId::new(),
            tenant: TenantId::default(),
            function_id: FunctionId::from_canonical(b"mock"),
            event: Event::new("a/b", json!({})),
            events: Vec::new(),
            idempotency_key: "k".into(),
            concurrency_key: None,
            created_at: Utc::now(),
        }
        .into_metadata();
        let state = RunState {
            meta,
            stack: Vec::new(),
            steps: Default::default(),
            attempts: Default::default(),
        };
        DriverRequest {
            url: "mock://fn".parse().unwrap(),
            tenant: TenantId::default(),
            env: "test".into(),
            step_id: "step".into(),
            step_hash: None,
            timeout: None,
            payload: SdkRequest::new(&state, "test", "step", 0),
        }
    }

    #[tokio::test]
    async fn test_replies_in_order_and_records_requests() {
        let driver = MockDriver::new();
        driver
            .push(MockReply::Opcodes(json!([{"op": "StepRun", "id": "a", "data": 1}])))
            .push(MockReply::Complete(json!("done")));

        let first = driver.execute(&request()).await.unwrap();
        assert!(matches!(first.outcome, Outcome::Opcodes(ref ops) if ops.len() == 1));
        let second = driver.execute(&request()).await.unwrap();
        assert_eq!(second.outcome, Outcome::Complete(json!("done")));
        assert!(matches!(
            driver.execute(&request()).await,
            Err(DriverError::Exhausted)
        ));
        assert_eq!(driver.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_is_retryable_transport_error() {
        let driver = MockDriver::new();
        driver.push(MockReply::Unreachable);
        let err = driver.execute(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_user_error().message, "Unable to reach SDK URL");
    }
}
