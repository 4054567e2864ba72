// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drivers invoke user code for one step and normalize what comes back.
//!
//! A step's `runtime` field names its driver on the wire (`http`,
//! `connect`, `mock`). [`DriverRegistry`] is a plain lookup table from
//! [`DriverKind`] to a configured [`Driver`]; there is no dynamic loading.
//!
//! Every driver returns either a [`DriverResponse`] (the SDK answered, with
//! a terminal value, opcodes or an error) or a [`DriverError`] (the SDK
//! could not be reached or did not speak the protocol).

mod http;
mod mock;

pub use http::{HttpDriver, HttpDriverConfig};
pub use mock::{MockDriver, MockReply};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tributary_http::HttpError;
use url::Url;

use crate::event::Event;
use crate::ids::{FunctionId, RunId, TenantId};
use crate::opcode::{Opcode, OpcodeError, UserError};
use crate::state::RunState;

/// Wire-level runtime names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Http,
    Connect,
    Mock,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Connect => "connect",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" | "" => Ok(Self::Http),
            "connect" => Ok(Self::Connect),
            "mock" => Ok(Self::Mock),
            other => Err(DriverError::UnknownRuntime(other.to_string())),
        }
    }
}

/// Failures that prevented a usable SDK response.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DriverError {
    #[error("unknown runtime '{0}'")]
    UnknownRuntime(String),

    #[error("no driver registered for runtime '{0}'")]
    Unsupported(DriverKind),

    #[error("invalid step URL '{0}'")]
    InvalidUrl(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("the response exceeded the {limit} byte output limit")]
    OutputTooLarge { limit: usize },

    #[error("the response did not come from an SDK (status {status})")]
    NotSdkResponse { status: u16 },

    #[error("malformed stream: {0}")]
    MalformedStream(String),

    #[error(transparent)]
    Opcodes(#[from] OpcodeError),

    #[error("could not encode request: {0}")]
    Encode(String),

    #[error("mock driver has no reply scripted")]
    Exhausted,
}

impl DriverError {
    /// System error code recorded in the run's failure cause.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownRuntime(_) | Self::Unsupported(_) => "UnsupportedRuntime",
            Self::InvalidUrl(_) => "InvalidUrl",
            Self::Http(HttpError::Blocked(_)) => "SsrfBlocked",
            Self::Http(HttpError::Timeout(_)) => "Timeout",
            Self::Http(_) => "TransportError",
            Self::OutputTooLarge { .. } => "OutputTooLarge",
            Self::NotSdkResponse { .. } => "NotSDKResponse",
            Self::MalformedStream(_) => "MalformedStream",
            Self::Opcodes(_) => "InvalidOpcodes",
            Self::Encode(_) => "EncodeError",
            Self::Exhausted => "MockExhausted",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_retryable(),
            Self::Opcodes(_) | Self::Exhausted => true,
            _ => false,
        }
    }

    /// The failure as the error a function author sees.
    pub fn to_user_error(&self) -> UserError {
        let message = match self {
            Self::Http(e) => e.user_message(),
            other => other.to_string(),
        };
        UserError::new(self.code(), message)
    }
}

/// `ctx.stack` in the SDK request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackContext {
    pub stack: Vec<String>,
    pub current: usize,
}

/// `ctx` in the SDK request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdkContext {
    pub fn_id: FunctionId,
    pub run_id: RunId,
    pub env: String,
    pub step_id: String,
    pub attempt: u32,
    pub stack: StackContext,
    pub disable_immediate_execution: bool,
    pub use_api: bool,
}

/// Body POSTed to the SDK on every step invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdkRequest {
    pub event: Event,
    pub events: Vec<Event>,
    pub steps: Value,
    pub ctx: SdkContext,
    pub version: i32,
    pub use_api: bool,
}

impl SdkRequest {
    pub fn new(state: &RunState, env: &str, step_id: &str, attempt: u32) -> Self {
        let events = if state.meta.events.is_empty() {
            vec![state.meta.event.clone()]
        } else {
            state.meta.events.clone()
        };
        Self {
            event: state.meta.event.clone(),
            events,
            steps: state.steps_object(),
            ctx: SdkContext {
                fn_id: state.meta.function_id,
                run_id: state.meta.run_id,
                env: env.to_string(),
                step_id: step_id.to_string(),
                attempt,
                stack: StackContext {
                    stack: state.stack.clone(),
                    current: state.stack.len(),
                },
                disable_immediate_execution: state.meta.disable_immediate_execution,
                use_api: false,
            },
            version: state.meta.request_version,
            use_api: false,
        }
    }
}

/// One step invocation.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub url: Url,
    pub tenant: TenantId,
    pub env: String,
    /// Step definition being executed (`ctx.step_id`).
    pub step_id: String,
    /// Planned step to run, sent as the `stepId` query parameter.
    pub step_hash: Option<String>,
    pub timeout: Option<Duration>,
    pub payload: SdkRequest,
}

impl DriverRequest {
    pub fn run_id(&self) -> RunId {
        self.payload.ctx.run_id
    }

    /// Value of the `stepId` query parameter.
    pub fn query_step_id(&self) -> &str {
        self.step_hash.as_deref().unwrap_or(&self.step_id)
    }
}

/// What the SDK said.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// HTTP 200: the function returned this value.
    Complete(Value),
    /// HTTP 206: the function yielded these opcodes.
    Opcodes(Vec<Opcode>),
    /// Any other status.
    Error {
        status: u16,
        error: UserError,
        retryable: bool,
        retry_at: Option<DateTime<Utc>>,
    },
}

/// A normalized SDK response.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverResponse {
    pub outcome: Outcome,
    /// `x-inngest-sdk` header, when present.
    pub sdk: Option<String>,
    /// `x-inngest-req-version` header, when present.
    pub request_version: Option<i32>,
    pub duration: Duration,
}

impl DriverResponse {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            sdk: None,
            request_version: None,
            duration: Duration::ZERO,
        }
    }
}

/// A configured driver.
#[derive(Debug, Clone)]
pub enum Driver {
    Http(HttpDriver),
    Mock(MockDriver),
}

impl Driver {
    pub fn kind(&self) -> DriverKind {
        match self {
            Self::Http(_) => DriverKind::Http,
            Self::Mock(_) => DriverKind::Mock,
        }
    }

    pub async fn execute(&self, request: &DriverRequest) -> Result<DriverResponse, DriverError> {
        match self {
            Self::Http(driver) => driver.execute(request).await,
            Self::Mock(driver) => driver.execute(request).await,
        }
    }
}

/// Runtime name → driver.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DriverKind, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, driver: Driver) -> Self {
        self.register(driver);
        self
    }

    pub fn register(&mut self, driver: Driver) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: DriverKind) -> Result<&Driver, DriverError> {
        self.drivers.get(&kind).ok_or(DriverError::Unsupported(kind))
    }

    /// Resolve a step's `runtime` field.
    pub fn for_runtime(&self, runtime: &str) -> Result<&Driver, DriverError> {
        self.get(runtime.parse()?)
    }
}
