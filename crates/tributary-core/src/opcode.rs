// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK opcodes.
//!
//! A generator response (HTTP 206) is a JSON array of opcodes, or a single
//! opcode object from older SDKs. This module is the only place that looks at
//! the `op` string; everything downstream matches on [`Opcode`].
//!
//! ```json
//! [{"op": "WaitForEvent", "id": "<40-hex>", "name": "test/resume",
//!   "opts": {"event": "test/resume", "timeout": "10s", "if": "async.data.id == event.data.id"}}]
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::duration::{DurationError, parse_duration, parse_instant};

/// Error name that disables retries regardless of attempt count.
pub const NON_RETRIABLE_ERROR: &str = "NonRetriableError";

/// Error name used when an invoked function does not finish in time.
pub const INVOKE_TIMEOUT_ERROR: &str = "InngestInvokeTimeoutError";

/// A user-visible error, as reported by the SDK or synthesized by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserError {
    #[serde(default = "default_error_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(rename = "noRetry", default, skip_serializing_if = "std::ops::Not::not")]
    pub no_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl UserError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Whether the SDK asked for this error to be final.
    pub fn is_non_retriable(&self) -> bool {
        self.no_retry || self.name == NON_RETRIABLE_ERROR
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Best-effort extraction of an error from an arbitrary response body.
    ///
    /// Looks for `{"error": ...}` or `{"body": ...}` wrappers, unwraps quoted
    /// JSON strings once, and falls back to the body text as the message.
    pub fn from_body(body: &Value, fallback_message: &str) -> Self {
        fn from_object(map: &Map<String, Value>) -> Option<UserError> {
            let name = map.get("name").and_then(Value::as_str);
            let message = map.get("message").and_then(Value::as_str);
            if name.is_none() && message.is_none() {
                return None;
            }
            Some(UserError {
                name: name.unwrap_or("Error").to_string(),
                message: message.unwrap_or_default().to_string(),
                stack: map.get("stack").and_then(Value::as_str).map(str::to_string),
                no_retry: map.get("noRetry").and_then(Value::as_bool).unwrap_or(false),
                data: None,
            })
        }

        let mut current = body.clone();
        for _ in 0..3 {
            current = match current {
                Value::String(s) => match serde_json::from_str::<Value>(&s) {
                    Ok(inner @ (Value::Object(_) | Value::String(_))) => inner,
                    _ => return Self::new("Error", s),
                },
                Value::Object(map) => {
                    if let Some(err) = from_object(&map) {
                        return err;
                    }
                    match map.get("error").or_else(|| map.get("body")) {
                        Some(inner) => inner.clone(),
                        None => break,
                    }
                }
                _ => break,
            };
        }
        Self::new("Error", fallback_message)
    }
}

/// How long a sleep lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepFor {
    Duration(Duration),
    Until(DateTime<Utc>),
}

impl SleepFor {
    /// Instant at which the sleep ends, never earlier than `now`.
    pub fn wake_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Duration(d) => chrono::Duration::from_std(*d)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Self::Until(at) => (*at).max(now),
        }
    }
}

/// Decoded opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// The function returned; the response body is the result.
    None,
    StepRun {
        hash: String,
        name: String,
        data: Value,
    },
    StepError {
        hash: String,
        name: String,
        error: UserError,
    },
    StepPlanned {
        hash: String,
        name: String,
    },
    Sleep {
        hash: String,
        name: String,
        sleep: SleepFor,
    },
    WaitForEvent {
        hash: String,
        name: String,
        event: String,
        timeout: Duration,
        expression: Option<String>,
    },
    InvokeFunction {
        hash: String,
        name: String,
        function: String,
        payload: Value,
        timeout: Option<Duration>,
    },
}

impl Opcode {
    /// Step hash the opcode refers to, if any.
    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::StepRun { hash, .. }
            | Self::StepError { hash, .. }
            | Self::StepPlanned { hash, .. }
            | Self::Sleep { hash, .. }
            | Self::WaitForEvent { hash, .. }
            | Self::InvokeFunction { hash, .. } => Some(hash),
        }
    }

    /// Wire name of the opcode, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::StepRun { .. } => "StepRun",
            Self::StepError { .. } => "StepError",
            Self::StepPlanned { .. } => "StepPlanned",
            Self::Sleep { .. } => "Sleep",
            Self::WaitForEvent { .. } => "WaitForEvent",
            Self::InvokeFunction { .. } => "InvokeFunction",
        }
    }
}

/// Opcode decode failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum OpcodeError {
    #[error("invalid opcode response: {0}")]
    Invalid(String),
    #[error("unknown opcode '{0}'")]
    Unknown(String),
    #[error("opcode {op} for step '{hash}' is missing {field}")]
    MissingField {
        op: &'static str,
        hash: String,
        field: &'static str,
    },
    #[error("opcode {op} for step '{hash}' has an invalid duration: {source}")]
    InvalidDuration {
        op: &'static str,
        hash: String,
        #[source]
        source: DurationError,
    },
}

/// Raw wire shape of one opcode.
#[derive(Debug, Deserialize)]
struct WireOpcode {
    op: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    opts: Option<Map<String, Value>>,
}

impl WireOpcode {
    fn display(&self) -> String {
        self.display_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.id.clone())
    }

    fn opt_str(&self, key: &str) -> Option<&str> {
        self.opts
            .as_ref()
            .and_then(|o| o.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    fn duration(&self, op: &'static str, raw: &str) -> Result<Duration, OpcodeError> {
        parse_duration(raw).map_err(|source| OpcodeError::InvalidDuration {
            op,
            hash: self.id.clone(),
            source,
        })
    }

    fn into_opcode(self) -> Result<Opcode, OpcodeError> {
        let name = self.display();
        let op = match self.op.as_str() {
            "None" | "" => return Ok(Opcode::None),
            "StepRun" | "Step" => "StepRun",
            "StepError" => "StepError",
            "StepPlanned" => "StepPlanned",
            "Sleep" => "Sleep",
            "WaitForEvent" => "WaitForEvent",
            "InvokeFunction" => "InvokeFunction",
            other => return Err(OpcodeError::Unknown(other.to_string())),
        };
        if self.id.is_empty() {
            return Err(OpcodeError::MissingField {
                op,
                hash: String::new(),
                field: "id",
            });
        }

        match op {
            "StepRun" => Ok(Opcode::StepRun {
                data: self.data.unwrap_or(Value::Null),
                hash: self.id,
                name,
            }),
            "StepError" => {
                let error = match self.error {
                    Some(Value::Object(map)) => serde_json::from_value(Value::Object(map))
                        .map_err(|e| OpcodeError::Invalid(e.to_string()))?,
                    Some(other) => UserError::from_body(&other, "step failed"),
                    None => UserError::new("Error", "step failed"),
                };
                Ok(Opcode::StepError {
                    hash: self.id,
                    name,
                    error,
                })
            }
            "StepPlanned" => Ok(Opcode::StepPlanned {
                hash: self.id,
                name,
            }),
            "Sleep" => {
                let raw = self
                    .opt_str("duration")
                    .or(self.name.as_deref())
                    .ok_or_else(|| OpcodeError::MissingField {
                        op,
                        hash: self.id.clone(),
                        field: "duration",
                    })?;
                let sleep = match parse_instant(raw) {
                    Some(at) => SleepFor::Until(at),
                    None => SleepFor::Duration(self.duration(op, raw)?),
                };
                Ok(Opcode::Sleep {
                    hash: self.id,
                    name,
                    sleep,
                })
            }
            "WaitForEvent" => {
                let event = self
                    .opt_str("event")
                    .or(self.name.as_deref())
                    .map(str::to_string)
                    .ok_or_else(|| OpcodeError::MissingField {
                        op,
                        hash: self.id.clone(),
                        field: "opts.event",
                    })?;
                let raw = self.opt_str("timeout").ok_or_else(|| OpcodeError::MissingField {
                    op,
                    hash: self.id.clone(),
                    field: "opts.timeout",
                })?;
                let timeout = self.duration(op, raw)?;
                let expression = self.opt_str("if").map(str::to_string);
                Ok(Opcode::WaitForEvent {
                    hash: self.id,
                    name,
                    event,
                    timeout,
                    expression,
                })
            }
            _ => {
                let function = self
                    .opt_str("function_id")
                    .map(str::to_string)
                    .ok_or_else(|| OpcodeError::MissingField {
                        op,
                        hash: self.id.clone(),
                        field: "opts.function_id",
                    })?;
                let timeout = match self.opt_str("timeout") {
                    Some(raw) => Some(self.duration(op, raw)?),
                    None => None,
                };
                let payload = self
                    .opts
                    .as_ref()
                    .and_then(|o| o.get("payload"))
                    .cloned()
                    .unwrap_or_else(|| json!({"data": {}}));
                Ok(Opcode::InvokeFunction {
                    hash: self.id,
                    name,
                    function,
                    payload,
                    timeout,
                })
            }
        }
    }
}

/// Decode a generator response body.
///
/// Accepts an array or a single object. The result is empty when the SDK
/// reported nothing to do, which callers treat as [`Opcode::None`].
pub fn parse_opcodes(body: &[u8]) -> Result<Vec<Opcode>, OpcodeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_slice(body).map_err(|e| OpcodeError::Invalid(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        Value::Null => Vec::new(),
        other => {
            return Err(OpcodeError::Invalid(format!(
                "expected an opcode array, got {}",
                other
            )));
        }
    };

    let mut ops = Vec::with_capacity(items.len());
    for item in items {
        let wire: WireOpcode =
            serde_json::from_value(item).map_err(|e| OpcodeError::Invalid(e.to_string()))?;
        match wire.into_opcode()? {
            Opcode::None => {}
            op => ops.push(op),
        }
    }
    Ok(ops)
}
