// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streamed responses and body normalization.
//!
//! An SDK that needs to keep a connection alive replies `201 Created` and
//! writes the real response later as a JSON envelope:
//!
//! ```json
//! {"status": 206, "body": "[...]", "headers": {}, "retryAt": null, "noRetry": false}
//! ```

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// Status code that marks a streamed response.
pub const STREAM_STATUS: u16 = 201;

/// Stream envelope failures.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The envelope is not valid JSON of the expected shape.
    #[error("invalid streamed response: {0}")]
    Invalid(#[from] serde_json::Error),
    /// The envelope wraps another streamed response.
    #[error("malformed stream: streamed responses cannot be nested")]
    MalformedStream,
}

/// Decoded 201 envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamResponse {
    /// The real status code.
    pub status: u16,
    /// The real body, already unwrapped from any double encoding.
    pub body: Vec<u8>,
    /// Retry time requested by the SDK.
    pub retry_at: Option<String>,
    /// Whether retries are disabled.
    pub no_retry: bool,
    /// Headers of the real response.
    pub headers: HashMap<String, String>,
}

#[derive(Deserialize)]
struct Envelope {
    status: u16,
    #[serde(default)]
    body: Value,
    #[serde(rename = "retryAt", default)]
    retry_at: Option<String>,
    #[serde(rename = "noRetry", default)]
    no_retry: bool,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl StreamResponse {
    /// Decode a 201 body.
    pub fn parse(bytes: &[u8]) -> Result<Self, StreamError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.status == STREAM_STATUS {
            return Err(StreamError::MalformedStream);
        }
        let body = match envelope.body {
            Value::Null => Vec::new(),
            value => unwrap_double_encoded(serde_json::to_vec(&value)?),
        };
        Ok(Self {
            status: envelope.status,
            body,
            retry_at: envelope.retry_at,
            no_retry: envelope.no_retry,
            headers: envelope.headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Unwrap a body that was JSON-encoded twice.
///
/// `"\"{\\\"a\\\":1}\""` becomes `{"a":1}`. Only strings whose contents are
/// themselves an object or array are unwrapped, and only once.
pub fn unwrap_double_encoded(body: Vec<u8>) -> Vec<u8> {
    if body.len() < 2 || body[0] != b'"' || body[body.len() - 1] != b'"' {
        return body;
    }
    match serde_json::from_slice::<String>(&body) {
        Ok(inner) if inner.trim_start().starts_with(['{', '[']) => inner.into_bytes(),
        _ => body,
    }
}

/// Interpret a response body as a JSON value, falling back to a string.
pub fn body_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
