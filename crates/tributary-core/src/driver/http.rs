// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP driver: the reference way of reaching an SDK.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use tributary_http::retry::RetryWindow;
use tributary_http::stream::{STREAM_STATUS, body_value};
use tributary_http::{
    HttpClient, HttpError, MAX_FUNCTION_TIMEOUT, Request, StreamError, StreamResponse, headers,
    parse_retry_at, should_retry, sign,
};

use super::{DriverError, DriverRequest, DriverResponse, Outcome};
use crate::ids::RunId;
use crate::opcode::{UserError, parse_opcodes};

/// HTTP driver settings.
#[derive(Debug, Clone, Default)]
pub struct HttpDriverConfig {
    /// HMAC key for `X-Inngest-Signature`. Empty disables signing.
    pub signing_key: Vec<u8>,
    /// Bounds applied to `retry-after` values.
    pub retry_window: RetryWindow,
}

#[derive(Debug, Clone)]
pub struct HttpDriver {
    client: HttpClient,
    config: HttpDriverConfig,
}

impl HttpDriver {
    pub fn new(client: HttpClient, config: HttpDriverConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    #[instrument(skip(self, request), fields(run_id = %request.run_id(), step_id = %request.query_step_id()))]
    pub async fn execute(&self, request: &DriverRequest) -> Result<DriverResponse, DriverError> {
        let mut url = request.url.clone();
        url.query_pairs_mut()
            .append_pair("stepId", request.query_step_id());

        let body =
            serde_json::to_vec(&request.payload).map_err(|e| DriverError::Encode(e.to_string()))?;
        let run_id = request.run_id();

        let mut outbound = Request::post(url)
            .json_body(body)
            .header(headers::RUN_ID, &run_id.to_string())
            .header(
                headers::REQUEST_VERSION,
                &request.payload.version.to_string(),
            )
            .header(headers::ACCOUNT_ID, &request.tenant.account_id.to_string())
            .header(headers::ENV, &request.env)
            .header(headers::TRACEPARENT, &traceparent(&run_id));
        if let Some(signature) = sign(&self.config.signing_key, &outbound.body, Utc::now()) {
            outbound = outbound.header(headers::SIGNATURE, &signature);
        }
        let timeout = request
            .timeout
            .map_or(MAX_FUNCTION_TIMEOUT, |t| t.min(MAX_FUNCTION_TIMEOUT));
        outbound = outbound.timeout(timeout);

        let response = match self.client.send(outbound).await {
            Ok(response) => response,
            Err(HttpError::BodyTooLarge { limit, .. }) => {
                warn!(limit, "SDK response exceeded the output limit");
                return Err(DriverError::OutputTooLarge { limit });
            }
            Err(e) => {
                debug!(error = %e, "SDK request failed");
                return Err(DriverError::Http(e));
            }
        };

        let reply = Reply {
            status: response.status.as_u16(),
            body: response.body.clone(),
            sdk: response.header(headers::SDK).map(str::to_string),
            no_retry: response.header(headers::NO_RETRY).map(str::to_string),
            retry_after: response.header(headers::RETRY_AFTER).map(str::to_string),
            request_version: response.header(headers::REQUEST_VERSION).map(str::to_string),
            stream_no_retry: false,
        };
        let mut normalized = normalize(reply, self.config.retry_window)?;
        normalized.duration = response.duration;
        Ok(normalized)
    }
}

/// Raw pieces of an SDK reply, before classification.
#[derive(Debug, Clone, Default)]
pub(crate) struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    pub sdk: Option<String>,
    pub no_retry: Option<String>,
    pub retry_after: Option<String>,
    pub request_version: Option<String>,
    pub stream_no_retry: bool,
}

impl Reply {
    /// Replace a 201 envelope with the response it carries. Headers inside
    /// the envelope win over the outer ones.
    fn unstream(self) -> Result<Self, DriverError> {
        let stream = StreamResponse::parse(&self.body).map_err(|e| match e {
            StreamError::MalformedStream => DriverError::MalformedStream(e.to_string()),
            StreamError::Invalid(inner) => DriverError::MalformedStream(inner.to_string()),
        })?;
        let header = |name: &str, outer: Option<String>| {
            stream.header(name).map(str::to_string).or(outer)
        };
        Ok(Self {
            status: stream.status,
            sdk: header(headers::SDK, self.sdk),
            no_retry: header(headers::NO_RETRY, self.no_retry),
            retry_after: stream
                .retry_at
                .clone()
                .or_else(|| header(headers::RETRY_AFTER, self.retry_after)),
            request_version: header(headers::REQUEST_VERSION, self.request_version),
            stream_no_retry: stream.no_retry,
            body: stream.body,
        })
    }
}

/// Turn a raw reply into a [`DriverResponse`].
pub(crate) fn normalize(reply: Reply, window: RetryWindow) -> Result<DriverResponse, DriverError> {
    let reply = if reply.status == STREAM_STATUS {
        reply.unstream()?
    } else {
        reply
    };

    let outcome = match reply.status {
        200 => {
            if reply.sdk.is_none() {
                return Err(DriverError::NotSdkResponse { status: 200 });
            }
            Outcome::Complete(body_value(&reply.body))
        }
        206 => Outcome::Opcodes(parse_opcodes(&reply.body)?),
        status => {
            let body = body_value(&reply.body);
            let error = UserError::from_body(&body, &format!("HTTP {} from SDK", status));
            let header_retry = should_retry(status, reply.no_retry.as_deref(), reply.sdk.as_deref());
            let retryable = header_retry && !reply.stream_no_retry && !error.is_non_retriable();
            let retry_at = reply
                .retry_after
                .as_deref()
                .and_then(|v| parse_retry_at(v, Utc::now(), window).ok());
            Outcome::Error {
                status,
                error,
                retryable,
                retry_at,
            }
        }
    };

    Ok(DriverResponse {
        outcome,
        sdk: reply.sdk,
        request_version: reply.request_version.and_then(|v| v.trim().parse().ok()),
        duration: Duration::ZERO,
    })
}

/// W3C `traceparent` whose trace ID is the run ID.
fn traceparent(run_id: &RunId) -> String {
    let trace = hex::encode(run_id.0.to_bytes());
    let span = hex::encode(rand::random::<[u8; 8]>());
    format!("00-{}-{}-01", trace, span)
}
