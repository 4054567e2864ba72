// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK HTTP client for tributary.
//!
//! Every step invocation made by the engine goes through [`HttpClient`]. The
//! client is deliberately narrow: it knows nothing about runs or opcodes, only
//! how to get bytes to an SDK endpoint and back safely.
//!
//! # What it does
//!
//! | Concern | Module |
//! |---------|--------|
//! | `X-Inngest-Signature` HMAC signing and verification | [`signature`] |
//! | Address classification and the SSRF-checked DNS resolver | [`ssrf`] |
//! | `retry-after` parsing, retry classification, backoff | [`retry`] |
//! | Streamed (HTTP 201) response envelopes | [`stream`] |
//! | Redirect following, size-limited body reads, timeouts | [`client`] |
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary_http::{HttpClient, HttpClientConfig, Request, SsrfPolicy};
//!
//! let client = HttpClient::new(HttpClientConfig {
//!     ssrf: SsrfPolicy::strict(),
//!     ..Default::default()
//! })?;
//!
//! let response = client
//!     .send(Request::post("https://app.example.com/api/inngest".parse()?).json_body(body))
//!     .await?;
//! ```

#![deny(missing_docs)]

pub mod client;
pub mod error;
pub mod retry;
pub mod signature;
pub mod ssrf;
pub mod stream;

pub use client::{HttpClient, HttpClientConfig, Request, Response};
pub use error::{HttpError, TransportKind};
pub use retry::{
    Backoff, RetryAfterError, RetryWindow, SdkVersion, parse_retry, parse_retry_at, should_retry,
};
pub use signature::{SignatureError, sign, verify};
pub use ssrf::{AddressClass, GuardedResolver, SsrfPolicy, SsrfViolation};
pub use stream::{StreamError, StreamResponse};

/// Default cap on response bodies read from an SDK (4 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Hard upper bound on a single SDK request (2 hours).
pub const MAX_FUNCTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2 * 60 * 60);

/// Maximum redirects followed before the request fails.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Well-known header names shared by the engine and SDKs.
pub mod headers {
    /// Request signature (`t=<secs>&s=<hex>`).
    pub const SIGNATURE: &str = "x-inngest-signature";
    /// Run identifier of the invocation.
    pub const RUN_ID: &str = "x-run-id";
    /// Request (hashing) version, sent and received.
    pub const REQUEST_VERSION: &str = "x-inngest-req-version";
    /// Account identifier of the tenant.
    pub const ACCOUNT_ID: &str = "account-id";
    /// Environment name of the tenant.
    pub const ENV: &str = "x-inngest-env";
    /// W3C trace propagation.
    pub const TRACEPARENT: &str = "traceparent";
    /// SDK identification, `<lang>:<semver>`.
    pub const SDK: &str = "x-inngest-sdk";
    /// `"true"` disables retries for the response.
    pub const NO_RETRY: &str = "x-inngest-no-retry";
    /// Standard retry-after header.
    pub const RETRY_AFTER: &str = "retry-after";
}
