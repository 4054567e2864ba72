// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The outbound HTTP client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode, redirect};
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::{HttpError, TransportKind};
use crate::ssrf::{
    DEFAULT_DNS_REFRESH, DEFAULT_LOOKUP_TIMEOUT, GuardedResolver, SsrfPolicy, SsrfViolation,
};
use crate::{DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_REDIRECTS, MAX_FUNCTION_TIMEOUT};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Address classes requests may reach.
    pub ssrf: SsrfPolicy,
    /// Redirects followed before failing.
    pub max_redirects: usize,
    /// Largest response body read, in bytes.
    pub max_body_size: usize,
    /// Upper bound on any request, including redirects and body read.
    pub timeout: Duration,
    /// Age after which cached DNS answers are refreshed.
    pub dns_refresh: Duration,
    /// Timeout for a single DNS lookup.
    pub lookup_timeout: Duration,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            ssrf: SsrfPolicy::strict(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            timeout: MAX_FUNCTION_TIMEOUT,
            dns_refresh: DEFAULT_DNS_REFRESH,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            user_agent: format!("tributary/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method, preserved across redirects.
    pub method: Method,
    /// Destination.
    pub url: Url,
    /// Headers, replayed on every redirect hop.
    pub headers: HeaderMap,
    /// Body, replayed on every redirect hop.
    pub body: Vec<u8>,
    /// Per-request timeout, capped by the client timeout.
    pub timeout: Option<Duration>,
}

impl Request {
    /// A POST to `url` with no body.
    pub fn post(url: Url) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
            timeout: None,
        }
    }

    /// Set a JSON body and the matching content type.
    pub fn json_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = body;
        self
    }

    /// Add a header. Invalid names or values are dropped with a warning.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = %name, "dropping invalid request header"),
        }
        self
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Vec<u8>,
    /// URL that produced the response, after redirects.
    pub url: Url,
    /// Wall time spent on the request.
    pub duration: Duration,
}

impl Response {
    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// SSRF-checked HTTP client with manual redirect handling and bounded reads.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    resolver: GuardedResolver,
    config: Arc<HttpClientConfig>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.config)
            .finish()
    }
}

impl HttpClient {
    /// Build a client.
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let resolver = GuardedResolver::new(
            config.ssrf.clone(),
            config.dns_refresh,
            config.lookup_timeout,
        );
        let inner = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .dns_resolver(Arc::new(resolver.clone()))
            .user_agent(config.user_agent.clone())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            inner,
            resolver,
            config: Arc::new(config),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// The DNS resolver shared by every request.
    pub fn resolver(&self) -> &GuardedResolver {
        &self.resolver
    }

    /// Send a request, following redirects, and read the whole body.
    pub async fn send(&self, request: Request) -> Result<Response, HttpError> {
        let timeout = request
            .timeout
            .map_or(self.config.timeout, |t| t.min(self.config.timeout));
        let started = Instant::now();

        let mut response = tokio::time::timeout(timeout, self.send_following(request, timeout))
            .await
            .map_err(|_| HttpError::Timeout(timeout))??;
        response.duration = started.elapsed();
        Ok(response)
    }

    async fn send_following(&self, request: Request, timeout: Duration) -> Result<Response, HttpError> {
        let original_query: Vec<(String, String)> =
            request.url.query_pairs().into_owned().collect();
        let mut url = request.url.clone();
        let mut hops = 0usize;

        loop {
            self.preflight(&url).await?;

            let resp = self
                .inner
                .request(request.method.clone(), url.clone())
                .headers(request.headers.clone())
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| HttpError::from_reqwest(e, timeout))?;

            let status = resp.status();
            if status.is_redirection()
                && let Some(location) = resp.headers().get(LOCATION)
            {
                hops += 1;
                if hops > self.config.max_redirects {
                    return Err(HttpError::TooManyRedirects(self.config.max_redirects));
                }
                let location = location
                    .to_str()
                    .map_err(|_| HttpError::InvalidRedirect("non-ascii location".to_string()))?;
                let mut next = url
                    .join(location)
                    .map_err(|_| HttpError::InvalidRedirect(location.to_string()))?;
                retain_query(&mut next, &original_query);

                debug!(from = %url, to = %next, hop = hops, "following redirect");
                url = next;
                continue;
            }

            let headers = resp.headers().clone();
            let body = read_limited(resp, self.config.max_body_size, timeout).await?;
            return Ok(Response {
                status,
                headers,
                body,
                url,
                duration: Duration::ZERO,
            });
        }
    }
}

impl HttpClient {
    /// Refuse blocked destinations before reqwest opens a connection.
    ///
    /// Names are resolved through the shared resolver so the connect that
    /// follows is served from the same cached answer.
    async fn preflight(&self, url: &Url) -> Result<(), HttpError> {
        self.config.ssrf.check_url(url)?;
        let Some(Host::Domain(domain)) = url.host() else {
            return Ok(());
        };
        match self.resolver.lookup(domain).await {
            Ok(_) => Ok(()),
            Err(e) => match e.downcast::<SsrfViolation>() {
                Ok(violation) => Err(HttpError::Blocked(*violation)),
                Err(e) => Err(HttpError::Transport {
                    kind: TransportKind::Unreachable,
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// Re-apply the original request's query parameters to a redirect target.
fn retain_query(next: &mut Url, original: &[(String, String)]) {
    if original.is_empty() {
        return;
    }
    let mut pairs: Vec<(String, String)> = next
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| !original.iter().any(|(ok, _)| ok == k))
        .collect();
    pairs.extend(original.iter().cloned());
    next.query_pairs_mut().clear().extend_pairs(pairs);
}

async fn read_limited(
    mut resp: reqwest::Response,
    limit: usize,
    timeout: Duration,
) -> Result<Vec<u8>, HttpError> {
    let status = resp.status().as_u16();
    let mut body = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| HttpError::from_reqwest(e, timeout))?
    {
        if body.len() + chunk.len() > limit {
            return Err(HttpError::BodyTooLarge { limit, status });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
