// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tributary-http.

use std::error::Error as StdError;
use std::time::Duration;

use crate::ssrf::SsrfViolation;

/// Coarse classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP/TLS connection could not be established.
    Connect,
    /// Host could not be resolved or no route exists.
    Unreachable,
    /// The peer reset the connection mid-response.
    Reset,
    /// The response ended before the declared length.
    UnexpectedEof,
    /// Anything else reported by the HTTP stack.
    Other,
}

/// Errors produced while talking to an SDK endpoint.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HttpError {
    /// The destination resolved to an address the SSRF policy refuses.
    #[error(transparent)]
    Blocked(#[from] SsrfViolation),

    /// The request exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Network-level failure.
    #[error("{message}")]
    Transport {
        /// Failure class.
        kind: TransportKind,
        /// Underlying error text.
        message: String,
    },

    /// Redirect chain longer than the configured maximum.
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),

    /// A redirect pointed somewhere unusable.
    #[error("invalid redirect location: {0}")]
    InvalidRedirect(String),

    /// The response body exceeded the read limit.
    #[error("response body exceeded the {limit} byte limit")]
    BodyTooLarge {
        /// Configured limit in bytes.
        limit: usize,
        /// Status code of the oversized response.
        status: u16,
    },

    /// The client could not be constructed or the request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpError {
    /// Whether a failed request may be attempted again.
    ///
    /// SSRF refusals, oversized bodies and malformed requests fail the same
    /// way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Blocked(_) | Self::BodyTooLarge { .. } | Self::InvalidRequest(_)
        )
    }

    /// Message suitable for surfacing to the function author.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport {
                kind: TransportKind::Connect | TransportKind::Unreachable,
                ..
            } => "Unable to reach SDK URL".to_string(),
            Self::Transport {
                kind: TransportKind::Reset,
                ..
            } => "Your server reset the connection while we were reading the reply".to_string(),
            Self::Transport {
                kind: TransportKind::UnexpectedEof,
                ..
            } => "Your server closed the connection before finishing the response".to_string(),
            Self::Timeout(_) => "Your server did not respond before the function timeout".to_string(),
            Self::BodyTooLarge { limit, .. } => {
                format!("The response was larger than the {} byte limit", limit)
            }
            other => other.to_string(),
        }
    }

    /// Map a reqwest error, recovering SSRF refusals raised inside the resolver.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if let Some(violation) = find_violation(&err) {
            return Self::Blocked(violation.clone());
        }
        if err.is_timeout() {
            return Self::Timeout(timeout);
        }
        if err.is_builder() {
            return Self::InvalidRequest(err.to_string());
        }

        let message = error_chain(&err);
        let lowered = message.to_ascii_lowercase();
        let kind = if lowered.contains("connection reset") || lowered.contains("broken pipe") {
            TransportKind::Reset
        } else if lowered.contains("unexpected eof")
            || lowered.contains("incomplete message")
            || lowered.contains("unexpected end")
        {
            TransportKind::UnexpectedEof
        } else if lowered.contains("dns")
            || lowered.contains("no route to host")
            || lowered.contains("network is unreachable")
            || lowered.contains("failed to lookup")
        {
            TransportKind::Unreachable
        } else if err.is_connect() {
            TransportKind::Connect
        } else {
            TransportKind::Other
        };

        Self::Transport { kind, message }
    }
}

fn find_violation<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a SsrfViolation> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(violation) = e.downcast_ref::<SsrfViolation>() {
            return Some(violation);
        }
        current = e.source();
    }
    None
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssrf::AddressClass;

    #[test]
    fn test_retryability() {
        let blocked = HttpError::Blocked(SsrfViolation {
            host: "10.0.0.1".to_string(),
            addr: Some("10.0.0.1".parse().unwrap()),
            class: AddressClass::Private,
        });
        assert!(!blocked.is_retryable());
        assert!(!HttpError::BodyTooLarge { limit: 10, status: 200 }.is_retryable());

        assert!(HttpError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(HttpError::TooManyRedirects(10).is_retryable());
        assert!(
            HttpError::Transport {
                kind: TransportKind::Reset,
                message: "reset".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_user_messages() {
        let unreachable = HttpError::Transport {
            kind: TransportKind::Connect,
            message: "tcp connect error: Connection refused".into(),
        };
        assert_eq!(unreachable.user_message(), "Unable to reach SDK URL");

        let eof = HttpError::Transport {
            kind: TransportKind::UnexpectedEof,
            message: "incomplete message".into(),
        };
        assert!(eof.user_message().contains("closed the connection"));

        assert_eq!(
            HttpError::TooManyRedirects(10).user_message(),
            "stopped after 10 redirects"
        );
    }
}
