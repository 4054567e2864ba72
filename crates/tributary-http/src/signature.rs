// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request signing.
//!
//! The signature header has the form `t=<unix-seconds>&s=<hex>` where the hex
//! part is `HMAC-SHA256(body || ascii-decimal-seconds, key)`. An empty key
//! disables signing; the request is still sent, just without the header.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The header is not `t=<secs>&s=<hex>`.
    #[error("malformed signature header")]
    Malformed,
    /// The timestamp is older than the accepted window.
    #[error("signature expired")]
    Expired,
    /// The MAC does not match the body.
    #[error("signature mismatch")]
    Mismatch,
}

/// Sign `body` at `at` with `key`.
///
/// Returns `None` when `key` is empty.
pub fn sign(key: &[u8], body: &[u8], at: DateTime<Utc>) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let ts = at.timestamp();
    Some(format!("t={}&s={}", ts, hex::encode(mac(key, body, ts))))
}

/// Verify a signature header produced by [`sign`].
///
/// `max_age` bounds how far in the past `t` may be relative to `now`.
pub fn verify(
    key: &[u8],
    body: &[u8],
    header: &str,
    now: DateTime<Utc>,
    max_age: Option<chrono::Duration>,
) -> Result<(), SignatureError> {
    let (ts, sig) = parse_header(header)?;

    if let Some(max_age) = max_age
        && now.timestamp() - ts > max_age.num_seconds()
    {
        return Err(SignatureError::Expired);
    }

    let expected = hex::decode(sig).map_err(|_| SignatureError::Malformed)?;
    let mut verifier =
        HmacSha256::new_from_slice(key).map_err(|_| SignatureError::Malformed)?;
    verifier.update(body);
    verifier.update(ts.to_string().as_bytes());
    verifier
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn mac(key: &[u8], body: &[u8], ts: i64) -> Vec<u8> {
    // HMAC accepts keys of any length, new_from_slice cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.update(ts.to_string().as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn parse_header(header: &str) -> Result<(i64, &str), SignatureError> {
    let mut ts = None;
    let mut sig = None;
    for part in header.split('&') {
        match part.split_once('=') {
            Some(("t", value)) => ts = value.parse::<i64>().ok(),
            Some(("s", value)) => sig = Some(value),
            _ => {}
        }
    }
    match (ts, sig) {
        (Some(ts), Some(sig)) if !sig.is_empty() => Ok((ts, sig)),
        _ => Err(SignatureError::Malformed),
    }
}
