// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry classification and timing.
//!
//! - [`should_retry`] decides from the status, the `x-inngest-no-retry` header
//!   and the `x-inngest-sdk` version whether a failed response is retried.
//! - [`parse_retry_at`] turns a `retry-after` value into an absolute time,
//!   clipped to a [`RetryWindow`].
//! - [`Backoff`] computes the delay when no `retry-after` is given.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use rand::Rng;

/// Minimum delay accepted from a `retry-after` header.
pub const MIN_RETRY_DURATION: Duration = Duration::from_secs(10);

/// Maximum delay accepted from a `retry-after` header.
pub const MAX_RETRY_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Bounds applied to `retry-after` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWindow {
    /// Earliest allowed retry, relative to now.
    pub min: Duration,
    /// Latest allowed retry, relative to now.
    pub max: Duration,
}

impl Default for RetryWindow {
    fn default() -> Self {
        Self {
            min: MIN_RETRY_DURATION,
            max: MAX_RETRY_DURATION,
        }
    }
}

/// Reasons a `retry-after` value could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryAfterError {
    /// Header absent or empty.
    #[error("no retry-after value")]
    Missing,
    /// Value is neither seconds nor a recognised date.
    #[error("unrecognised retry-after value: {0}")]
    Unparseable(String),
}

/// Parse a `retry-after` value relative to the current time.
pub fn parse_retry(value: &str) -> Result<DateTime<Utc>, RetryAfterError> {
    parse_retry_at(value, Utc::now(), RetryWindow::default())
}

/// Parse a `retry-after` value relative to `now`.
///
/// Values of at most 7 characters are integer seconds (no date fits in 7
/// characters); anything else is tried as RFC 1123, then RFC 3339. The result
/// is clipped so it lies within `window` of `now` truncated to the second.
pub fn parse_retry_at(
    value: &str,
    now: DateTime<Utc>,
    window: RetryWindow,
) -> Result<DateTime<Utc>, RetryAfterError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RetryAfterError::Missing);
    }

    let base = truncate_to_secs(now);
    let at = if value.len() <= 7 {
        match value.parse::<i64>() {
            Ok(secs) if secs > 0 => base + TimeDelta::seconds(secs),
            _ => return Err(RetryAfterError::Unparseable(value.to_string())),
        }
    } else {
        parse_date(value).ok_or_else(|| RetryAfterError::Unparseable(value.to_string()))?
    };

    let min = TimeDelta::from_std(window.min).unwrap_or(TimeDelta::zero());
    let max = TimeDelta::from_std(window.max).unwrap_or(TimeDelta::MAX);
    let until = at - now;
    if until > max {
        return Ok(base + max);
    }
    if until < min {
        return Ok(base + min);
    }
    Ok(at)
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn truncate_to_secs(at: DateTime<Utc>) -> DateTime<Utc> {
    at - TimeDelta::nanoseconds(i64::from(at.timestamp_subsec_nanos()))
}

/// `major.minor.patch[-pre]` as sent in `x-inngest-sdk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Semver {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Patch version.
    pub patch: u64,
    /// Prerelease suffix, if any.
    pub pre: Option<String>,
}

impl Semver {
    /// Parse a `v`-prefixed semantic version. Build metadata is ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('v')?;
        let s = s.split('+').next().unwrap_or(s);
        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return None,
            None => (s, None),
        };

        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map(str::parse::<u64>).transpose().ok()?.unwrap_or(0);
        let patch = parts.next().map(str::parse::<u64>).transpose().ok()?.unwrap_or(0);
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }
}

impl PartialOrd for Semver {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Semver {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

/// SDK identification from `x-inngest-sdk` (`inngest-js:v2.4.0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkVersion {
    /// SDK language/package name.
    pub lang: String,
    /// Parsed version.
    pub version: Semver,
}

impl SdkVersion {
    /// Parse the header value. Returns `None` for anything unexpected.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(':');
        let lang = parts.next()?;
        let version = parts.next()?;
        if parts.next().is_some() || lang.is_empty() {
            return None;
        }
        Some(Self {
            lang: lang.to_string(),
            version: Semver::parse(version)?,
        })
    }

    /// Old JS SDKs expect 4xx responses to be final.
    fn treats_4xx_as_final(&self) -> bool {
        if self.lang != "inngest-js" {
            return false;
        }
        match self.version.major {
            2 => self.version < Semver::new(2, 4, 1),
            1 => self.version < Semver::new(1, 10, 1),
            _ => false,
        }
    }
}

/// Decide whether a response should be retried.
///
/// An explicit `x-inngest-no-retry` header always wins. Without it only 4xx
/// responses can be final, and only for SDK versions that predate the header.
pub fn should_retry(status: u16, no_retry: Option<&str>, sdk: Option<&str>) -> bool {
    if let Some(header) = no_retry.filter(|h| !h.is_empty()) {
        return header != "true";
    }
    if !(400..=499).contains(&status) {
        return true;
    }
    match sdk.and_then(SdkVersion::parse) {
        Some(version) => !version.treats_4xx_as_final(),
        None => true,
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Fraction of the delay randomised, 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::for_request_version(1)
    }
}

impl Backoff {
    /// Backoff used for a given request (hashing) version.
    ///
    /// Version 0 SDKs retry from a longer base.
    pub fn for_request_version(version: i64) -> Self {
        let base = if version >= 1 {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(15)
        };
        Self {
            base,
            max: Duration::from_secs(24 * 60 * 60),
            jitter: 0.1,
        }
    }

    /// Fixed delay, used by tests and local development.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    /// Delay before retrying after the zero-based `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        let delay = self.base.saturating_mul(factor).min(self.max);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0)).min(self.max)
    }
}
