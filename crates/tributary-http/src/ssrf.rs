// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSRF protection.
//!
//! Outbound SDK requests may only reach public addresses unless the
//! [`SsrfPolicy`] explicitly allows a class of internal address. The check runs
//! in two places:
//!
//! - [`SsrfPolicy::check_url`] before a request is issued, for IP-literal hosts
//!   and `host.docker.internal` (reqwest never calls the resolver for literals).
//! - [`GuardedResolver`], installed as the reqwest DNS resolver, for every name
//!   that needs a lookup. A refusal there fails the connect before any socket
//!   is opened.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{debug, warn};
use url::{Host, Url};

/// Hostname Docker Desktop maps to the host machine.
pub const DOCKER_HOST: &str = "host.docker.internal";

/// Default DNS lookup timeout.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval after which cached DNS answers are refreshed.
pub const DEFAULT_DNS_REFRESH: Duration = Duration::from_secs(60);

/// Classes of address that are refused unless allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressClass {
    /// `127.0.0.0/8`, `::1`.
    Loopback,
    /// RFC 1918 ranges and `100.64.0.0/10`.
    Private,
    /// `169.254.0.0/16`, `fe80::/10`.
    LinkLocal,
    /// IPv6 unique local addresses, `fc00::/7`.
    UniqueLocal,
    /// Multicast and broadcast.
    Multicast,
    /// `0.0.0.0/8`, `::`.
    Unspecified,
    /// NAT64 prefixes `64:ff9b::/96` and `64:ff9b:1::/48`.
    Nat64,
    /// `host.docker.internal`.
    DockerHost,
}

impl AddressClass {
    /// Every class, used by [`SsrfPolicy::permissive`].
    pub const ALL: [AddressClass; 8] = [
        Self::Loopback,
        Self::Private,
        Self::LinkLocal,
        Self::UniqueLocal,
        Self::Multicast,
        Self::Unspecified,
        Self::Nat64,
        Self::DockerHost,
    ];

    /// Configuration name of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Private => "private",
            Self::LinkLocal => "link-local",
            Self::UniqueLocal => "unique-local",
            Self::Multicast => "multicast",
            Self::Unspecified => "unspecified",
            Self::Nat64 => "nat64",
            Self::DockerHost => "docker",
        }
    }

    /// Parse a configuration name.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an address. `None` means a public address.
pub fn classify(ip: IpAddr) -> Option<AddressClass> {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(ip: Ipv4Addr) -> Option<AddressClass> {
    let [a, b, ..] = ip.octets();
    if a == 0 {
        Some(AddressClass::Unspecified)
    } else if ip.is_loopback() {
        Some(AddressClass::Loopback)
    } else if ip.is_private() || (a == 100 && (64..128).contains(&b)) {
        Some(AddressClass::Private)
    } else if ip.is_link_local() {
        Some(AddressClass::LinkLocal)
    } else if ip.is_multicast() || ip.is_broadcast() {
        Some(AddressClass::Multicast)
    } else {
        None
    }
}

fn classify_v6(ip: Ipv6Addr) -> Option<AddressClass> {
    // IPv4-mapped (::ffff:a.b.c.d) takes the class of the embedded address.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_v4(v4);
    }

    let segments = ip.segments();
    if ip.is_unspecified() {
        Some(AddressClass::Unspecified)
    } else if ip.is_loopback() {
        Some(AddressClass::Loopback)
    } else if segments[0] == 0x0064 && segments[1] == 0xff9b {
        // 64:ff9b::/96 well-known and 64:ff9b:1::/48 local-use.
        let well_known = segments[2..6].iter().all(|s| *s == 0);
        let local_use = segments[2] == 0x0001;
        if well_known || local_use {
            Some(AddressClass::Nat64)
        } else {
            None
        }
    } else if (segments[0] & 0xffc0) == 0xfe80 {
        Some(AddressClass::LinkLocal)
    } else if (segments[0] & 0xfe00) == 0xfc00 {
        Some(AddressClass::UniqueLocal)
    } else if ip.is_multicast() {
        Some(AddressClass::Multicast)
    } else {
        None
    }
}

/// A refused destination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("refusing to connect to {host}{}: {class} addresses are blocked", .addr.map(|a| format!(" ({})", a)).unwrap_or_default())]
pub struct SsrfViolation {
    /// Host as written in the URL.
    pub host: String,
    /// The offending resolved address, if any.
    pub addr: Option<IpAddr>,
    /// The class that was refused.
    pub class: AddressClass,
}

/// Which internal address classes outbound requests may reach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsrfPolicy {
    allowed: HashSet<AddressClass>,
}

impl SsrfPolicy {
    /// Refuse every internal class. Production default.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Allow every class. Development default.
    pub fn permissive() -> Self {
        Self {
            allowed: AddressClass::ALL.into_iter().collect(),
        }
    }

    /// Allow one more class.
    pub fn allow(mut self, class: AddressClass) -> Self {
        self.allowed.insert(class);
        self
    }

    /// Whether `class` is allowed.
    pub fn allows(&self, class: AddressClass) -> bool {
        self.allowed.contains(&class)
    }

    /// Check one resolved address for `host`.
    pub fn check_ip(&self, host: &str, ip: IpAddr) -> Result<(), SsrfViolation> {
        match classify(ip) {
            Some(class) if !self.allows(class) => Err(SsrfViolation {
                host: host.to_string(),
                addr: Some(ip),
                class,
            }),
            _ => Ok(()),
        }
    }

    /// Check a hostname before any lookup.
    pub fn check_hostname(&self, host: &str) -> Result<(), SsrfViolation> {
        let normalized = host.trim_end_matches('.').to_ascii_lowercase();
        if normalized == DOCKER_HOST && !self.allows(AddressClass::DockerHost) {
            return Err(SsrfViolation {
                host: host.to_string(),
                addr: None,
                class: AddressClass::DockerHost,
            });
        }
        Ok(())
    }

    /// Pre-flight check of a URL's host.
    pub fn check_url(&self, url: &Url) -> Result<(), SsrfViolation> {
        match url.host() {
            Some(Host::Ipv4(ip)) => self.check_ip(&ip.to_string(), IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => self.check_ip(&ip.to_string(), IpAddr::V6(ip)),
            Some(Host::Domain(domain)) => self.check_hostname(domain),
            None => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("dns lookup for {0} timed out")]
struct LookupTimeout(String);

#[derive(Debug, thiserror::Error)]
#[error("dns lookup for {0} returned no addresses")]
struct NoAddresses(String);

struct CachedLookup {
    addrs: Vec<IpAddr>,
    resolved_at: Instant,
}

struct ResolverInner {
    policy: SsrfPolicy,
    cache: DashMap<String, CachedLookup>,
    refresh: Duration,
    lookup_timeout: Duration,
}

/// DNS resolver that caches answers and enforces an [`SsrfPolicy`].
///
/// Cached answers older than the refresh interval are looked up again; if the
/// refresh fails the stale answer keeps serving.
#[derive(Clone)]
pub struct GuardedResolver {
    inner: Arc<ResolverInner>,
}

impl fmt::Debug for GuardedResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedResolver")
            .field("policy", &self.inner.policy)
            .field("cached", &self.inner.cache.len())
            .field("refresh", &self.inner.refresh)
            .finish()
    }
}

impl GuardedResolver {
    /// Create a resolver.
    pub fn new(policy: SsrfPolicy, refresh: Duration, lookup_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                policy,
                cache: DashMap::new(),
                refresh,
                lookup_timeout,
            }),
        }
    }

    /// The policy this resolver enforces.
    pub fn policy(&self) -> &SsrfPolicy {
        &self.inner.policy
    }

    /// Drop every cached answer.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    /// Resolve `host` and check every address against the policy.
    pub async fn lookup(
        &self,
        host: &str,
    ) -> Result<Vec<IpAddr>, Box<dyn std::error::Error + Send + Sync>> {
        self.inner.policy.check_hostname(host)?;

        let addrs = self.cached_or_resolve(host).await?;
        for ip in &addrs {
            self.inner.policy.check_ip(host, *ip)?;
        }
        Ok(addrs)
    }

    async fn cached_or_resolve(
        &self,
        host: &str,
    ) -> Result<Vec<IpAddr>, Box<dyn std::error::Error + Send + Sync>> {
        let key = host.to_ascii_lowercase();

        let stale = match self.inner.cache.get(&key) {
            Some(entry) if entry.resolved_at.elapsed() < self.inner.refresh => {
                return Ok(entry.addrs.clone());
            }
            Some(entry) => Some(entry.addrs.clone()),
            None => None,
        };

        match self.resolve(host).await {
            Ok(addrs) => {
                debug!(host = %host, count = addrs.len(), "resolved host");
                self.inner.cache.insert(
                    key,
                    CachedLookup {
                        addrs: addrs.clone(),
                        resolved_at: Instant::now(),
                    },
                );
                Ok(addrs)
            }
            Err(e) => match stale {
                Some(addrs) => {
                    warn!(host = %host, error = %e, "dns refresh failed, serving cached answer");
                    Ok(addrs)
                }
                None => Err(e),
            },
        }
    }

    async fn resolve(
        &self,
        host: &str,
    ) -> Result<Vec<IpAddr>, Box<dyn std::error::Error + Send + Sync>> {
        let lookup = tokio::net::lookup_host((host, 0));
        let resolved = tokio::time::timeout(self.inner.lookup_timeout, lookup)
            .await
            .map_err(|_| LookupTimeout(host.to_string()))??;

        let mut addrs: Vec<IpAddr> = resolved.map(|sa| sa.ip()).collect();
        addrs.dedup();
        if addrs.is_empty() {
            return Err(Box::new(NoAddresses(host.to_string())));
        }
        Ok(addrs)
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let addrs = resolver.lookup(name.as_str()).await?;
            let addrs: Addrs = Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
