// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier types.
//!
//! | Type | Shape |
//! |------|-------|
//! | [`TenantId`] | account, environment and app UUIDs |
//! | [`FunctionId`] | UUIDv5 of the canonical function definition |
//! | [`RunId`] | ULID, sortable by creation millisecond |
//! | [`PauseId`] | UUIDv5 of the owning run and step, or random UUIDv4 |
//! | step hash | 40 hex chars chosen by the SDK, kept as `String` |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;
use uuid::Uuid;

/// Namespace for deterministic function IDs.
const FUNCTION_NAMESPACE: Uuid = Uuid::from_u128(0x5a1b_8c0e_3d4f_4e21_9a7b_6c5d_4e3f_2a10);

/// Namespace for pause IDs derived from a run.
const PAUSE_NAMESPACE: Uuid = Uuid::from_u128(0x9c3e_71d2_0b8a_4f65_a2d4_1e7f_30c9_58b6);

/// Isolation boundary for runs, pauses and indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct TenantId {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub app_id: Uuid,
}

impl TenantId {
    pub fn new(account_id: Uuid, env_id: Uuid, app_id: Uuid) -> Self {
        Self {
            account_id,
            env_id,
            app_id,
        }
    }

    /// Stable string form used as an index key component.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.account_id, self.env_id, self.app_id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let mut next = || Uuid::parse_str(parts.next().unwrap_or_default());
        Ok(Self {
            account_id: next()?,
            env_id: next()?,
            app_id: next()?,
        })
    }
}

/// Deterministic function identifier.
///
/// Equal canonical definitions produce equal IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub Uuid);

impl FunctionId {
    /// Derive an ID from canonical bytes (see `FunctionDefinition::canonical_bytes`).
    pub fn from_canonical(bytes: &[u8]) -> Self {
        Self(Uuid::new_v5(&FUNCTION_NAMESPACE, bytes))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FunctionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Ulid);

impl RunId {
    /// A fresh ID stamped with the current time.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// A fresh ID stamped with `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        let ms = at.timestamp_millis().max(0) as u64;
        Self(Ulid::from_parts(ms, rand::random::<u128>()))
    }

    /// Creation time embedded in the ID.
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0.timestamp_ms() as i64)
            .single()
            .unwrap_or_default()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Opaque pause token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PauseId(pub Uuid);

impl PauseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The pause `run_id` opens for `key`. Replaying the same opcode yields
    /// the same ID, so the pause is stored once.
    pub fn for_step(run_id: &RunId, key: &str) -> Self {
        Self(Uuid::new_v5(
            &PAUSE_NAMESPACE,
            format!("{}:{}", run_id, key).as_bytes(),
        ))
    }
}

impl Default for PauseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PauseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PauseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Whether `s` has the shape of an SDK step hash.
pub fn is_step_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// 40-hex content hash of an arbitrary step key.
///
/// Used for engine-synthesized entries (e.g. invoke correlation) that need a
/// durable key of the same shape as SDK hashes.
pub fn hash_step_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..20])
}
