// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function definitions and the in-process registry.
//!
//! A definition is validated once, when registered: trigger guards, match
//! and cancellation expressions are compiled, cron schedules and durations
//! parsed, step URIs checked. Nothing about a definition is re-validated at
//! run time.
//!
//! Runs are driven by the SDK's generator from the entry step alone. `after`
//! edges, and any wait they carry, only decide which step is the entry; the
//! executor never follows them to a successor step.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::driver::DriverKind;
use crate::duration::parse_duration;
use crate::error::{CoreError, Result};
use crate::expressions::ExpressionCache;
use crate::ids::{FunctionId, TenantId};

/// Step ID SDK-style functions use for their single step.
pub const DEFAULT_STEP_ID: &str = "step";

/// Upper bound on per-step retries.
pub const MAX_RETRIES: u32 = 20;

fn default_retries() -> u32 {
    3
}

fn default_runtime() -> String {
    "http".to_string()
}

/// A registered function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub slug: String,
    pub name: String,
    pub triggers: Vec<Trigger>,
    pub steps: BTreeMap<String, StepDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<CancelRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Concurrency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

/// What starts a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    Cron {
        cron: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub uri: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Predecessors. Validated and used to find the entry step; not executed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<Edge>,
}

/// Link from a predecessor step, optionally gated on an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<AsyncWait>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncWait {
    pub event: String,
    pub ttl: String,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Cancel the run when a matching event arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRule {
    pub event: String,
    /// How long the rule stays armed. Defaults to the run's lifetime cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Limit on simultaneously running runs, optionally per evaluated key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concurrency {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Limit on runs started per period, optionally per evaluated key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub period: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl StepDefinition {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(|t| parse_duration(t).ok())
    }
}

impl FunctionDefinition {
    /// Bytes hashed into the function ID. Struct fields serialize in
    /// declaration order and steps are a sorted map, so equal definitions
    /// produce equal bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn id(&self) -> FunctionId {
        FunctionId::from_canonical(&self.canonical_bytes())
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    /// The step a new run starts at: the default step if present, else the
    /// first step without predecessors.
    pub fn entry_step(&self) -> Option<&StepDefinition> {
        self.steps.get(DEFAULT_STEP_ID).or_else(|| {
            self.steps.values().find(|s| s.after.is_empty())
        })
    }

    pub fn event_triggers(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.triggers.iter().filter_map(|t| match t {
            Trigger::Event { event, expression } => Some((event.as_str(), expression.as_deref())),
            Trigger::Cron { .. } => None,
        })
    }

    pub fn rate_limit_period(&self) -> Option<Duration> {
        self.rate_limit
            .as_ref()
            .and_then(|r| parse_duration(&r.period).ok())
    }

    fn invalid(&self, message: impl Into<String>) -> CoreError {
        CoreError::InvalidFunction {
            function: self.slug.clone(),
            message: message.into(),
        }
    }

    /// Check the definition and compile its expressions into `cache`.
    pub fn validate(&self, cache: &ExpressionCache) -> Result<()> {
        if self.slug.trim().is_empty() {
            return Err(self.invalid("slug is required"));
        }
        if self.triggers.is_empty() {
            return Err(self.invalid("at least one trigger is required"));
        }
        if self.steps.is_empty() {
            return Err(self.invalid("at least one step is required"));
        }

        let compile = |what: &str, src: &str| {
            cache
                .compile(src)
                .map(|_| ())
                .map_err(|e| self.invalid(format!("{}: {}", what, e)))
        };
        let duration = |what: &str, src: &str| {
            parse_duration(src)
                .map(|_| ())
                .map_err(|e| self.invalid(format!("{}: {}", what, e)))
        };

        for trigger in &self.triggers {
            match trigger {
                Trigger::Event { event, expression } => {
                    if event.trim().is_empty() {
                        return Err(self.invalid("trigger event name is empty"));
                    }
                    if let Some(expr) = expression {
                        compile("trigger expression", expr)?;
                    }
                }
                Trigger::Cron { cron } => {
                    parse_cron(cron).map_err(|e| self.invalid(e))?;
                }
            }
        }

        for (key, step) in &self.steps {
            if key != &step.id {
                return Err(self.invalid(format!(
                    "step keyed '{}' declares id '{}'",
                    key, step.id
                )));
            }
            step.runtime
                .parse::<DriverKind>()
                .map_err(|e| self.invalid(e.to_string()))?;
            Url::parse(&step.uri)
                .map_err(|e| self.invalid(format!("step '{}' uri: {}", step.id, e)))?;
            if step.retries > MAX_RETRIES {
                return Err(self.invalid(format!(
                    "step '{}' retries {} exceeds {}",
                    step.id, step.retries, MAX_RETRIES
                )));
            }
            if let Some(t) = &step.timeout {
                duration("step timeout", t)?;
            }
            for edge in &step.after {
                if !self.steps.contains_key(&edge.step) {
                    return Err(self.invalid(format!(
                        "step '{}' follows unknown step '{}'",
                        step.id, edge.step
                    )));
                }
                if let Some(wait) = &edge.wait {
                    duration("edge ttl", &wait.ttl)?;
                    if let Some(expr) = &wait.expression {
                        compile("edge match", expr)?;
                    }
                }
            }
        }
        if self.has_cycle() {
            return Err(self.invalid("step edges form a cycle"));
        }
        if self.entry_step().is_none() {
            return Err(self.invalid("no entry step"));
        }

        for rule in &self.cancel {
            if rule.event.trim().is_empty() {
                return Err(self.invalid("cancel event name is empty"));
            }
            if let Some(expr) = &rule.expression {
                compile("cancel expression", expr)?;
            }
            if let Some(t) = &rule.timeout {
                duration("cancel timeout", t)?;
            }
        }

        if let Some(c) = &self.concurrency {
            if c.limit == 0 {
                return Err(self.invalid("concurrency limit must be positive"));
            }
            if let Some(key) = &c.key {
                compile("concurrency key", key)?;
            }
        }
        if let Some(r) = &self.rate_limit {
            if r.limit == 0 {
                return Err(self.invalid("rate limit must be positive"));
            }
            duration("rate limit period", &r.period)?;
            if let Some(key) = &r.key {
                compile("rate limit key", key)?;
            }
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        fn visit<'a>(
            def: &'a FunctionDefinition,
            id: &'a str,
            path: &mut HashSet<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> bool {
            if done.contains(id) {
                return false;
            }
            if !path.insert(id) {
                return true;
            }
            let cyclic = def
                .steps
                .get(id)
                .is_some_and(|s| s.after.iter().any(|e| visit(def, &e.step, path, done)));
            path.remove(id);
            done.insert(id);
            cyclic
        }

        let mut done = HashSet::new();
        self.steps
            .keys()
            .any(|id| visit(self, id, &mut HashSet::new(), &mut done))
    }
}

/// Parse a cron schedule (five fields, optional seconds).
pub fn parse_cron(expr: &str) -> std::result::Result<Cron, String> {
    Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| format!("cron '{}': {}", expr, e))
}

/// Next time `cron` fires strictly after `after`.
pub fn next_fire(cron: &Cron, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.find_next_occurrence(&after, false).ok()
}

/// A definition bound to its tenant and derived ID.
#[derive(Debug, Clone)]
pub struct RegisteredFunction {
    pub id: FunctionId,
    pub tenant: TenantId,
    pub definition: FunctionDefinition,
}

/// Concurrent registry of functions, addressable by ID or by (tenant, slug).
#[derive(Debug)]
pub struct FunctionRegistry {
    by_id: DashMap<FunctionId, Arc<RegisteredFunction>>,
    by_slug: DashMap<(TenantId, String), FunctionId>,
    expressions: &'static ExpressionCache,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_slug: DashMap::new(),
            expressions: ExpressionCache::global(),
        }
    }

    /// Validate and register `definition` as the current version of its
    /// slug. Earlier versions stay resolvable by ID so in-flight runs can
    /// finish, but no longer receive events.
    pub fn register(
        &self,
        tenant: TenantId,
        definition: FunctionDefinition,
    ) -> Result<Arc<RegisteredFunction>> {
        definition.validate(self.expressions)?;
        let id = definition.id();
        let registered = Arc::new(RegisteredFunction {
            id,
            tenant,
            definition,
        });

        self.by_id.insert(id, Arc::clone(&registered));
        self.by_slug
            .insert((tenant, registered.definition.slug.clone()), id);
        info!(function_id = %id, slug = %registered.definition.slug, "Function registered");
        Ok(registered)
    }

    /// Any version ever registered.
    pub fn get(&self, id: &FunctionId) -> Option<Arc<RegisteredFunction>> {
        self.by_id.get(id).map(|f| Arc::clone(f.value()))
    }

    /// Current version of a slug.
    pub fn by_slug(&self, tenant: TenantId, slug: &str) -> Option<Arc<RegisteredFunction>> {
        let id = *self.by_slug.get(&(tenant, slug.to_string()))?;
        self.get(&id)
    }

    /// Resolve an invoke target: a function ID or a slug within `tenant`.
    pub fn resolve(&self, tenant: TenantId, target: &str) -> Option<Arc<RegisteredFunction>> {
        target
            .parse::<FunctionId>()
            .ok()
            .and_then(|id| self.get(&id))
            .or_else(|| self.by_slug(tenant, target))
    }

    /// Stop routing events to a slug. Its versions stay resolvable by ID.
    pub fn remove(&self, tenant: TenantId, slug: &str) -> bool {
        self.by_slug.remove(&(tenant, slug.to_string())).is_some()
    }

    /// Current versions of all functions, sorted by slug.
    pub fn all(&self) -> Vec<Arc<RegisteredFunction>> {
        let mut fns: Vec<_> = self
            .by_slug
            .iter()
            .filter_map(|entry| self.get(entry.value()))
            .collect();
        fns.sort_by(|a, b| a.definition.slug.cmp(&b.definition.slug));
        fns
    }

    /// Current functions of `tenant` with an event trigger named `event`.
    pub fn triggered_by(&self, tenant: TenantId, event: &str) -> Vec<Arc<RegisteredFunction>> {
        self.all()
            .into_iter()
            .filter(|f| f.tenant == tenant)
            .filter(|f| f.definition.event_triggers().any(|(name, _)| name == event))
            .collect()
    }

    pub fn expressions(&self) -> &'static ExpressionCache {
        self.expressions
    }

    /// Number of current functions.
    pub fn len(&self) -> usize {
        self.by_slug.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slug.is_empty()
    }
}
