// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tributary Core - Durable Function Execution Engine
//!
//! This crate takes events, matches them against registered functions and
//! drives each function through a sequence of steps by calling its SDK over
//! HTTP. Progress survives restarts, retries, cancellations and long waits
//! for external events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    events     ┌──────────┐   StartRun/ContinueRun   ┌───────┐
//! │  HTTP API    │──────────────►│  Runner  │─────────────────────────►│ Queue │
//! └──────────────┘               └────┬─────┘                          └───┬───┘
//!                                     │ resume                             │ lease
//!                                     ▼                                    ▼
//!                             ┌──────────────┐   pauses      ┌──────────────────┐
//!                             │ PauseManager │◄──────────────│     Executor     │
//!                             └──────┬───────┘               └────┬────────┬────┘
//!                                    │ match                      │        │
//!                                    ▼                            ▼        ▼
//!                           ┌────────────────┐           ┌──────────┐ ┌─────────┐
//!                           │  Expressions   │           │ Drivers  │ │  State  │
//!                           └────────────────┘           └────┬─────┘ └─────────┘
//!                                                             │ signed POST
//!                                                             ▼
//!                                                        user's SDK
//! ```
//!
//! # Step Protocol
//!
//! Every step invocation POSTs the run context to the SDK. The SDK answers:
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `200` | The function returned; the body is its output |
//! | `206` | A list of opcodes: steps ran, errored, were planned, or wait |
//! | `201` | A streamed response wrapping one of the above |
//! | other | An error, retried per status, headers and SDK version |
//!
//! # Run Status State Machine
//!
//! ```text
//!   ┌───────────┐  start   ┌─────────┐  pause   ┌────────┐
//!   │ SCHEDULED │─────────►│ RUNNING │◄────────►│ PAUSED │
//!   └─────┬─────┘          └────┬────┘  resume  └───┬────┘
//!         │                     │                   │
//!         └─────────┬───────────┴─────────┬─────────┘
//!                   ▼                     ▼
//!      ┌───────────┬────────┐      ┌───────────┐
//!      │ COMPLETED │ FAILED │      │ CANCELLED │
//!      └───────────┴────────┘      └───────────┘
//! ```
//!
//! Terminal statuses are final.
//!
//! # Modules
//!
//! - [`runner`]: event intake, run scheduling, invokes, crons, cancellation
//! - [`executor`]: one step of one run per queue item
//! - [`state`]: durable run state and pauses, in memory or SQLite
//! - [`pauses`]: pause creation, matching, consumption and timeouts
//! - [`driver`]: SDK drivers (HTTP, mock) and response normalization
//! - [`expressions`]: guard and match expression language
//! - [`opcode`]: SDK opcodes and user errors
//! - [`queue`]: queue abstraction and the in-process queue
//! - [`runtime`]: embeddable runtime with worker pool and background tasks
//! - [`config`]: configuration from environment variables

pub mod config;
pub mod driver;
pub mod duration;
pub mod error;
pub mod event;
pub mod executor;
pub mod expressions;
pub mod function;
pub mod ids;
pub mod lifecycle;
pub mod migrations;
pub mod opcode;
pub mod pauses;
pub mod queue;
pub mod runner;
pub mod runtime;
pub mod state;

#[cfg(feature = "server")]
pub mod api;

pub use error::{CoreError, Result};
pub use event::Event;
pub use function::{FunctionDefinition, FunctionRegistry};
pub use ids::{FunctionId, PauseId, RunId, TenantId};
pub use runtime::{EngineRuntime, EngineRuntimeBuilder};
pub use state::{MemoryStateStore, RunStatus, SqliteStateStore, StateStore};
