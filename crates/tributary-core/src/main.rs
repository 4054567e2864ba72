// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tributary Core - Durable Function Execution Engine
//!
//! Standalone server: the engine runtime plus the HTTP API.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use tributary_core::api::{self, ApiState};
use tributary_core::config::Config;
use tributary_core::ids::TenantId;
use tributary_core::runtime::EngineRuntime;
use tributary_core::state::{MemoryStateStore, SqliteStateStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tributary_core=info".parse()?),
        )
        .init();

    info!("Starting Tributary Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        workers = config.workers,
        mode = ?config.mode,
        env = %config.env,
        "Configuration loaded"
    );

    let state: Arc<dyn StateStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let store = SqliteStateStore::from_url(url).await?;
            info!("Database ready");
            Arc::new(store)
        }
        None => {
            info!("No database configured, run state is kept in memory");
            Arc::new(MemoryStateStore::new())
        }
    };

    let runtime = EngineRuntime::builder()
        .state(state.clone())
        .http_client(config.http_client_config())
        .http_driver(config.http_driver_config())
        .executor(config.executor_config())
        .workers(config.workers)
        .lease_timeout(config.max_function_timeout + std::time::Duration::from_secs(60))
        .expiry_interval(config.expiry_interval)
        .cron_interval(config.cron_interval)
        .build()?
        .start()
        .await?;

    let app = api::router(ApiState {
        runner: runtime.runner().clone(),
        state,
        event_key: config.event_key.clone(),
        tenant: TenantId::default(),
    });
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
        })
        .await?;

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
