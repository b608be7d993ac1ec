//! toolgate server
//!
//! Entry point: loads configuration, initializes logging, and serves the gateway.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use toolgate::{config::AppConfig, server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let config = AppConfig::load().context("failed to load configuration")?;
    telemetry::init(&config.log);

    server::start_server(Arc::new(config)).await
}
