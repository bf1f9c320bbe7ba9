// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use navet_core::{Orchestrator, ReactAgent, ServiceRegistry, SseConnector};
use navet_gateway::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::ShowConfig) = &cli.command {
        let config = navet_config::load(cli.config.as_deref())?;
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let config = navet_config::load(cli.config.as_deref())?;

    // ── Components ───────────────────────────────────────────────────────────
    let model = navet_model::from_config(&config.model)?;
    info!(
        provider = model.name(),
        model = model.model_name(),
        "model client initialized"
    );

    let registry = Arc::new(ServiceRegistry::new());
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.hub.http_timeout.max(1)))
        .build()
        .context("building HTTP client")?;
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(SseConnector::new()),
        http,
        config.hub.clone(),
    ));
    let agent = Arc::new(ReactAgent::new(
        model,
        registry,
        orchestrator.health_checker(),
        &config.agent,
    ));

    // ── Startup attachment ───────────────────────────────────────────────────
    // Every configured server is attached on boot; connect-class failures go
    // to the reconnect queue, everything else is just logged.
    let servers_path = cli
        .servers_file
        .clone()
        .unwrap_or_else(navet_config::servers::default_path);
    let server_file = navet_config::servers::load(&servers_path);
    for (name, entry) in &server_file.servers {
        match orchestrator.register_service(&entry.url, name).await {
            Ok(message) => info!(service = %name, message = %message, "attached configured server"),
            Err(e) => {
                warn!(service = %name, url = %entry.url, error = %e, "could not attach configured server")
            }
        }
    }

    orchestrator.start_monitoring();

    // ── Serve until shutdown ─────────────────────────────────────────────────
    let app = Arc::new(App {
        orchestrator: orchestrator.clone(),
        agent,
        servers_path: Some(servers_path),
    });
    let bind = cli.bind.unwrap_or_else(|| config.http.bind.clone());
    let result = navet_gateway::serve(app, &bind).await;

    orchestrator.shutdown();
    result
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
