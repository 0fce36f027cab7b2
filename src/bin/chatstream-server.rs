// ABOUTME: Server binary wiring configuration, logging, and the relay router
// ABOUTME: Serves the chat relay over HTTP with graceful shutdown on SIGINT and SIGTERM
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

#![recursion_limit = "256"]

//! # Chatstream Server Binary
//!
//! Starts the streaming chat relay: loads the environment configuration,
//! initializes logging, builds the shared server resources, and serves the
//! axum router until a shutdown signal arrives.

use anyhow::{Context, Result};
use chatstream::config::ServerConfig;
use chatstream::logging;
use chatstream::resources::ServerResources;
use chatstream::routes;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Command line arguments
#[derive(Parser)]
#[command(name = "chatstream-server")]
#[command(about = "Streaming chat relay for Azure/OpenAI chat APIs")]
pub struct Args {
    /// Override HTTP port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Argument parsing failed: {e}");
            eprintln!("Using environment configuration only");
            Args { http_port: None }
        }
    };

    let mut config = ServerConfig::from_env()?;
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }

    logging::init_from_env()?;

    info!("Starting chatstream relay");
    info!("{}", config.summary());

    let resources = ServerResources::builder().with_config(config).build_arc()?;
    let port = resources.config.http_port;
    let app = routes::router(resources);

    let address = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;
    info!(%address, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("relay shut down");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
