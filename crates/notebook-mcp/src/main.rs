//! # Notebook MCP Server
//!
//! Model Context Protocol server that lets AI agents run code in a live,
//! collaborative Jupyter notebook.
//!
//! ## Overview
//!
//! This server provides MCP tools for:
//! - Code execution (append a cell, run it, return its outputs)
//! - Notes (append markdown cells)
//! - Reading the notebook
//! - Kernel restart
//!
//! ## Architecture
//!
//! This is Layer 3 - the main MCP server binary that ties together:
//! - notebook-mcp-core: Core types and configuration
//! - notebook-mcp-transport: WebSocket and REST channels
//! - notebook-mcp-session: Document and kernel clients, execution bridge

use std::sync::Arc;

use anyhow::Context;
use rmcp::{transport::stdio, ServiceExt};
use uuid::Uuid;

use notebook_mcp::NotebookMcpServer;
use notebook_mcp_core::config::ENV_CONFIG_FILE;
use notebook_mcp_core::ServerConfig;
use notebook_mcp_session::ExecutionBridge;
use notebook_mcp_transport::JupyterConnector;

/// Config file from `--config <path>` or the environment.
fn config_path(args: &[String]) -> Option<String> {
    args.iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| std::env::var(ENV_CONFIG_FILE).ok())
}

fn load_config(args: &[String]) -> anyhow::Result<ServerConfig> {
    let mut config = match config_path(args) {
        Some(path) => ServerConfig::from_file(&path)
            .with_context(|| format!("failed to load config file {path}"))?,
        None => ServerConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config = load_config(&args)?;

    // Initialize logging; stdout carries the MCP stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let session = config
        .session_config()
        .context("invalid notebook configuration")?;
    tracing::info!(
        "Notebook MCP Server v{} starting: notebook={}, server={}, kernel={}",
        env!("CARGO_PKG_VERSION"),
        session.notebook_path,
        session.server_url,
        session.kernel_id.as_deref().unwrap_or("<new>")
    );

    let session_id = Uuid::new_v4().to_string();
    let connector = JupyterConnector::new(session.connect_timeout, session_id.clone())
        .context("failed to build HTTP client")?;
    let bridge = Arc::new(ExecutionBridge::with_session_id(
        Arc::new(connector),
        session,
        session_id,
    ));

    // Warm up; failures surface again on the first tool call
    match bridge.connect().await {
        Ok(()) => {}
        Err(e) if e.is_configuration() => {
            tracing::error!("Initial connection failed, check the notebook settings: {}", e)
        }
        Err(e) => tracing::warn!("Initial connection failed, will retry on first call: {}", e),
    }

    let server = NotebookMcpServer::new(bridge.clone());

    tracing::info!("Server initialized, starting stdio transport...");

    // Serve the MCP server over stdio
    let service = server.serve(stdio()).await.map_err(|e| {
        tracing::error!("Error starting server: {}", e);
        e
    })?;

    tracing::info!("Notebook MCP Server running on stdio");

    // Wait for the service to complete
    service.waiting().await?;

    bridge.shutdown().await;
    tracing::info!("Notebook MCP Server shutting down");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_flag() {
        let args: Vec<String> = ["notebook-mcp", "--config", "bridge.yaml"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(config_path(&args).as_deref(), Some("bridge.yaml"));
    }
}
