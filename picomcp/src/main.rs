//! Run a `picomcp` server with the demo tools.
//!
//! ```text
//! picomcp [CONFIG.yaml]
//! ```
//!
//! Without a config file every setting takes its default.  Log verbosity comes from `RUST_LOG`.
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use picomcp::demo_tools::{self, PinBank};
use picomcp_server::{Server, ServerConfig, ToolRegistry};

const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize logging")?;

    let config = match std::env::args_os().nth(1) {
        Some(path) => load_config(Path::new(&path))?,
        None => ServerConfig::default(),
    };

    let tools = ToolRegistry::new();
    demo_tools::register(&tools, Arc::new(PinBank::new())).context("Failed to register tools")?;

    let server = Server::new(config, tools).context("Invalid configuration")?;
    let listener = server.bind().await.context("Failed to start listener")?;

    let shutdown = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupted; shutting down"),
            Err(e) => tracing::error!(err = %e, "Failed to listen for ctrl-c; shutting down"),
        }
        shutdown.shutdown();
    });

    server.serve(listener).await;
    Ok(())
}

fn load_config(path: &Path) -> Result<ServerConfig> {
    let yaml = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config: ServerConfig =
        serde_yaml::from_str(&yaml).with_context(|| format!("Failed to parse {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}
