//! # metawire-demo
//!
//! Example host: registers a few units, serves a landing page and runs
//! the metawire server until Ctrl-C.

#![deny(unsafe_code)]

mod units;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use metawire_protocol::{MemorySessionStore, Protocol, ProtocolOptions};
use metawire_server::{MemoryFiles, MetawireServer, ServerConfig, init_subscriber};

const INDEX_HTML: &str = "<!doctype html>\n<title>metawire</title>\n<p>POST packets to <code>/api</code> or open a WebSocket on <code>/</code>.</p>\n";

/// Metawire demo server.
#[derive(Parser, Debug)]
#[command(name = "metawire-demo", about = "Metawire demo server")]
struct Cli {
    /// JSON config file, merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides the config file).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())
            .context("Failed to load server config")?;
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.validate().context("Invalid server config")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level);
    let config = cli.server_config()?;

    let registry = units::registry();
    let method_count = registry.methods().len();
    let options = ProtocolOptions {
        session_store: Arc::new(MemorySessionStore::new()),
        ..ProtocolOptions::new(registry)
    };
    let protocol = Arc::new(Protocol::new(options));

    let files = MemoryFiles::new().with_file(
        "/index.html",
        "text/html; charset=utf-8",
        Bytes::from_static(INDEX_HTML.as_bytes()),
    );
    let server = MetawireServer::new(config, protocol).with_static_files(files);
    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!("metawire demo listening on http://{addr} ({method_count} methods registered)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let outcome = server.close().await;
    tracing::info!(?outcome, "Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["metawire-demo"]);
        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn cli_overrides_host_and_port() {
        let cli = Cli::parse_from(["metawire-demo", "--host", "0.0.0.0", "--port", "0"]);
        let config = cli.server_config().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let cli = Cli::parse_from(["metawire-demo", "--config", "/nonexistent/metawire.json"]);
        assert_eq!(cli.server_config().unwrap().bind_retry, 3);
    }
}
