use anyhow::{Context, Result};
use treemirror_core::config::Config;

/// Run the HTTP server until interrupted.
pub fn run(config: Config, bind_addr: &str, port: u16) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(treemirror_server::http::run_http_server(config, bind_addr, port))
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))
}
