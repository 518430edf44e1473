//! HTTP server command: `fawkes-flow serve`.

use std::path::PathBuf;

use anyhow::Result;
use fawkes_flow::config::FlowToml;

pub async fn cmd_serve(
    mut config: FlowToml,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(path) = db_path {
        config.server.db_path = path;
    }
    if dev {
        config.server.dev_mode = true;
    }

    fawkes_flow::flow::server::start_server(config).await
}
