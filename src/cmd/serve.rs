//! Build HTTP server command (`buildbox serve`).

use std::path::{Path, PathBuf};

use anyhow::Result;

use buildbox::build::server::{ServerConfig, start_server};
use buildbox::buildbox_config::BuildboxConfig;

/// Directory for the rolling server log, created if needed. `None` when the
/// project config cannot be read; the error resurfaces in `cmd_serve`.
pub fn server_log_dir(project_dir: &Path) -> Option<PathBuf> {
    let config = BuildboxConfig::new(project_dir.to_path_buf()).ok()?;
    let dir = config.log_dir();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

pub async fn cmd_serve(project_dir: &Path, port: Option<u16>, dev: bool, open: bool) -> Result<()> {
    let config = BuildboxConfig::with_cli_args(project_dir.to_path_buf(), port, dev)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let mut server = ServerConfig::from_config(&config);
    // No browser inside containers in dev mode.
    server.open_browser = open && !server.dev_mode;
    start_server(server, &config).await
}
