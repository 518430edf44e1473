//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled      |
//! |-----------|-----------------------|
//! | `serve`   | `Serve`               |
//! | `init`    | `Init`                |
//! | `stages`  | `LoadStages`          |
//! | `config`  | `ValidateConfig`      |
//! | `verify`  | `VerifyProjection`    |

pub mod config;
pub mod init;
pub mod serve;
pub mod stages;
pub mod verify;

pub use config::cmd_validate_config;
pub use init::cmd_init;
pub use serve::cmd_serve;
pub use stages::cmd_load_stages;
pub use verify::cmd_verify_projection;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fawkes_flow::config::{FLOW_DIR, FlowToml};
use fawkes_flow::flow::db::FlowDb;

/// Resolve `path` against the project directory unless it is absolute.
pub fn resolve(project_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

/// Load `.fawkes/flow.toml` (or defaults), apply env overrides and anchor
/// relative paths at the project directory.
pub fn load_config(project_dir: &Path) -> Result<FlowToml> {
    let mut config = FlowToml::load_or_default(&project_dir.join(FLOW_DIR))?;
    config.apply_env()?;
    config.server.db_path = resolve(project_dir, &config.server.db_path);
    if let Some(dir) = config.logging.dir.take() {
        config.logging.dir = Some(resolve(project_dir, &dir));
    }
    Ok(config)
}

/// Open the flow database, creating it and its directory if needed.
pub fn open_db(path: &Path) -> Result<FlowDb> {
    FlowDb::new(path).with_context(|| format!("Failed to open flow database at {}", path.display()))
}
