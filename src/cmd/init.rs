//! Project initialization: `fawkes-flow init`.

use std::path::Path;

use anyhow::{Context, Result};
use fawkes_flow::config::{FLOW_DIR, template};
use fawkes_flow::stages_file::{StagesFile, default_stages_file};

/// Create `.fawkes/` with a config template, a default `stages.yaml` and the
/// database. Existing files are left untouched.
pub fn cmd_init(project_dir: &Path, seed_defaults: bool) -> Result<()> {
    let flow_dir = project_dir.join(FLOW_DIR);
    std::fs::create_dir_all(&flow_dir)
        .with_context(|| format!("Failed to create {}", flow_dir.display()))?;

    let config_path = flow_dir.join("flow.toml");
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
    } else {
        std::fs::write(&config_path, template())
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Created {}", config_path.display());
    }

    let stages_path = flow_dir.join("stages.yaml");
    let stages = if stages_path.exists() {
        println!("Stages file already exists: {}", stages_path.display());
        StagesFile::load(&stages_path)?
    } else {
        let stages = default_stages_file();
        let yaml = serde_yaml::to_string(&stages).context("Failed to serialize stages")?;
        std::fs::write(&stages_path, yaml)
            .with_context(|| format!("Failed to write {}", stages_path.display()))?;
        println!("Created {}", stages_path.display());
        stages
    };

    let config = super::load_config(project_dir)?;
    let db = super::open_db(&config.server.db_path)?;
    println!("Flow database ready at {}", config.server.db_path.display());

    if seed_defaults {
        let report = stages.validate();
        if !report.is_valid() {
            for error in &report.errors {
                eprintln!("  - {}", error);
            }
            anyhow::bail!("{} is invalid; not seeding stages", stages_path.display());
        }
        let summary = stages.load_into(&db, false, false)?;
        println!(
            "Seeded stages: {} created, {} already present",
            summary.created, summary.skipped
        );
    } else {
        println!();
        println!("Next: fawkes-flow load-stages {}", stages_path.display());
    }

    Ok(())
}
