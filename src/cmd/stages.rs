//! Stage catalog loading: `fawkes-flow load-stages`.

use std::path::Path;

use anyhow::Result;
use fawkes_flow::config::FlowToml;
use fawkes_flow::stages_file::StagesFile;

pub fn cmd_load_stages(config: &FlowToml, file: &Path, update: bool, dry_run: bool) -> Result<()> {
    let stages = StagesFile::load(file)?;
    println!("Loaded {} stages from {}", stages.stages.len(), file.display());

    let report = stages.validate();
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    if !report.is_valid() {
        for error in &report.errors {
            eprintln!("error: {}", error);
        }
        anyhow::bail!("Stages file has {} error(s)", report.errors.len());
    }

    if dry_run {
        println!("DRY RUN: no changes will be made");
    }
    let db = super::open_db(&config.server.db_path)?;
    let summary = stages.load_into(&db, update, dry_run)?;

    println!();
    println!("Summary:");
    println!("  Created: {}", summary.created);
    println!("  Updated: {}", summary.updated);
    println!("  Skipped: {}", summary.skipped);
    println!("  Errors:  {}", summary.errors);

    if summary.errors > 0 {
        anyhow::bail!("Some stages had errors during loading");
    }
    Ok(())
}
