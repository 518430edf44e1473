//! Configuration validation: `fawkes-flow validate-config`.

use std::path::Path;

use anyhow::Result;
use fawkes_flow::config::{FLOW_DIR, FlowToml};
use fawkes_flow::flow::ingress::ColumnAliases;
use fawkes_flow::flow::policy::TransitionPolicy;
use fawkes_flow::flow::registry::StageSnapshot;
use fawkes_flow::stages_file::StagesFile;
use flow_common::Stage;

pub fn cmd_validate_config(
    project_dir: &Path,
    config: &FlowToml,
    stages_file: Option<&Path>,
) -> Result<()> {
    let config_path = project_dir.join(FLOW_DIR).join("flow.toml");
    if config_path.exists() {
        println!("Config file: {}", config_path.display());
    } else {
        println!("No flow.toml found at {}; using defaults", config_path.display());
    }

    let mut errors: Vec<String> = Vec::new();
    let mut warnings = config.validate();

    let policy = match TransitionPolicy::from_config(&config.policy) {
        Ok(policy) => Some(policy),
        Err(e) => {
            errors.push(format!("{:#}", e));
            None
        }
    };

    if let Some(path) = stages_file {
        let stages = StagesFile::load(path)?;
        println!("Stages file: {} ({} stages)", path.display(), stages.stages.len());
        let report = stages.validate();
        errors.extend(report.errors);
        warnings.extend(report.warnings);

        // Cross-check policy pairs and alias targets against the catalog.
        let catalog: Vec<Stage> = stages
            .stages
            .iter()
            .filter_map(|entry| entry.to_new_stage().ok())
            .zip(1..)
            .map(|(s, id)| Stage {
                id,
                name: s.name,
                order: s.order,
                category: s.category,
                wip_limit: s.wip_limit,
                description: s.description,
            })
            .collect();
        if let Ok(snapshot) = StageSnapshot::new(catalog) {
            if let Some(policy) = &policy {
                for name in policy.unknown_stages(&snapshot) {
                    warnings.push(format!("Policy names unknown stage '{}'", name));
                }
            }
            let aliases = ColumnAliases::with_overrides(&config.column_aliases);
            for (column, stage) in aliases.entries() {
                if snapshot.by_name(stage).is_none() {
                    warnings.push(format!(
                        "Column alias '{}' maps to unknown stage '{}'",
                        column, stage
                    ));
                }
            }
        }
    }

    println!();
    for warning in &warnings {
        println!("warning: {}", warning);
    }
    for error in &errors {
        eprintln!("error: {}", error);
    }

    if !errors.is_empty() {
        anyhow::bail!("Validation failed with {} error(s)", errors.len());
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
    } else {
        println!("Configuration is valid with {} warning(s).", warnings.len());
    }
    Ok(())
}
