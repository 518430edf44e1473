//! `stages.yaml`: the stage catalog as provisioned by operators.
//!
//! ```yaml
//! stages:
//!   - name: Backlog
//!     type: wait
//!     order: 1
//!     wip_limit: null
//!     description: Work items waiting to be analyzed and prioritized
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use flow_common::StageCategory;
use serde::{Deserialize, Serialize};

use crate::flow::db::{FlowDb, NewStage, UpsertOutcome};

/// WIP limits above this are reported as suspicious.
const HIGH_WIP_LIMIT: i64 = 50;

/// One entry as written in the file. Every field is optional so that
/// validation can report all problems at once instead of failing on the first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub category: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub wip_limit: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagesFile {
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

impl StageEntry {
    /// Convert to a stage definition, or describe why that is impossible.
    pub fn to_new_stage(&self) -> Result<NewStage, String> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| "missing 'name'".to_string())?;
        let category: StageCategory = self
            .category
            .as_deref()
            .ok_or_else(|| format!("{}: missing 'type'", name))?
            .parse()
            .map_err(|e| format!("{}: {}", name, e))?;
        let order = self
            .order
            .ok_or_else(|| format!("{}: missing 'order'", name))?;
        let order = i32::try_from(order)
            .map_err(|_| format!("{}: order {} out of range", name, order))?;
        Ok(NewStage {
            name: name.to_string(),
            order,
            category,
            // Non-positive limits are warned about and treated as unlimited.
            wip_limit: self
                .wip_limit
                .filter(|limit| *limit > 0)
                .and_then(|limit| u32::try_from(limit).ok()),
            description: self.description.as_deref().unwrap_or("").trim().to_string(),
        })
    }
}

impl StagesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stages file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse stages file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid stages YAML")
    }

    /// Check the catalog without touching the database.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        if self.stages.is_empty() {
            report.errors.push("No stages defined".to_string());
            return report;
        }

        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        for (i, entry) in self.stages.iter().enumerate() {
            let n = i + 1;
            let label = match entry.name.as_deref() {
                Some(name) if !name.trim().is_empty() => format!("Stage {} ({})", n, name.trim()),
                _ => format!("Stage {}", n),
            };

            if blank(&entry.name) {
                report.errors.push(format!("{}: missing or empty 'name'", label));
            }
            if blank(&entry.category) {
                report.errors.push(format!("{}: missing or empty 'type'", label));
            }
            if entry.order.is_none() {
                report.errors.push(format!("{}: missing 'order'", label));
            }
            if blank(&entry.description) {
                report.errors.push(format!("{}: missing or empty 'description'", label));
            }

            if let Some(name) = entry.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                if !names.insert(name.to_lowercase()) {
                    report.errors.push(format!("{}: duplicate stage name '{}'", label, name));
                }
            }
            if let Some(order) = entry.order {
                if !orders.insert(order) {
                    report.errors.push(format!("{}: duplicate order {}", label, order));
                }
            }
            if let Some(category) = entry.category.as_deref().filter(|c| !c.trim().is_empty()) {
                if category.parse::<StageCategory>().is_err() {
                    report.errors.push(format!(
                        "{}: invalid type '{}', must be one of wait, active, done",
                        label, category
                    ));
                }
            }

            match entry.wip_limit {
                Some(limit) if limit <= 0 => report.warnings.push(format!(
                    "{}: WIP limit should be a positive integer or null",
                    label
                )),
                Some(limit) if limit > HIGH_WIP_LIMIT => report
                    .warnings
                    .push(format!("{}: WIP limit {} seems very high", label, limit)),
                _ => {}
            }
        }
        report
    }

    /// Upsert every entry by name. Existing stages are skipped unless `update`
    /// is set; `dry_run` only reports what would happen.
    pub fn load_into(&self, db: &FlowDb, update: bool, dry_run: bool) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        if self.stages.is_empty() {
            tracing::warn!("No stages found in stages file");
            return Ok(summary);
        }

        let mut apply = |db: &FlowDb| -> Result<()> {
            for entry in &self.stages {
                let stage = match entry.to_new_stage() {
                    Ok(stage) => stage,
                    Err(reason) => {
                        tracing::error!(reason = %reason, "Skipping invalid stage entry");
                        summary.errors += 1;
                        continue;
                    }
                };

                let outcome = if dry_run {
                    match db.get_stage_by_name(&stage.name)? {
                        None => UpsertOutcome::Created,
                        Some(_) if update => UpsertOutcome::Updated,
                        Some(_) => UpsertOutcome::Skipped,
                    }
                } else {
                    match db.upsert_stage(&stage, update) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(
                                stage = %stage.name,
                                error = %format!("{:#}", e),
                                "Failed to load stage"
                            );
                            summary.errors += 1;
                            continue;
                        }
                    }
                };

                match outcome {
                    UpsertOutcome::Created => summary.created += 1,
                    UpsertOutcome::Updated => summary.updated += 1,
                    UpsertOutcome::Skipped => summary.skipped += 1,
                }
                tracing::info!(
                    stage = %stage.name,
                    order = stage.order,
                    category = %stage.category,
                    outcome = ?outcome,
                    dry_run,
                    "Processed stage"
                );
            }
            Ok(())
        };

        if dry_run {
            apply(db)?;
        } else {
            db.with_transaction(|db| apply(db))?;
        }
        Ok(summary)
    }
}

fn default_stage(
    name: &str,
    order: i32,
    category: StageCategory,
    wip_limit: Option<u32>,
    description: &str,
) -> NewStage {
    NewStage {
        name: name.to_string(),
        order,
        category,
        wip_limit,
        description: description.to_string(),
    }
}

/// The built-in eight-stage value stream.
pub fn default_stages() -> Vec<NewStage> {
    use StageCategory::{Active, Done, Wait};
    vec![
        default_stage("Backlog", 1, Wait, None, "Work items waiting to be analyzed and prioritized"),
        default_stage("Design", 2, Active, Some(5), "Active design and analysis phase"),
        default_stage("Development", 3, Active, Some(10), "Active implementation phase"),
        default_stage("Code Review", 4, Wait, Some(8), "Changes waiting for and under peer review"),
        default_stage("Testing", 5, Active, Some(8), "Active testing and quality assurance phase"),
        default_stage(
            "Deployment Approval",
            6,
            Wait,
            Some(5),
            "Releases waiting for deployment approval",
        ),
        default_stage("Deploy", 7, Active, Some(3), "Active deployment to production"),
        default_stage(
            "Production",
            8,
            Done,
            None,
            "Work items deployed and running in production",
        ),
    ]
}

impl From<&NewStage> for StageEntry {
    fn from(stage: &NewStage) -> Self {
        Self {
            name: Some(stage.name.clone()),
            category: Some(stage.category.to_string()),
            order: Some(i64::from(stage.order)),
            wip_limit: stage.wip_limit.map(i64::from),
            description: Some(stage.description.clone()),
        }
    }
}

/// The default catalog as a `stages.yaml` document.
pub fn default_stages_file() -> StagesFile {
    StagesFile {
        stages: default_stages().iter().map(StageEntry::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
stages:
  - name: Backlog
    type: wait
    order: 1
    wip_limit: null
    description: Work items waiting to be analyzed and prioritized
  - name: Development
    type: active
    order: 2
    wip_limit: 4
    description: Active implementation phase
  - name: Production
    type: done
    order: 3
    description: Running in production
"#;

    #[test]
    fn test_parse_sample() {
        let file = StagesFile::parse(SAMPLE).unwrap();
        assert_eq!(file.stages.len(), 3);
        assert_eq!(file.stages[1].wip_limit, Some(4));
        assert_eq!(file.stages[0].category.as_deref(), Some("wait"));
        assert!(file.validate().is_valid());
    }

    #[test]
    fn test_validate_reports_errors() {
        let file = StagesFile::parse(
            r#"
stages:
  - name: Backlog
    type: queued
    order: 1
    description: x
  - name: backlog
    type: wait
    order: 1
  - type: active
    order: 3
    description: nameless
"#,
        )
        .unwrap();
        let report = file.validate();
        assert!(!report.is_valid());
        let joined = report.errors.join("\n");
        assert!(joined.contains("invalid type 'queued'"));
        assert!(joined.contains("duplicate stage name"));
        assert!(joined.contains("duplicate order 1"));
        assert!(joined.contains("Stage 2 (backlog): missing or empty 'description'"));
        assert!(joined.contains("Stage 3: missing or empty 'name'"));
    }

    #[test]
    fn test_validate_warns_on_wip_limits() {
        let file = StagesFile::parse(
            r#"
stages:
  - { name: A, type: wait, order: 1, wip_limit: 0, description: a }
  - { name: B, type: active, order: 2, wip_limit: 80, description: b }
"#,
        )
        .unwrap();
        let report = file.validate();
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[1].contains("seems very high"));
    }

    #[test]
    fn test_empty_file_is_invalid() {
        let file = StagesFile::parse("stages: []").unwrap();
        assert!(!file.validate().is_valid());
    }

    #[test]
    fn test_load_creates_then_skips() {
        let db = FlowDb::new_in_memory().unwrap();
        let file = StagesFile::parse(SAMPLE).unwrap();

        let first = file.load_into(&db, false, false).unwrap();
        assert_eq!(
            first,
            LoadSummary { created: 3, ..LoadSummary::default() }
        );
        let stages = db.list_stages().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[1].wip_limit, Some(4));

        let second = file.load_into(&db, false, false).unwrap();
        assert_eq!(second.skipped, 3);
        assert_eq!(second.created, 0);
    }

    #[test]
    fn test_load_update_rewrites_existing() {
        let db = FlowDb::new_in_memory().unwrap();
        StagesFile::parse(SAMPLE).unwrap().load_into(&db, false, false).unwrap();

        let changed = SAMPLE.replace("wip_limit: 4", "wip_limit: 6");
        let summary = StagesFile::parse(&changed)
            .unwrap()
            .load_into(&db, true, false)
            .unwrap();
        assert_eq!(summary.updated, 3);
        let dev = db.get_stage_by_name("Development").unwrap().unwrap();
        assert_eq!(dev.wip_limit, Some(6));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let db = FlowDb::new_in_memory().unwrap();
        let summary = StagesFile::parse(SAMPLE)
            .unwrap()
            .load_into(&db, false, true)
            .unwrap();
        assert_eq!(summary.created, 3);
        assert!(db.list_stages().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_entries_count_as_errors() {
        let db = FlowDb::new_in_memory().unwrap();
        let file = StagesFile::parse(
            r#"
stages:
  - { name: A, type: wait, order: 1, description: a }
  - { name: B, type: sideways, order: 2, description: b }
"#,
        )
        .unwrap();
        let summary = file.load_into(&db, false, false).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn test_default_catalog_is_valid() {
        let stages = default_stages();
        assert_eq!(stages.len(), 8);
        assert_eq!(stages[0].name, "Backlog");
        assert_eq!(stages[7].category, StageCategory::Done);

        let file = default_stages_file();
        assert!(file.validate().is_valid());
        let yaml = serde_yaml::to_string(&file).unwrap();
        assert!(yaml.contains("Deployment Approval"));
        assert!(yaml.contains("type: done"));
    }
}
