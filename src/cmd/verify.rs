//! Projection check: `fawkes-flow verify-projection`.

use std::sync::Arc;

use anyhow::Result;
use fawkes_flow::config::FlowToml;
use fawkes_flow::flow::db::DbHandle;
use fawkes_flow::flow::registry::StageRegistry;
use fawkes_flow::flow::store::WorkItemStore;

pub async fn cmd_verify_projection(config: &FlowToml, repair: bool) -> Result<()> {
    let db = DbHandle::new(super::open_db(&config.server.db_path)?);
    let registry = Arc::new(StageRegistry::load(db.clone()).await?);
    let store = WorkItemStore::new(db, registry.clone());

    let report = if repair {
        store.repair_projection().await?
    } else {
        store.verify_projection().await?
    };

    println!("Checked {} work items", report.items);
    if report.is_consistent() {
        println!("Projection is consistent with the transition log.");
        return Ok(());
    }

    let stage_name = |id: i64| {
        registry
            .by_id(id)
            .map(|s| s.name)
            .unwrap_or_else(|| format!("#{}", id))
    };
    for m in &report.mismatches {
        let stored = m
            .stored
            .as_ref()
            .map(|c| stage_name(c.stage_id))
            .unwrap_or_else(|| "-".to_string());
        let rebuilt = m
            .rebuilt
            .as_ref()
            .map(|c| stage_name(c.stage_id))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  work item {}: stored {}, log says {}",
            m.work_item_id, stored, rebuilt
        );
    }

    if report.repaired {
        println!("Repaired {} projection rows.", report.mismatches.len());
        Ok(())
    } else {
        anyhow::bail!(
            "{} projection mismatch(es); rerun with --repair to fix",
            report.mismatches.len()
        )
    }
}
