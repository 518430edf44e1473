//! In-memory stage catalog.
//!
//! The catalog is an immutable [`StageSnapshot`] behind an `Arc`. Readers
//! clone the `Arc` and work on a consistent set; [`StageRegistry::reload`]
//! builds a fresh snapshot from storage and swaps the pointer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Result, bail};
use flow_common::{Stage, StageId, StageRef};

use super::db::DbHandle;

#[derive(Debug)]
pub struct StageSnapshot {
    /// Ascending by `order`.
    stages: Vec<Stage>,
    by_id: HashMap<StageId, usize>,
    by_name: HashMap<String, usize>,
}

impl StageSnapshot {
    /// Build a snapshot, rejecting empty catalogs and duplicate names or orders.
    pub fn new(mut stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            bail!("Stage catalog is empty");
        }
        stages.sort_by_key(|s| s.order);

        let mut by_id = HashMap::with_capacity(stages.len());
        let mut by_name = HashMap::with_capacity(stages.len());
        for (idx, stage) in stages.iter().enumerate() {
            if idx > 0 && stages[idx - 1].order == stage.order {
                bail!(
                    "Stages '{}' and '{}' share order {}",
                    stages[idx - 1].name,
                    stage.name,
                    stage.order
                );
            }
            if by_name.insert(stage.name.clone(), idx).is_some() {
                bail!("Duplicate stage name '{}'", stage.name);
            }
            by_id.insert(stage.id, idx);
        }

        Ok(Self {
            stages,
            by_id,
            by_name,
        })
    }

    pub fn list(&self) -> &[Stage] {
        &self.stages
    }

    pub fn by_id(&self, id: StageId) -> Option<&Stage> {
        self.by_id.get(&id).map(|&idx| &self.stages[idx])
    }

    /// Exact match first, then a case-insensitive one.
    pub fn by_name(&self, name: &str) -> Option<&Stage> {
        if let Some(&idx) = self.by_name.get(name) {
            return Some(&self.stages[idx]);
        }
        let wanted = name.trim();
        self.stages
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(wanted))
    }

    pub fn resolve(&self, target: &StageRef) -> Option<&Stage> {
        match target {
            StageRef::Id(id) => self.by_id(*id),
            StageRef::Name(name) => self.by_name(name),
        }
    }

    /// The unique minimum-order stage.
    pub fn initial(&self) -> &Stage {
        // `new` refuses empty catalogs.
        &self.stages[0]
    }
}

pub struct StageRegistry {
    db: DbHandle,
    current: RwLock<Arc<StageSnapshot>>,
}

impl StageRegistry {
    /// Load the catalog from storage. Fails if no stages are provisioned.
    pub async fn load(db: DbHandle) -> Result<Self> {
        let stages = db.call(|db| db.list_stages()).await?;
        let snapshot = StageSnapshot::new(stages)?;
        Ok(Self {
            db,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Current snapshot. Cheap: one `Arc` clone under a read lock held for
    /// no longer than the clone.
    pub fn snapshot(&self) -> Arc<StageSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn list(&self) -> Vec<Stage> {
        self.snapshot().list().to_vec()
    }

    pub fn by_id(&self, id: StageId) -> Option<Stage> {
        self.snapshot().by_id(id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Stage> {
        self.snapshot().by_name(name).cloned()
    }

    pub fn initial(&self) -> Stage {
        self.snapshot().initial().clone()
    }

    /// Re-read stages from storage and publish them. On failure the previous
    /// snapshot stays in place.
    pub async fn reload(&self) -> Result<usize> {
        let stages = self.db.call(|db| db.list_stages()).await?;
        let snapshot = Arc::new(StageSnapshot::new(stages)?);
        let count = snapshot.list().len();
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        tracing::info!(stages = count, "Stage registry reloaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::db::tests::{seeded_db, stage};
    use crate::flow::db::FlowDb;
    use flow_common::StageCategory;

    fn mk(id: StageId, name: &str, order: i32) -> Stage {
        Stage {
            id,
            name: name.to_string(),
            order,
            category: StageCategory::Active,
            wip_limit: None,
            description: String::new(),
        }
    }

    #[test]
    fn test_snapshot_sorts_and_finds_initial() {
        let snap = StageSnapshot::new(vec![mk(2, "Dev", 3), mk(1, "Backlog", 1)]).unwrap();
        assert_eq!(snap.initial().name, "Backlog");
        assert_eq!(snap.list()[1].name, "Dev");
        assert_eq!(snap.by_id(2).unwrap().name, "Dev");
        assert!(snap.by_id(99).is_none());
    }

    #[test]
    fn test_snapshot_name_lookup_is_case_insensitive_fallback() {
        let snap = StageSnapshot::new(vec![mk(1, "Code Review", 1)]).unwrap();
        assert!(snap.by_name("Code Review").is_some());
        assert!(snap.by_name("code review").is_some());
        assert!(snap.by_name(" CODE REVIEW ").is_some());
        assert!(snap.by_name("Review").is_none());
        assert_eq!(snap.resolve(&StageRef::Id(1)).unwrap().name, "Code Review");
    }

    #[test]
    fn test_snapshot_rejects_invalid_catalogs() {
        assert!(StageSnapshot::new(vec![]).is_err());
        let dup_order = StageSnapshot::new(vec![mk(1, "A", 1), mk(2, "B", 1)]).unwrap_err();
        assert!(dup_order.to_string().contains("share order"));
        let dup_name = StageSnapshot::new(vec![mk(1, "A", 1), mk(2, "A", 2)]).unwrap_err();
        assert!(dup_name.to_string().contains("Duplicate"));
    }

    #[tokio::test]
    async fn test_load_requires_stages() {
        let db = DbHandle::new(FlowDb::new_in_memory().unwrap());
        assert!(StageRegistry::load(db).await.is_err());
    }

    #[tokio::test]
    async fn test_reload_publishes_new_snapshot() {
        let db = DbHandle::new(seeded_db().unwrap());
        let registry = StageRegistry::load(db.clone()).await.unwrap();
        let before = registry.snapshot();
        assert_eq!(before.list().len(), 3);

        db.call(|db| db.insert_stage(&stage("Testing", 4, StageCategory::Active, None)))
            .await
            .unwrap();
        assert_eq!(registry.reload().await.unwrap(), 4);

        // Snapshots already handed out are unaffected.
        assert_eq!(before.list().len(), 3);
        assert_eq!(registry.list().len(), 4);
        assert_eq!(registry.by_name("testing").unwrap().order, 4);
        assert_eq!(registry.initial().name, "Backlog");
    }
}
