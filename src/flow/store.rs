use std::sync::Arc;

use chrono::{DateTime, Utc};
use flow_common::{
    MAX_TITLE_LEN, Stage, StageCurrent, StageId, Transition, TransitionSource, WorkItem,
    WorkItemId, WorkItemType,
};
use serde::Serialize;

use super::db::{DbHandle, NewTransition};
use super::registry::StageRegistry;
use crate::errors::FlowError;

/// External board card a work item is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardKey {
    pub board_id: String,
    pub card_id: String,
}

#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub title: String,
    pub item_type: WorkItemType,
    pub created_at: DateTime<Utc>,
    pub source: TransitionSource,
    pub binding: Option<CardKey>,
}

impl NewWorkItem {
    pub fn new(title: impl Into<String>, item_type: WorkItemType) -> Self {
        Self {
            title: title.into(),
            item_type,
            created_at: Utc::now(),
            source: TransitionSource::Api,
            binding: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Created {
    New {
        item: WorkItem,
        initial: Transition,
    },
    /// The card was already bound; nothing was written.
    Existing(WorkItemId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionMismatch {
    pub work_item_id: WorkItemId,
    pub stored: Option<StageCurrent>,
    pub rebuilt: Option<StageCurrent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectionReport {
    pub items: usize,
    pub mismatches: Vec<ProjectionMismatch>,
    pub repaired: bool,
}

impl ProjectionReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Validate and normalise a title.
pub fn validate_title(title: &str) -> Result<String, FlowError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(FlowError::Validation("title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(FlowError::Validation(format!(
            "title exceeds {} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(title.to_string())
}

/// Indexed view of work items and their current stage.
#[derive(Clone)]
pub struct WorkItemStore {
    db: DbHandle,
    registry: Arc<StageRegistry>,
}

impl WorkItemStore {
    pub fn new(db: DbHandle, registry: Arc<StageRegistry>) -> Self {
        Self { db, registry }
    }

    /// Insert the item and its initial transition in one transaction.
    pub async fn create(&self, new: NewWorkItem) -> Result<Created, FlowError> {
        let title = validate_title(&new.title)?;
        let initial = self.registry.initial();

        self.db
            .call(move |db| {
                db.with_transaction(|db| {
                    if let Some(key) = &new.binding {
                        if let Some(id) = db.resolve_card(&key.board_id, &key.card_id)? {
                            return Ok(Created::Existing(id));
                        }
                    }
                    let id = db.insert_work_item(&title, new.item_type, new.created_at)?;
                    let transition = db.append_transition(&NewTransition {
                        work_item_id: id,
                        from_stage_id: None,
                        to_stage_id: initial.id,
                        timestamp: new.created_at,
                        observed_at: new.created_at,
                        source: new.source,
                        timestamp_clamped: false,
                    })?;
                    if let Some(key) = &new.binding {
                        db.bind_card(&key.board_id, &key.card_id, id)?;
                    }
                    let item = WorkItem {
                        id,
                        title,
                        item_type: new.item_type,
                        created_at: new.created_at,
                        updated_at: new.created_at,
                        current_stage_id: initial.id,
                        stage_entered_at: new.created_at,
                    };
                    Ok(Created::New {
                        item,
                        initial: transition,
                    })
                })
            })
            .await
            .map_err(FlowError::from_storage)
    }

    pub async fn get(&self, id: WorkItemId) -> Result<WorkItem, FlowError> {
        self.db
            .call(move |db| db.get_work_item(id))
            .await
            .map_err(FlowError::from_storage)?
            .ok_or(FlowError::WorkItemNotFound { id })
    }

    pub async fn list_in_stage(&self, stage_id: StageId) -> Result<Vec<WorkItem>, FlowError> {
        self.db
            .call(move |db| db.list_in_stage(stage_id))
            .await
            .map_err(FlowError::from_storage)
    }

    pub async fn stage_of(&self, id: WorkItemId) -> Result<Stage, FlowError> {
        let current = self
            .db
            .call(move |db| db.stage_current(id))
            .await
            .map_err(FlowError::from_storage)?
            .ok_or(FlowError::WorkItemNotFound { id })?;
        self.registry
            .by_id(current.stage_id)
            .ok_or_else(|| FlowError::StageNotFound {
                name: format!("#{}", current.stage_id),
            })
    }

    pub async fn count(&self) -> Result<u64, FlowError> {
        self.db
            .call(|db| db.count_work_items())
            .await
            .map_err(FlowError::from_storage)
    }

    pub async fn verify_projection(&self) -> Result<ProjectionReport, FlowError> {
        self.check_projection(false).await
    }

    /// Replace the stored projection with the one rebuilt from the log.
    pub async fn repair_projection(&self) -> Result<ProjectionReport, FlowError> {
        self.check_projection(true).await
    }

    async fn check_projection(&self, repair: bool) -> Result<ProjectionReport, FlowError> {
        let report = self
            .db
            .call(move |db| {
                let stored = db.projection()?;
                let rebuilt = db.rebuild_projection()?;
                let mismatches = diff_projection(&stored, &rebuilt);
                let repaired = repair && !mismatches.is_empty();
                if repaired {
                    db.replace_projection(&rebuilt)?;
                }
                Ok(ProjectionReport {
                    items: rebuilt.len(),
                    mismatches,
                    repaired,
                })
            })
            .await
            .map_err(FlowError::from_storage)?;

        if !report.is_consistent() {
            tracing::warn!(
                mismatches = report.mismatches.len(),
                repaired = report.repaired,
                "Stage projection diverged from transition log"
            );
        }
        Ok(report)
    }
}

/// Both inputs are sorted by work item id.
fn diff_projection(stored: &[StageCurrent], rebuilt: &[StageCurrent]) -> Vec<ProjectionMismatch> {
    let mut mismatches = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < stored.len() || j < rebuilt.len() {
        let s = stored.get(i);
        let r = rebuilt.get(j);
        match (s, r) {
            (Some(a), Some(b)) if a.work_item_id == b.work_item_id => {
                if a != b {
                    mismatches.push(ProjectionMismatch {
                        work_item_id: a.work_item_id,
                        stored: Some(*a),
                        rebuilt: Some(*b),
                    });
                }
                i += 1;
                j += 1;
            }
            (Some(a), Some(b)) if a.work_item_id < b.work_item_id => {
                mismatches.push(ProjectionMismatch {
                    work_item_id: a.work_item_id,
                    stored: Some(*a),
                    rebuilt: None,
                });
                i += 1;
            }
            (Some(a), None) => {
                mismatches.push(ProjectionMismatch {
                    work_item_id: a.work_item_id,
                    stored: Some(*a),
                    rebuilt: None,
                });
                i += 1;
            }
            (_, Some(b)) => {
                mismatches.push(ProjectionMismatch {
                    work_item_id: b.work_item_id,
                    stored: None,
                    rebuilt: Some(*b),
                });
                j += 1;
            }
            (None, None) => break,
        }
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::db::tests::seeded_db;

    async fn store() -> (DbHandle, WorkItemStore) {
        let db = DbHandle::new(seeded_db().unwrap());
        let registry = Arc::new(StageRegistry::load(db.clone()).await.unwrap());
        (db.clone(), WorkItemStore::new(db, registry))
    }

    fn created(c: Created) -> (WorkItem, Transition) {
        match c {
            Created::New { item, initial } => (item, initial),
            Created::Existing(id) => panic!("unexpected existing item {}", id),
        }
    }

    #[test]
    fn test_validate_title() {
        assert_eq!(validate_title("  Fix login  ").unwrap(), "Fix login");
        assert!(matches!(validate_title("   "), Err(FlowError::Validation(_))));
        assert!(validate_title(&"x".repeat(MAX_TITLE_LEN)).is_ok());
        assert!(validate_title(&"x".repeat(MAX_TITLE_LEN + 1)).is_err());
        // Character count, not bytes.
        assert!(validate_title(&"é".repeat(MAX_TITLE_LEN)).is_ok());
    }

    #[tokio::test]
    async fn test_create_places_item_in_initial_stage() {
        let (_db, store) = store().await;
        let (item, initial) =
            created(store.create(NewWorkItem::new("A", WorkItemType::Feature)).await.unwrap());
        assert_eq!(initial.from_stage_id, None);
        assert_eq!(initial.to_stage_id, item.current_stage_id);

        assert_eq!(store.stage_of(item.id).await.unwrap().name, "Backlog");
        assert_eq!(store.get(item.id).await.unwrap().title, "A");
        assert_eq!(store.list_in_stage(item.current_stage_id).await.unwrap().len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_with_binding_is_idempotent() {
        let (db, store) = store().await;
        let key = CardKey {
            board_id: "b".into(),
            card_id: "c".into(),
        };
        let mut new = NewWorkItem::new("Card", WorkItemType::Task);
        new.binding = Some(key.clone());
        let (item, _) = created(store.create(new.clone()).await.unwrap());

        match store.create(new).await.unwrap() {
            Created::Existing(id) => assert_eq!(id, item.id),
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(store.count().await.unwrap(), 1);
        let bound = db.call(|db| db.resolve_card("b", "c")).await.unwrap();
        assert_eq!(bound, Some(item.id));
    }

    #[tokio::test]
    async fn test_get_unknown_item() {
        let (_db, store) = store().await;
        assert!(matches!(
            store.get(42).await,
            Err(FlowError::WorkItemNotFound { id: 42 })
        ));
        assert!(matches!(
            store.stage_of(42).await,
            Err(FlowError::WorkItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_and_repair_projection() {
        let (db, store) = store().await;
        for title in ["A", "B"] {
            store.create(NewWorkItem::new(title, WorkItemType::Task)).await.unwrap();
        }
        assert!(store.verify_projection().await.unwrap().is_consistent());

        db.call(|db| {
            let mut rows = db.projection()?;
            rows.remove(0);
            db.replace_projection(&rows)
        })
        .await
        .unwrap();

        let report = store.verify_projection().await.unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].stored, None);
        assert!(!report.repaired);

        let repaired = store.repair_projection().await.unwrap();
        assert!(repaired.repaired);
        assert!(store.verify_projection().await.unwrap().is_consistent());
    }

    #[test]
    fn test_diff_projection_detects_all_cases() {
        let at = Utc::now();
        let row = |id, stage| StageCurrent {
            work_item_id: id,
            stage_id: stage,
            entered_at: at,
            last_transition_id: id,
        };
        let stored = vec![row(1, 1), row(2, 1), row(4, 1)];
        let rebuilt = vec![row(1, 1), row(2, 2), row(3, 1)];
        let ids: Vec<_> = diff_projection(&stored, &rebuilt)
            .into_iter()
            .map(|m| m.work_item_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }
}
