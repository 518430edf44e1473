//! Read-only facade over the store, the log and the aggregator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flow_common::{Stage, StageCategory, StageId, Transition, WorkItem, WorkItemId};
use serde::Serialize;

use super::aggregator::{AggregatorHandle, FlowMetrics, FlowState, TransitionEvent};
use super::db::DbHandle;
use super::log::TransitionLog;
use super::policy::{PolicyTableView, TransitionPolicy};
use super::registry::StageRegistry;
use super::store::WorkItemStore;
use crate::errors::FlowError;

#[derive(Debug, Clone, Serialize)]
pub struct WorkItemView {
    #[serde(flatten)]
    pub item: WorkItem,
    pub stage: Stage,
}

#[derive(Clone)]
pub struct QueryFacade {
    db: DbHandle,
    registry: Arc<StageRegistry>,
    store: WorkItemStore,
    log: TransitionLog,
    aggregator: AggregatorHandle,
    policy: Arc<TransitionPolicy>,
}

impl QueryFacade {
    pub fn new(
        db: DbHandle,
        registry: Arc<StageRegistry>,
        aggregator: AggregatorHandle,
        policy: Arc<TransitionPolicy>,
    ) -> Self {
        Self {
            store: WorkItemStore::new(db.clone(), registry.clone()),
            log: TransitionLog::new(db.clone()),
            db,
            registry,
            aggregator,
            policy,
        }
    }

    pub async fn current_stage(&self, id: WorkItemId) -> Result<Stage, FlowError> {
        self.store.stage_of(id).await
    }

    pub async fn work_item(&self, id: WorkItemId) -> Result<WorkItemView, FlowError> {
        let item = self.store.get(id).await?;
        let stage = self
            .registry
            .by_id(item.current_stage_id)
            .ok_or_else(|| FlowError::StageNotFound {
                name: format!("#{}", item.current_stage_id),
            })?;
        Ok(WorkItemView { item, stage })
    }

    /// Oldest first. Unknown ids are an error rather than an empty history.
    pub async fn history(&self, id: WorkItemId) -> Result<Vec<Transition>, FlowError> {
        let history = self.log.history(id).await?;
        if history.is_empty() {
            return Err(FlowError::WorkItemNotFound { id });
        }
        Ok(history)
    }

    pub async fn items_in(&self, stage_name: &str) -> Result<Vec<WorkItem>, FlowError> {
        let stage = self.stage(stage_name)?;
        self.store.list_in_stage(stage.id).await
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.registry.list()
    }

    pub fn policy(&self) -> PolicyTableView {
        self.policy.table()
    }

    pub async fn ready(&self) -> Result<(), FlowError> {
        self.db
            .call(|db| db.ping())
            .await
            .map_err(FlowError::from_storage)
    }

    /// Metrics over `[start, end)`. Windows inside the aggregator's retention
    /// are answered from memory; older ones fold the log.
    pub async fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: Option<&str>,
    ) -> Result<FlowMetrics, FlowError> {
        if end <= start {
            return Err(FlowError::Validation(
                "metrics window end must be after its start".into(),
            ));
        }
        let stage = match stage {
            Some(name) => {
                let stage = self.stage(name)?;
                Some((stage.id, stage.name))
            }
            None => None,
        };

        let retained_from = Utc::now()
            .checked_sub_signed(self.aggregator.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if start >= retained_from {
            return self
                .aggregator
                .metrics(start, end, stage)
                .await
                .map_err(FlowError::Storage);
        }
        tracing::debug!(%start, %end, "Metrics window predates retention; folding log");
        self.metrics_from_log(start, end, stage).await
    }

    async fn metrics_from_log(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: Option<(StageId, String)>,
    ) -> Result<FlowMetrics, FlowError> {
        let categories: HashMap<StageId, StageCategory> = self
            .registry
            .list()
            .into_iter()
            .map(|s| (s.id, s.category))
            .collect();
        let baseline = self
            .db
            .call(move |db| db.open_items_before(start))
            .await
            .map_err(FlowError::from_storage)?;

        let window = end - start;
        let seed = FlowState::rebuilt(window, baseline as i64, &[], HashMap::new(), 0, |_| None);
        let state = self
            .log
            .fold_since(start, Some(end), seed, move |state, entry| {
                state.fold(&TransitionEvent::from(&entry), |id| categories.get(&id).copied())
            })
            .await?;
        Ok(state.metrics(start, end, stage, "log"))
    }

    fn stage(&self, name: &str) -> Result<Stage, FlowError> {
        self.registry
            .by_name(name)
            .ok_or_else(|| FlowError::StageNotFound {
                name: name.to_string(),
            })
    }
}
