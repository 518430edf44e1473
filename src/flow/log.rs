use chrono::{DateTime, Utc};
use flow_common::{StageId, Transition, WorkItemId};

use super::db::{DbHandle, LogEntry};
use crate::errors::FlowError;

/// Read side of the append-only transition log. Appends only happen through
/// the engine, inside its write transaction.
#[derive(Clone)]
pub struct TransitionLog {
    db: DbHandle,
}

impl TransitionLog {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Oldest first.
    pub async fn history(&self, work_item_id: WorkItemId) -> Result<Vec<Transition>, FlowError> {
        self.db
            .call(move |db| db.history(work_item_id))
            .await
            .map_err(FlowError::from_storage)
    }

    pub async fn last(&self, work_item_id: WorkItemId) -> Result<Option<Transition>, FlowError> {
        self.db
            .call(move |db| db.last_transition(work_item_id))
            .await
            .map_err(FlowError::from_storage)
    }

    pub async fn since(&self, min_ts: DateTime<Utc>) -> Result<Vec<LogEntry>, FlowError> {
        self.db
            .call(move |db| db.since(min_ts))
            .await
            .map_err(FlowError::from_storage)
    }

    /// Visit `[min_ts, until)` row by row on the storage thread, folding into
    /// `acc`. Nothing is buffered beyond the accumulator.
    pub async fn fold_since<S, F>(
        &self,
        min_ts: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        acc: S,
        mut f: F,
    ) -> Result<S, FlowError>
    where
        S: Send + 'static,
        F: FnMut(&mut S, LogEntry) + Send + 'static,
    {
        self.db
            .call(move |db| {
                let mut acc = acc;
                db.for_each_since(min_ts, until, |entry| {
                    f(&mut acc, entry);
                    Ok(())
                })?;
                Ok(acc)
            })
            .await
            .map_err(FlowError::from_storage)
    }

    /// Transitions into `stage_id` over `[t0, t1)`.
    pub async fn count_completed_between(
        &self,
        stage_id: StageId,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<u64, FlowError> {
        if t1 <= t0 {
            return Ok(0);
        }
        self.db
            .call(move |db| db.count_completed_between(stage_id, t0, t1))
            .await
            .map_err(FlowError::from_storage)
    }
}
