//! Transition engine: the single write path for stage movements.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use flow_common::{
    DenialReason, Stage, StageId, StageRef, Transition, TransitionSource, WorkItemId,
};
use serde::Serialize;

use super::aggregator::{AggregatorHandle, TransitionEvent};
use super::db::{DbHandle, FlowDb, NewTransition};
use super::locks::LockPool;
use super::policy::{TransitionPolicy, Verdict};
use super::registry::{StageRegistry, StageSnapshot};
use super::store::{Created, NewWorkItem, WorkItemStore};
use crate::config::EngineSection;
use crate::errors::FlowError;

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub work_item_id: WorkItemId,
    pub target: StageRef,
    pub source: TransitionSource,
    pub observed_at: DateTime<Utc>,
    /// When set, the item must currently be in this stage.
    pub expected_stage: Option<StageRef>,
}

impl TransitionRequest {
    pub fn new(
        work_item_id: WorkItemId,
        target: impl Into<StageRef>,
        source: TransitionSource,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            work_item_id,
            target: target.into(),
            source,
            observed_at,
            expected_stage: None,
        }
    }

    pub fn expecting(mut self, stage: impl Into<StageRef>) -> Self {
        self.expected_stage = Some(stage.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { transition: Transition },
    /// A retry of the latest transition inside the dedup window.
    Duplicate { transition: Transition },
    Denied { reason: DenialReason },
}

impl ApplyOutcome {
    pub fn transition(&self) -> Option<&Transition> {
        match self {
            Self::Applied { transition } | Self::Duplicate { transition } => Some(transition),
            Self::Denied { .. } => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub dedup_window: Duration,
    pub op_timeout: std::time::Duration,
}

impl From<&EngineSection> for EngineSettings {
    fn from(section: &EngineSection) -> Self {
        Self {
            dedup_window: section.dedup_window(),
            op_timeout: section.op_timeout(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

enum Decision {
    Applied(Transition, TransitionEvent),
    Duplicate(Transition),
    Denied(DenialReason),
}

pub struct FlowEngine {
    db: DbHandle,
    registry: Arc<StageRegistry>,
    policy: Arc<TransitionPolicy>,
    store: WorkItemStore,
    locks: LockPool,
    aggregator: AggregatorHandle,
    settings: EngineSettings,
}

impl FlowEngine {
    pub fn new(
        db: DbHandle,
        registry: Arc<StageRegistry>,
        policy: Arc<TransitionPolicy>,
        aggregator: AggregatorHandle,
        lock_shards: usize,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store: WorkItemStore::new(db.clone(), registry.clone()),
            db,
            registry,
            policy,
            locks: LockPool::new(lock_shards),
            aggregator,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &TransitionPolicy {
        &self.policy
    }

    pub fn store(&self) -> &WorkItemStore {
        &self.store
    }

    pub fn aggregator(&self) -> &AggregatorHandle {
        &self.aggregator
    }

    /// Create a work item in the initial stage.
    pub async fn create_work_item(&self, new: NewWorkItem) -> Result<Created, FlowError> {
        let created = self.store.create(new).await?;
        if let Created::New { item, initial } = &created {
            let initial_stage = self.registry.by_id(initial.to_stage_id);
            self.aggregator.notify(TransitionEvent {
                transition_id: initial.id,
                work_item_id: item.id,
                from: None,
                to: initial.to_stage_id,
                timestamp: initial.timestamp,
                previous_entered_at: None,
                item_created_at: item.created_at,
                first_terminal_entry: initial_stage.is_some_and(|s| s.is_terminal()),
            });
            tracing::info!(work_item_id = item.id, item_type = %item.item_type, "Work item created");
        }
        Ok(created)
    }

    /// Apply one transition request.
    ///
    /// Denials and dedup hits are `Ok`; errors mean nothing was written.
    pub async fn apply(&self, req: TransitionRequest) -> Result<ApplyOutcome, FlowError> {
        let deadline = tokio::time::Instant::now() + self.settings.op_timeout;
        let snapshot = self.registry.snapshot();

        let Some(target) = snapshot.resolve(&req.target).cloned() else {
            tracing::debug!(
                work_item_id = req.work_item_id,
                target = %req.target,
                "Transition denied: unknown target stage"
            );
            return Ok(ApplyOutcome::Denied {
                reason: DenialReason::UnknownTarget,
            });
        };
        let expected = match &req.expected_stage {
            Some(stage) => Some(
                snapshot
                    .resolve(stage)
                    .map(|s| s.id)
                    .ok_or_else(|| FlowError::StageNotFound {
                        name: stage.to_string(),
                    })?,
            ),
            None => None,
        };

        let _guard = self.locks.acquire(req.work_item_id, deadline).await?;

        let decision = retry_transient_once(req.work_item_id, || {
            self.decide(&req, &target, expected, snapshot.clone(), deadline.into_std())
        })
        .await?;

        Ok(match decision {
            Decision::Applied(transition, event) => {
                tracing::info!(
                    work_item_id = req.work_item_id,
                    stage = %target.name,
                    source = %req.source,
                    clamped = transition.timestamp_clamped,
                    "Transition applied"
                );
                self.aggregator.notify(event);
                ApplyOutcome::Applied { transition }
            }
            Decision::Duplicate(transition) => {
                tracing::debug!(
                    work_item_id = req.work_item_id,
                    transition_id = transition.id,
                    "Duplicate transition suppressed"
                );
                ApplyOutcome::Duplicate { transition }
            }
            Decision::Denied(reason) => {
                tracing::debug!(
                    work_item_id = req.work_item_id,
                    stage = %target.name,
                    %reason,
                    "Transition denied"
                );
                ApplyOutcome::Denied { reason }
            }
        })
    }

    async fn decide(
        &self,
        req: &TransitionRequest,
        target: &Stage,
        expected: Option<StageId>,
        snapshot: Arc<StageSnapshot>,
        deadline: std::time::Instant,
    ) -> Result<Decision, FlowError> {
        let req = req.clone();
        let target = target.clone();
        let policy = self.policy.clone();
        let dedup_window = self.settings.dedup_window;

        self.db
            .call(move |db| {
                if std::time::Instant::now() >= deadline {
                    return Ok(Err(FlowError::DeadlineExceeded("waiting for storage")));
                }
                db.with_transaction(|db| {
                    decide_locked(db, &req, &target, expected, &snapshot, &policy, dedup_window)
                })
            })
            .await
            .map_err(FlowError::from_storage)?
    }
}

/// Run `op`, and run it once more if it fails with a transient storage
/// error. A second transient failure is returned to the caller.
async fn retry_transient_once<T, F, Fut>(work_item_id: WorkItemId, mut op: F) -> Result<T, FlowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlowError>>,
{
    match op().await {
        Err(FlowError::TransientStorage(err)) => {
            tracing::warn!(work_item_id, error = %err, "Transient storage error; retrying once");
            op().await
        }
        other => other,
    }
}

/// Runs inside the write transaction while the per-item lock is held.
/// The outer `Result` carries storage failures, the inner one domain errors.
fn decide_locked(
    db: &FlowDb,
    req: &TransitionRequest,
    target: &Stage,
    expected: Option<StageId>,
    stages: &StageSnapshot,
    policy: &TransitionPolicy,
    dedup_window: Duration,
) -> anyhow::Result<Result<Decision, FlowError>> {
    let id = req.work_item_id;
    let Some(current) = db.stage_current(id)? else {
        return Ok(Err(FlowError::WorkItemNotFound { id }));
    };
    let last = db
        .last_transition(id)?
        .with_context(|| format!("Work item {} has a projection but no history", id))?;

    let Some(current_stage) = stages.by_id(current.stage_id) else {
        return Ok(Err(FlowError::StageNotFound {
            name: format!("#{}", current.stage_id),
        }));
    };

    if let Some(expected) = expected {
        if expected != current.stage_id {
            return Ok(Err(FlowError::Conflict(format!(
                "work item {} is in '{}', not the expected stage",
                id, current_stage.name
            ))));
        }
    }

    // The creation record is not a move, so repeating it is a same-stage denial.
    if last.from_stage_id.is_some()
        && last.to_stage_id == target.id
        && (req.observed_at - last.observed_at).abs() <= dedup_window
    {
        return Ok(Ok(Decision::Duplicate(last)));
    }

    let wip = db.count_in_stage(target.id)?;
    if let Verdict::Denied(reason) = policy.check(current_stage, Some(target), wip) {
        return Ok(Ok(Decision::Denied(reason)));
    }

    let (timestamp, clamped) = if req.observed_at <= last.timestamp {
        (last.timestamp + Duration::microseconds(1), true)
    } else {
        (req.observed_at, false)
    };

    let first_terminal_entry = target.is_terminal() && !db.has_entered_done(id)?;
    let item_created_at = db
        .item_created_at(id)?
        .with_context(|| format!("Work item {} vanished mid-transaction", id))?;

    let transition = db.append_transition(&NewTransition {
        work_item_id: id,
        from_stage_id: Some(current.stage_id),
        to_stage_id: target.id,
        timestamp,
        observed_at: req.observed_at,
        source: req.source,
        timestamp_clamped: clamped,
    })?;

    let event = TransitionEvent {
        transition_id: transition.id,
        work_item_id: id,
        from: Some(current.stage_id),
        to: target.id,
        timestamp,
        previous_entered_at: Some(current.entered_at),
        item_created_at,
        first_terminal_entry,
    };
    Ok(Ok(Decision::Applied(transition, event)))
}
