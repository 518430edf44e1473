//! Focalboard webhook ingress.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use flow_common::{DenialReason, StageId, TransitionSource, WorkItemId, WorkItemType};
use serde::{Deserialize, Serialize};

use super::{BoardCard, CardResolver, ColumnAliases};
use crate::errors::FlowError;
use crate::flow::engine::{ApplyOutcome, FlowEngine, TransitionRequest};
use crate::flow::store::{CardKey, Created, NewWorkItem};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub action: String,
    pub card: BoardCard,
    pub board_id: String,
    pub workspace_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardAction {
    Created,
    Moved,
    Updated,
    Deleted,
    Other,
}

impl CardAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "card.created" => Self::Created,
            "card.moved" => Self::Moved,
            "card.updated" => Self::Updated,
            "card.deleted" => Self::Deleted,
            _ => Self::Other,
        }
    }
}

/// Why an accepted payload changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IgnoreReason {
    CardDeleted,
    UnsupportedAction,
    UnboundCard,
    Unchanged,
    StaleBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        work_item_id: WorkItemId,
        transition_id: i64,
        clamped: bool,
    },
    /// New item left in the initial stage.
    Created { work_item_id: WorkItemId },
    Duplicate {
        work_item_id: WorkItemId,
        transition_id: i64,
    },
    Denied {
        work_item_id: Option<WorkItemId>,
        reason: DenialReason,
    },
    Ignored { reason: IgnoreReason },
}

impl WebhookOutcome {
    fn from_apply(work_item_id: WorkItemId, outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied { transition } => Self::Applied {
                work_item_id,
                transition_id: transition.id,
                clamped: transition.timestamp_clamped,
            },
            ApplyOutcome::Duplicate { transition } => Self::Duplicate {
                work_item_id,
                transition_id: transition.id,
            },
            ApplyOutcome::Denied { reason } => Self::Denied {
                work_item_id: Some(work_item_id),
                reason,
            },
        }
    }

    /// Counter label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Created { .. } => "created",
            Self::Duplicate { .. } => "duplicate",
            Self::Denied {
                reason: DenialReason::UnknownTarget,
                ..
            } => "unknown_column",
            Self::Denied { .. } => "denied",
            Self::Ignored {
                reason: IgnoreReason::UnsupportedAction,
            } => "unknown_action",
            Self::Ignored { .. } => "ignored",
        }
    }
}

const OUTCOME_LABELS: [&str; 8] = [
    "applied",
    "created",
    "duplicate",
    "denied",
    "unknown_column",
    "ignored",
    "unknown_action",
    "failed",
];

/// Per-outcome webhook counters, exported on the scrape endpoint.
#[derive(Debug, Default)]
pub struct IngressCounters {
    counts: [AtomicU64; 8],
}

impl IngressCounters {
    pub fn record(&self, label: &str) {
        if let Some(idx) = OUTCOME_LABELS.iter().position(|l| *l == label) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, label: &str) -> u64 {
        OUTCOME_LABELS
            .iter()
            .position(|l| *l == label)
            .map(|idx| self.counts[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        OUTCOME_LABELS
            .iter()
            .zip(&self.counts)
            .map(|(label, count)| (*label, count.load(Ordering::Relaxed)))
            .collect()
    }
}

pub struct WebhookAdapter {
    engine: Arc<FlowEngine>,
    resolver: Arc<dyn CardResolver>,
    aliases: Arc<ColumnAliases>,
    counters: Arc<IngressCounters>,
}

impl WebhookAdapter {
    pub fn new(
        engine: Arc<FlowEngine>,
        resolver: Arc<dyn CardResolver>,
        aliases: Arc<ColumnAliases>,
        counters: Arc<IngressCounters>,
    ) -> Self {
        Self {
            engine,
            resolver,
            aliases,
            counters,
        }
    }

    pub fn counters(&self) -> &IngressCounters {
        &self.counters
    }

    /// Handle one delivery. `Ok` means the payload is acknowledged, whatever
    /// it did; errors are for the producer to act on.
    pub async fn handle(&self, payload: WebhookPayload) -> Result<WebhookOutcome, FlowError> {
        let board_id = if payload.card.board_id.is_empty() {
            payload.board_id.clone()
        } else {
            payload.card.board_id.clone()
        };
        tracing::debug!(
            action = %payload.action,
            board_id = %board_id,
            card_id = %payload.card.id,
            workspace_id = %payload.workspace_id,
            "Webhook received"
        );

        let result = match CardAction::parse(&payload.action) {
            CardAction::Created => self.on_created(&board_id, &payload.card).await,
            CardAction::Moved => self.on_moved(&board_id, &payload.card).await,
            CardAction::Updated => self.on_updated(&board_id, &payload.card).await,
            CardAction::Deleted => {
                tracing::info!(
                    board_id = %board_id,
                    card_id = %payload.card.id,
                    "Card deleted on board; work item history kept"
                );
                Ok(WebhookOutcome::Ignored {
                    reason: IgnoreReason::CardDeleted,
                })
            }
            CardAction::Other => {
                tracing::warn!(action = %payload.action, "Unsupported webhook action");
                Ok(WebhookOutcome::Ignored {
                    reason: IgnoreReason::UnsupportedAction,
                })
            }
        };

        match &result {
            Ok(outcome) => {
                if outcome.label() == "unknown_column" {
                    tracing::warn!(
                        board_id = %board_id,
                        card_id = %payload.card.id,
                        column = %payload.card.status,
                        "Card column does not map to any stage"
                    );
                }
                self.counters.record(outcome.label());
            }
            Err(err) => {
                tracing::error!(
                    board_id = %board_id,
                    card_id = %payload.card.id,
                    error = %err,
                    "Webhook processing failed"
                );
                self.counters.record("failed");
            }
        }
        result
    }

    async fn on_created(
        &self,
        board_id: &str,
        card: &BoardCard,
    ) -> Result<WebhookOutcome, FlowError> {
        let observed_at = card.updated_at()?;
        if let Some(id) = self.resolver.resolve(board_id, &card.id).await? {
            return self.redelivered(id, card, observed_at).await;
        }
        let created_at = card.created_at()?;

        let mut new = NewWorkItem::new(
            card.work_item_title(),
            WorkItemType::from_card_type(card.card_type.as_deref()),
        );
        new.created_at = created_at;
        new.source = TransitionSource::Webhook;
        new.binding = Some(CardKey {
            board_id: board_id.to_string(),
            card_id: card.id.clone(),
        });

        let (id, initial) = match self.engine.create_work_item(new).await? {
            Created::New { item, .. } => (item.id, item.current_stage_id),
            // Lost a race with a concurrent delivery for the same card.
            Created::Existing(id) => return self.redelivered(id, card, observed_at).await,
        };
        tracing::info!(
            work_item_id = id,
            board_id = %board_id,
            card_id = %card.id,
            "Work item created from card"
        );

        let target = self.target_of(card);
        match target {
            None => Ok(WebhookOutcome::Denied {
                work_item_id: Some(id),
                reason: DenialReason::UnknownTarget,
            }),
            Some(stage) if stage == initial => Ok(WebhookOutcome::Created { work_item_id: id }),
            Some(stage) => {
                // Boards usually stamp createAt == updateAt; the move still
                // has to land after the initial record without being clamped.
                let moved_at = observed_at.max(created_at + Duration::microseconds(1));
                self.apply(id, stage, moved_at).await
            }
        }
    }

    /// `card.created` for a card that is already bound.
    async fn redelivered(
        &self,
        id: WorkItemId,
        card: &BoardCard,
        observed_at: DateTime<Utc>,
    ) -> Result<WebhookOutcome, FlowError> {
        let Some(target) = self.target_of(card) else {
            return Ok(WebhookOutcome::Denied {
                work_item_id: Some(id),
                reason: DenialReason::UnknownTarget,
            });
        };
        match self.engine.store().stage_of(id).await {
            Ok(current) if current.id == target => Ok(WebhookOutcome::Ignored {
                reason: IgnoreReason::Unchanged,
            }),
            Ok(_) => self.apply(id, target, observed_at).await,
            Err(FlowError::WorkItemNotFound { .. }) => Ok(stale_binding(id)),
            Err(err) => Err(err),
        }
    }

    async fn on_moved(&self, board_id: &str, card: &BoardCard) -> Result<WebhookOutcome, FlowError> {
        match self.resolver.resolve(board_id, &card.id).await? {
            Some(id) => self.move_to(id, card, card.updated_at()?).await,
            None => self.on_created(board_id, card).await,
        }
    }

    async fn on_updated(
        &self,
        board_id: &str,
        card: &BoardCard,
    ) -> Result<WebhookOutcome, FlowError> {
        let observed_at = card.updated_at()?;
        let Some(id) = self.resolver.resolve(board_id, &card.id).await? else {
            return Ok(WebhookOutcome::Ignored {
                reason: IgnoreReason::UnboundCard,
            });
        };
        let Some(target) = self.target_of(card) else {
            return Ok(WebhookOutcome::Denied {
                work_item_id: Some(id),
                reason: DenialReason::UnknownTarget,
            });
        };
        let current = match self.engine.store().stage_of(id).await {
            Ok(stage) => stage,
            Err(FlowError::WorkItemNotFound { .. }) => return Ok(stale_binding(id)),
            Err(err) => return Err(err),
        };
        if current.id == target {
            return Ok(WebhookOutcome::Ignored {
                reason: IgnoreReason::Unchanged,
            });
        }
        self.apply(id, target, observed_at).await
    }

    async fn move_to(
        &self,
        id: WorkItemId,
        card: &BoardCard,
        observed_at: DateTime<Utc>,
    ) -> Result<WebhookOutcome, FlowError> {
        match self.target_of(card) {
            Some(stage) => self.apply(id, stage, observed_at).await,
            None => Ok(WebhookOutcome::Denied {
                work_item_id: Some(id),
                reason: DenialReason::UnknownTarget,
            }),
        }
    }

    async fn apply(
        &self,
        id: WorkItemId,
        stage: StageId,
        observed_at: DateTime<Utc>,
    ) -> Result<WebhookOutcome, FlowError> {
        let req = TransitionRequest::new(id, stage, TransitionSource::Webhook, observed_at);
        match self.engine.apply(req).await {
            Ok(outcome) => Ok(WebhookOutcome::from_apply(id, outcome)),
            Err(FlowError::WorkItemNotFound { .. }) => Ok(stale_binding(id)),
            Err(err) => Err(err),
        }
    }

    fn target_of(&self, card: &BoardCard) -> Option<StageId> {
        let stages = self.engine.registry().snapshot();
        self.aliases.resolve(&card.status, &stages).map(|s| s.id)
    }
}

fn stale_binding(id: WorkItemId) -> WebhookOutcome {
    tracing::warn!(work_item_id = id, "Card is bound to a missing work item");
    WebhookOutcome::Ignored {
        reason: IgnoreReason::StaleBinding,
    }
}
