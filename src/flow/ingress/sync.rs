//! Periodic reconciliation of the projection against board columns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flow_common::{TransitionSource, WorkItemId, WorkItemType};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{BoardCard, CardResolver, ColumnAliases};
use crate::errors::FlowError;
use crate::flow::engine::{ApplyOutcome, FlowEngine, TransitionRequest};
use crate::flow::store::{CardKey, Created, NewWorkItem};

/// Source of a board's current cards.
#[async_trait]
pub trait BoardClient: Send + Sync {
    async fn list_cards(&self, board_id: &str) -> Result<Vec<BoardCard>, FlowError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub boards: usize,
    pub checked: usize,
    pub synced: usize,
    pub failed: usize,
    pub details: Vec<String>,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.boards += other.boards;
        self.checked += other.checked;
        self.synced += other.synced;
        self.failed += other.failed;
        self.details.extend(other.details);
    }
}

enum CardSync {
    Unchanged,
    Created(WorkItemId),
    Moved {
        id: WorkItemId,
        from: String,
        to: String,
    },
}

pub struct BoardSync {
    engine: Arc<FlowEngine>,
    client: Arc<dyn BoardClient>,
    resolver: Arc<dyn CardResolver>,
    aliases: Arc<ColumnAliases>,
    boards: Vec<String>,
}

impl BoardSync {
    pub fn new(
        engine: Arc<FlowEngine>,
        client: Arc<dyn BoardClient>,
        resolver: Arc<dyn CardResolver>,
        aliases: Arc<ColumnAliases>,
        boards: Vec<String>,
    ) -> Self {
        Self {
            engine,
            client,
            resolver,
            aliases,
            boards,
        }
    }

    pub fn boards(&self) -> &[String] {
        &self.boards
    }

    /// Every configured board.
    pub async fn run_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for board in &self.boards {
            report.merge(self.run_board(board).await);
        }
        tracing::info!(
            boards = report.boards,
            checked = report.checked,
            synced = report.synced,
            failed = report.failed,
            "Board sync finished"
        );
        report
    }

    pub async fn run_board(&self, board_id: &str) -> SyncReport {
        let mut report = SyncReport {
            boards: 1,
            ..SyncReport::default()
        };
        let cards = match self.client.list_cards(board_id).await {
            Ok(cards) => cards,
            Err(err) => {
                tracing::warn!(board_id = %board_id, error = %err, "Failed to list board cards");
                report.failed += 1;
                report
                    .details
                    .push(format!("board {}: {}", board_id, err));
                return report;
            }
        };

        for card in &cards {
            report.checked += 1;
            match self.reconcile(board_id, card).await {
                Ok(CardSync::Unchanged) => {}
                Ok(CardSync::Created(id)) => {
                    report.synced += 1;
                    report
                        .details
                        .push(format!("card {}: created work item {}", card.id, id));
                }
                Ok(CardSync::Moved { id, from, to }) => {
                    report.synced += 1;
                    report.details.push(format!(
                        "card {}: work item {} moved {} -> {}",
                        card.id, id, from, to
                    ));
                }
                Err(detail) => {
                    tracing::warn!(board_id = %board_id, card_id = %card.id, %detail, "Card sync failed");
                    report.failed += 1;
                    report.details.push(format!("card {}: {}", card.id, detail));
                }
            }
        }
        report
    }

    async fn reconcile(&self, board_id: &str, card: &BoardCard) -> Result<CardSync, String> {
        let (id, created) = match self
            .resolver
            .resolve(board_id, &card.id)
            .await
            .map_err(|e| e.to_string())?
        {
            Some(id) => (id, false),
            None => (self.create(board_id, card).await.map_err(|e| e.to_string())?, true),
        };

        let stages = self.engine.registry().snapshot();
        let Some(target) = self.aliases.resolve(&card.status, &stages) else {
            return Err(format!("column '{}' does not map to a stage", card.status));
        };
        let current = self
            .engine
            .store()
            .stage_of(id)
            .await
            .map_err(|e| e.to_string())?;
        let unchanged = if created {
            CardSync::Created(id)
        } else {
            CardSync::Unchanged
        };
        if current.id == target.id {
            return Ok(unchanged);
        }

        let req = TransitionRequest::new(id, target.id, TransitionSource::Sync, Utc::now());
        match self.engine.apply(req).await.map_err(|e| e.to_string())? {
            ApplyOutcome::Applied { .. } => Ok(CardSync::Moved {
                id,
                from: current.name,
                to: target.name.clone(),
            }),
            ApplyOutcome::Duplicate { .. } => Ok(unchanged),
            ApplyOutcome::Denied { reason } => Err(format!(
                "work item {} cannot move {} -> {}: {}",
                id, current.name, target.name, reason
            )),
        }
    }

    async fn create(&self, board_id: &str, card: &BoardCard) -> Result<WorkItemId, FlowError> {
        let mut new = NewWorkItem::new(
            card.work_item_title(),
            WorkItemType::from_card_type(card.card_type.as_deref()),
        );
        new.created_at = card.created_at()?;
        new.source = TransitionSource::Sync;
        new.binding = Some(CardKey {
            board_id: board_id.to_string(),
            card_id: card.id.clone(),
        });
        Ok(match self.engine.create_work_item(new).await? {
            Created::New { item, .. } => item.id,
            Created::Existing(id) => id,
        })
    }
}

struct SyncTrigger {
    board: Option<String>,
    reply: oneshot::Sender<SyncReport>,
}

/// Requests on-demand runs from the sync worker.
#[derive(Clone)]
pub struct SyncHandle {
    trigger_tx: mpsc::Sender<SyncTrigger>,
}

impl SyncHandle {
    /// Run now, for one board or for all configured boards.
    pub async fn trigger(&self, board: Option<String>) -> Result<SyncReport, FlowError> {
        let (reply, rx) = oneshot::channel();
        self.trigger_tx
            .send(SyncTrigger { board, reply })
            .await
            .map_err(|_| FlowError::Upstream("sync worker is not running".into()))?;
        rx.await
            .map_err(|_| FlowError::Upstream("sync worker dropped the request".into()))
    }
}

pub struct SyncWorker {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the worker. A zero `interval` disables the ticker; on-demand
    /// triggers still run.
    pub fn spawn(sync: Arc<BoardSync>, interval: Duration) -> (SyncHandle, SyncWorker) {
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(sync, interval, trigger_rx, shutdown_rx));
        (SyncHandle { trigger_tx }, SyncWorker { shutdown_tx, task })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "Sync worker ended abnormally");
        }
    }
}

async fn run(
    sync: Arc<BoardSync>,
    interval: Duration,
    mut trigger_rx: mpsc::Receiver<SyncTrigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = (!interval.is_zero()).then(|| {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    });
    tracing::info!(
        boards = sync.boards().len(),
        interval_secs = interval.as_secs(),
        "Board sync worker started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                sync.run_once().await;
            }
            trigger = trigger_rx.recv() => {
                let Some(SyncTrigger { board, reply }) = trigger else { break };
                let report = match board {
                    Some(board) => sync.run_board(&board).await,
                    None => sync.run_once().await,
                };
                let _ = reply.send(report);
            }
        }
    }
    tracing::info!("Board sync worker stopped");
}
