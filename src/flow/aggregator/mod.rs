//! Metrics aggregator.
//!
//! A single task owns [`FlowState`]. The engine pushes [`TransitionEvent`]s
//! through a bounded queue with `try_send`; readers send queries on a second
//! channel and wait for a oneshot reply. A full notification queue drops the
//! event and marks the state stale, and the next read rebuilds it from the log.

pub mod exposition;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use flow_common::StageId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use self::exposition::ExternalCounters;
pub use self::state::{FlowMetrics, FlowState, TransitionEvent};
use super::db::DbHandle;
use super::registry::StageRegistry;

const QUERY_QUEUE_CAPACITY: usize = 64;

enum Query {
    Metrics {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: Option<(StageId, String)>,
        reply: oneshot::Sender<Result<FlowMetrics>>,
    },
    Render {
        counters: ExternalCounters,
        reply: oneshot::Sender<Result<String>>,
    },
    Wip {
        reply: oneshot::Sender<Result<HashMap<StageId, i64>>>,
    },
    Rebuild {
        reply: oneshot::Sender<Result<()>>,
    },
}

struct Shared {
    needs_rebuild: AtomicBool,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct AggregatorHandle {
    notify_tx: mpsc::Sender<TransitionEvent>,
    query_tx: mpsc::Sender<Query>,
    shared: Arc<Shared>,
    window: Duration,
}

impl AggregatorHandle {
    /// Best effort; never blocks the caller.
    pub fn notify(&self, event: TransitionEvent) {
        match self.notify_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.needs_rebuild.store(true, Ordering::Release);
                tracing::warn!(
                    transition_id = event.transition_id,
                    work_item_id = event.work_item_id,
                    "Aggregator queue full; dropping notification and scheduling rebuild"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.shared.needs_rebuild.store(true, Ordering::Release);
                tracing::warn!(
                    transition_id = event.transition_id,
                    "Aggregator stopped; notification lost"
                );
            }
        }
    }

    pub fn dropped_notifications(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn needs_rebuild(&self) -> bool {
        self.shared.needs_rebuild.load(Ordering::Acquire)
    }

    /// Sample retention.
    pub fn window(&self) -> Duration {
        self.window
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Query) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("Aggregator task is not running"))?;
        rx.await.context("Aggregator dropped the reply")?
    }

    pub async fn metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: Option<(StageId, String)>,
    ) -> Result<FlowMetrics> {
        self.ask(|reply| Query::Metrics {
            start,
            end,
            stage,
            reply,
        })
        .await
    }

    /// Scrape text.
    pub async fn render(&self, counters: ExternalCounters) -> Result<String> {
        self.ask(|reply| Query::Render { counters, reply }).await
    }

    pub async fn wip(&self) -> Result<HashMap<StageId, i64>> {
        self.ask(|reply| Query::Wip { reply }).await
    }

    pub async fn rebuild(&self) -> Result<()> {
        self.ask(|reply| Query::Rebuild { reply }).await
    }
}

pub struct Aggregator {
    db: DbHandle,
    registry: Arc<StageRegistry>,
    state: FlowState,
    shared: Arc<Shared>,
}

impl Aggregator {
    /// Rebuild from the log, then start the owner task.
    pub async fn spawn(
        db: DbHandle,
        registry: Arc<StageRegistry>,
        window: Duration,
        capacity: usize,
    ) -> Result<(AggregatorHandle, JoinHandle<()>)> {
        let (notify_tx, notify_rx) = mpsc::channel(capacity.max(1));
        let (query_tx, query_rx) = mpsc::channel(QUERY_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            needs_rebuild: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        let mut aggregator = Self {
            db,
            registry,
            state: FlowState::new(window),
            shared: shared.clone(),
        };
        aggregator
            .rebuild()
            .await
            .context("Initial aggregator rebuild failed")?;

        let task = tokio::spawn(aggregator.run(notify_rx, query_rx));
        let handle = AggregatorHandle {
            notify_tx,
            query_tx,
            shared,
            window,
        };
        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut notify_rx: mpsc::Receiver<TransitionEvent>,
        mut query_rx: mpsc::Receiver<Query>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = notify_rx.recv() => self.apply(&event),
                Some(query) = query_rx.recv() => self.answer(query).await,
                else => break,
            }
        }
        tracing::debug!("Aggregator task stopped");
    }

    fn apply(&mut self, event: &TransitionEvent) {
        let stages = self.registry.snapshot();
        self.state
            .apply(event, |id| stages.by_id(id).map(|s| s.category));
    }

    async fn answer(&mut self, query: Query) {
        if let Query::Rebuild { reply } = query {
            let _ = reply.send(self.rebuild().await);
            return;
        }

        let fresh = self.refresh().await;
        let now = Utc::now();
        self.state.prune(now);

        match query {
            Query::Metrics {
                start,
                end,
                stage,
                reply,
            } => {
                let answer = fresh.map(|()| self.state.metrics(start, end, stage, "aggregator"));
                let _ = reply.send(answer);
            }
            Query::Render { mut counters, reply } => {
                counters.dropped_notifications = self.shared.dropped.load(Ordering::Relaxed);
                let stages = self.registry.snapshot();
                let answer =
                    fresh.map(|()| exposition::render(&self.state, &stages, &counters, now));
                let _ = reply.send(answer);
            }
            Query::Wip { reply } => {
                let _ = reply.send(fresh.map(|()| self.state.wip.clone()));
            }
            Query::Rebuild { .. } => {}
        }
    }

    /// Rebuild if a notification was lost since the last read.
    async fn refresh(&mut self) -> Result<()> {
        if self.shared.needs_rebuild.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.rebuild().await {
                self.shared.needs_rebuild.store(true, Ordering::Release);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn rebuild(&mut self) -> Result<()> {
        let window = self.state.window();
        let cutoff = self.state.cutoff(Utc::now());
        let (baseline, events, wip, watermark) = self
            .db
            .call(move |db| {
                let watermark = db.max_transition_id()?;
                let baseline = db.open_items_before(cutoff)?;
                let mut events = Vec::new();
                db.for_each_since(cutoff, None, |entry| {
                    events.push(TransitionEvent::from(&entry));
                    Ok(())
                })?;
                let wip = db.stage_counts()?;
                Ok((baseline, events, wip, watermark))
            })
            .await?;

        let stages = self.registry.snapshot();
        let folded = events.len();
        self.state = FlowState::rebuilt(
            window,
            baseline as i64,
            &events,
            wip,
            watermark,
            |id| stages.by_id(id).map(|s| s.category),
        );
        tracing::info!(transitions = folded, watermark, "Aggregator rebuilt from log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::db::tests::seeded_db;
    use crate::flow::db::NewTransition;
    use flow_common::{TransitionSource, WorkItemType};

    async fn setup(capacity: usize) -> (DbHandle, AggregatorHandle) {
        let db = DbHandle::new(seeded_db().unwrap());
        let registry = Arc::new(StageRegistry::load(db.clone()).await.unwrap());
        let (handle, _task) = Aggregator::spawn(db.clone(), registry, Duration::days(30), capacity)
            .await
            .unwrap();
        (db, handle)
    }

    async fn append(db: &DbHandle, from: Option<StageId>, to: StageId, at: DateTime<Utc>) -> TransitionEvent {
        db.call(move |db| {
            let item = match from {
                None => db.insert_work_item("x", WorkItemType::Task, at)?,
                Some(_) => 1,
            };
            let previous = db.last_transition(item)?.map(|t| t.timestamp);
            let t = db.append_transition(&NewTransition {
                work_item_id: item,
                from_stage_id: from,
                to_stage_id: to,
                timestamp: at,
                observed_at: at,
                source: TransitionSource::Api,
                timestamp_clamped: false,
            })?;
            Ok(TransitionEvent {
                transition_id: t.id,
                work_item_id: item,
                from,
                to,
                timestamp: at,
                previous_entered_at: previous,
                item_created_at: db.item_created_at(item)?.unwrap(),
                first_terminal_entry: to == 3,
            })
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_notifications_update_wip() {
        let (db, handle) = setup(16).await;
        let now = Utc::now();
        handle.notify(append(&db, None, 1, now - Duration::seconds(30)).await);
        handle.notify(append(&db, Some(1), 2, now - Duration::seconds(10)).await);

        let wip = handle.wip().await.unwrap();
        assert_eq!(wip.get(&1).copied().unwrap_or(0), 0);
        assert_eq!(wip.get(&2), Some(&1));
        assert!(!handle.needs_rebuild());
    }

    #[tokio::test]
    async fn test_startup_rebuild_reads_log() {
        let db = DbHandle::new(seeded_db().unwrap());
        let now = Utc::now();
        append(&db, None, 1, now - Duration::seconds(100)).await;
        append(&db, Some(1), 2, now - Duration::seconds(40)).await;

        let registry = Arc::new(StageRegistry::load(db.clone()).await.unwrap());
        let (handle, _task) = Aggregator::spawn(db, registry, Duration::days(30), 8)
            .await
            .unwrap();
        let metrics = handle
            .metrics(now - Duration::hours(1), now, Some((1, "Backlog".into())))
            .await
            .unwrap();
        assert_eq!(metrics.cycle_p50, Some(60.0));
        assert_eq!(metrics.source, "aggregator");
    }

    #[tokio::test]
    async fn test_dropped_notification_triggers_rebuild_on_read() {
        let (db, handle) = setup(1).await;
        let now = Utc::now();
        // Fill the queue faster than the task can drain it by never yielding.
        let first = append(&db, None, 1, now - Duration::seconds(20)).await;
        let second = append(&db, Some(1), 3, now - Duration::seconds(5)).await;
        handle.notify(first.clone());
        handle.notify(second.clone());
        handle.notify(second);

        let text = handle.render(ExternalCounters::default()).await.unwrap();
        assert!(text.contains("flow_wip{stage=\"Done\",category=\"done\"} 1\n"));
        assert!(text.contains("flow_throughput_per_day{category=\"done\"} 1\n"));
        assert!(handle.dropped_notifications() >= 1);
        assert!(!handle.needs_rebuild());
    }

    #[tokio::test]
    async fn test_explicit_rebuild() {
        let (db, handle) = setup(8).await;
        append(&db, None, 1, Utc::now() - Duration::seconds(5)).await;
        // Not notified; the rebuild picks it up from the log.
        handle.rebuild().await.unwrap();
        assert_eq!(handle.wip().await.unwrap().get(&1), Some(&1));
    }
}
