//! End-to-end flow scenarios against an in-memory database, driven through
//! the same runtime the server builds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fawkes_flow::config::FlowToml;
use fawkes_flow::errors::FlowError;
use fawkes_flow::flow::db::{DbHandle, FlowDb, NewStage};
use fawkes_flow::flow::engine::{ApplyOutcome, TransitionRequest};
use fawkes_flow::flow::ingress::BoardCard;
use fawkes_flow::flow::ingress::sync::BoardClient;
use fawkes_flow::flow::ingress::webhook::{WebhookOutcome, WebhookPayload};
use fawkes_flow::flow::runtime::FlowRuntime;
use fawkes_flow::flow::store::{Created, NewWorkItem};
use flow_common::{DenialReason, StageCategory, TransitionSource, WorkItemId, WorkItemType};

const BOARD: &str = "board-1";

// ── Fixtures ──────────────────────────────────────────────────────────

fn stage(name: &str, order: i32, category: StageCategory, wip_limit: Option<u32>) -> NewStage {
    NewStage {
        name: name.to_string(),
        order,
        category,
        wip_limit,
        description: format!("{} stage", name),
    }
}

fn flow_db() -> DbHandle {
    let db = FlowDb::new_in_memory().unwrap();
    for new in [
        stage("Backlog", 1, StageCategory::Wait, None),
        stage("Dev", 3, StageCategory::Active, Some(2)),
        stage("Testing", 4, StageCategory::Active, None),
        stage("Done", 6, StageCategory::Done, None),
    ] {
        db.insert_stage(&new).unwrap();
    }
    DbHandle::new(db)
}

#[derive(Default)]
struct FakeBoard {
    cards: Mutex<HashMap<String, Vec<BoardCard>>>,
}

impl FakeBoard {
    fn show(&self, card: BoardCard) {
        let mut cards = self.cards.lock().unwrap();
        let board = cards.entry(card.board_id.clone()).or_default();
        board.retain(|c| c.id != card.id);
        board.push(card);
    }
}

#[async_trait]
impl BoardClient for FakeBoard {
    async fn list_cards(&self, board_id: &str) -> Result<Vec<BoardCard>, FlowError> {
        Ok(self
            .cards
            .lock()
            .unwrap()
            .get(board_id)
            .cloned()
            .unwrap_or_default())
    }
}

async fn runtime_with(board: Option<Arc<FakeBoard>>) -> FlowRuntime {
    let mut config = FlowToml::default();
    config.sync.interval_secs = 0;
    config.sync.boards = vec![BOARD.to_string()];
    let client = board.map(|b| b as Arc<dyn BoardClient>);
    FlowRuntime::build_with(flow_db(), &config, client)
        .await
        .unwrap()
}

fn card(id: &str, status: &str, update_at: DateTime<Utc>) -> BoardCard {
    let update_ms = update_at.timestamp_millis();
    BoardCard {
        id: id.to_string(),
        title: format!("Card {}", id),
        board_id: BOARD.to_string(),
        status: status.to_string(),
        card_type: Some("feature".to_string()),
        create_at: update_ms - 1_000,
        update_at: update_ms,
    }
}

fn payload(action: &str, card: BoardCard) -> WebhookPayload {
    WebhookPayload {
        action: action.to_string(),
        card,
        board_id: BOARD.to_string(),
        workspace_id: "workspace-1".to_string(),
    }
}

async fn create(runtime: &FlowRuntime, title: &str) -> WorkItemId {
    let new = NewWorkItem::new(title, WorkItemType::Feature);
    match runtime.engine.create_work_item(new).await.unwrap() {
        Created::New { item, .. } => item.id,
        Created::Existing(id) => id,
    }
}

async fn move_to(runtime: &FlowRuntime, id: WorkItemId, stage: &str) -> ApplyOutcome {
    let req = TransitionRequest::new(id, stage, TransitionSource::Api, Utc::now());
    runtime.engine.apply(req).await.unwrap()
}

fn stage_id(runtime: &FlowRuntime, name: &str) -> i64 {
    runtime.registry.by_name(name).unwrap().id
}

// ── Scenarios ─────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_move_forward() {
    let runtime = runtime_with(None).await;
    let a = create(&runtime, "A").await;
    assert_eq!(runtime.query.current_stage(a).await.unwrap().name, "Backlog");

    assert!(move_to(&runtime, a, "Dev").await.is_applied());
    assert!(move_to(&runtime, a, "Done").await.is_applied());

    let history = runtime.query.history(a).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(runtime.query.items_in("Dev").await.unwrap().is_empty());

    let now = Utc::now();
    let done = runtime
        .query
        .metrics(now - Duration::days(1), now + Duration::minutes(1), Some("Done"))
        .await
        .unwrap();
    assert!(done.throughput >= 1);

    let dev = runtime
        .query
        .metrics(now - Duration::days(1), now + Duration::minutes(1), Some("Dev"))
        .await
        .unwrap();
    assert!(dev.cycle_p50.is_some());
    runtime.shutdown().await;
}

#[tokio::test]
async fn wip_limit_denies_third_item() {
    let runtime = runtime_with(None).await;
    let a = create(&runtime, "A").await;
    let b = create(&runtime, "B").await;
    let c = create(&runtime, "C").await;

    assert!(move_to(&runtime, a, "Dev").await.is_applied());
    assert!(move_to(&runtime, b, "Dev").await.is_applied());
    assert_eq!(
        move_to(&runtime, c, "Dev").await,
        ApplyOutcome::Denied {
            reason: DenialReason::WipLimitExceeded
        }
    );

    let dev = stage_id(&runtime, "Dev");
    let history = runtime.query.history(c).await.unwrap();
    assert!(history.iter().all(|t| t.to_stage_id != dev));
    assert_eq!(runtime.query.items_in("Dev").await.unwrap().len(), 2);
    runtime.shutdown().await;
}

#[tokio::test]
async fn webhook_retry_is_idempotent() {
    let runtime = runtime_with(None).await;
    let t0 = Utc::now() - Duration::minutes(5);

    let created = runtime
        .webhook
        .handle(payload("card.created", card("A", "Backlog", t0)))
        .await
        .unwrap();
    let WebhookOutcome::Created { work_item_id: a } = created else {
        panic!("expected Created, got {:?}", created);
    };

    let moved = payload("card.moved", card("A", "Dev", t0 + Duration::seconds(30)));
    let first = runtime.webhook.handle(moved.clone()).await.unwrap();
    let second = runtime.webhook.handle(moved).await.unwrap();

    let WebhookOutcome::Applied { transition_id, .. } = first else {
        panic!("expected Applied, got {:?}", first);
    };
    assert_eq!(
        second,
        WebhookOutcome::Duplicate {
            work_item_id: a,
            transition_id
        }
    );

    let dev = stage_id(&runtime, "Dev");
    let history = runtime.query.history(a).await.unwrap();
    assert_eq!(history.iter().filter(|t| t.to_stage_id == dev).count(), 1);
    assert_eq!(runtime.counters.get("duplicate"), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn out_of_order_webhook_is_clamped() {
    let runtime = runtime_with(None).await;
    // Whole seconds, so board millisecond stamps compare exactly.
    let t0 = DateTime::from_timestamp(Utc::now().timestamp() - 600, 0).unwrap();

    let created = runtime
        .webhook
        .handle(payload("card.created", card("A", "Backlog", t0 + Duration::seconds(50))))
        .await
        .unwrap();
    let WebhookOutcome::Created { work_item_id: a } = created else {
        panic!("expected Created, got {:?}", created);
    };

    let dev_at = t0 + Duration::seconds(100);
    let to_dev = TransitionRequest::new(a, "Dev", TransitionSource::Api, dev_at);
    let ApplyOutcome::Applied { transition: dev } = runtime.engine.apply(to_dev).await.unwrap()
    else {
        panic!("move to Dev was not applied");
    };

    let late = payload("card.moved", card("A", "Testing", t0 + Duration::seconds(99)));
    let outcome = runtime.webhook.handle(late).await.unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Applied { clamped: true, .. }
    ));

    let history = runtime.query.history(a).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.to_stage_id, stage_id(&runtime, "Testing"));
    assert!(last.timestamp_clamped);
    assert_eq!(last.timestamp, dev.timestamp + Duration::microseconds(1));
    assert_eq!(last.observed_at, t0 + Duration::seconds(99));
    runtime.shutdown().await;
}

#[tokio::test]
async fn sync_reconciles_drift_once() {
    let board = Arc::new(FakeBoard::default());
    let runtime = runtime_with(Some(board.clone())).await;
    let t0 = Utc::now() - Duration::minutes(10);

    let created = runtime
        .webhook
        .handle(payload("card.created", card("A", "Dev", t0)))
        .await
        .unwrap();
    let WebhookOutcome::Applied { work_item_id: a, .. } = created else {
        panic!("expected Applied, got {:?}", created);
    };
    assert_eq!(runtime.query.current_stage(a).await.unwrap().name, "Dev");

    board.show(card("A", "Testing", t0 + Duration::minutes(1)));
    let sync = runtime.sync.clone().unwrap();

    let report = sync.trigger(None).await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);

    let history = runtime.query.history(a).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.from_stage_id, Some(stage_id(&runtime, "Dev")));
    assert_eq!(last.to_stage_id, stage_id(&runtime, "Testing"));
    assert_eq!(last.source, TransitionSource::Sync);

    let again = sync.trigger(None).await.unwrap();
    assert_eq!(again.synced, 0);
    assert_eq!(again.checked, 1);
    assert_eq!(runtime.query.history(a).await.unwrap().len(), history.len());
    runtime.shutdown().await;
}

#[tokio::test]
async fn dev_cycle_percentiles() {
    let runtime = runtime_with(None).await;
    let base = Utc::now() - Duration::hours(3);

    for seconds in 1..=100i64 {
        let created_at = base + Duration::minutes(seconds);
        let mut new = NewWorkItem::new(format!("item {}", seconds), WorkItemType::Task);
        new.created_at = created_at;
        let Created::New { item, .. } = runtime.engine.create_work_item(new).await.unwrap() else {
            panic!("unbound item reported as existing");
        };

        let entered = created_at + Duration::seconds(1);
        let left = entered + Duration::seconds(seconds);
        for (target, at) in [("Dev", entered), ("Done", left)] {
            let req = TransitionRequest::new(item.id, target, TransitionSource::Api, at);
            let outcome = runtime.engine.apply(req).await.unwrap();
            assert!(outcome.is_applied(), "{} -> {}: {:?}", item.id, target, outcome);
        }
    }

    let metrics = runtime
        .query
        .metrics(base - Duration::minutes(1), Utc::now() + Duration::minutes(1), Some("Dev"))
        .await
        .unwrap();
    let within_one = |value: Option<f64>, expected: f64| {
        value.is_some_and(|v| (v - expected).abs() <= 1.0)
    };
    assert!(within_one(metrics.cycle_p50, 50.0), "p50 = {:?}", metrics.cycle_p50);
    assert!(within_one(metrics.cycle_p85, 85.0), "p85 = {:?}", metrics.cycle_p85);
    assert!(within_one(metrics.cycle_p95, 95.0), "p95 = {:?}", metrics.cycle_p95);

    let board = runtime
        .query
        .metrics(base - Duration::minutes(1), Utc::now() + Duration::minutes(1), None)
        .await
        .unwrap();
    assert_eq!(board.throughput, 100);
    runtime.shutdown().await;
}

// ── Properties ────────────────────────────────────────────────────────

#[tokio::test]
async fn identical_applies_within_window_write_once() {
    let runtime = runtime_with(None).await;
    let a = create(&runtime, "A").await;
    let at = Utc::now();

    let req = TransitionRequest::new(a, "Dev", TransitionSource::Api, at);
    let first = runtime.engine.apply(req.clone()).await.unwrap();
    let second = runtime.engine.apply(req).await.unwrap();

    let ApplyOutcome::Applied { transition } = first else {
        panic!("first apply was not applied: {:?}", first);
    };
    assert_eq!(second, ApplyOutcome::Duplicate { transition });
    assert_eq!(runtime.query.history(a).await.unwrap().len(), 2);
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workload_keeps_log_and_projection_consistent() {
    let runtime = runtime_with(None).await;
    let mut ids = Vec::new();
    for n in 0..12 {
        ids.push(create(&runtime, &format!("item {}", n)).await);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for (n, id) in ids.iter().copied().enumerate() {
        let engine = runtime.engine.clone();
        tasks.spawn(async move {
            let plan: &[&str] = match n % 3 {
                0 => &["Dev", "Testing", "Done"],
                1 => &["Dev", "Backlog", "Testing"],
                _ => &["Testing", "Dev", "Done"],
            };
            let mut applied = Vec::new();
            for target in plan {
                let req = TransitionRequest::new(id, *target, TransitionSource::Api, Utc::now());
                let outcome = engine.apply(req).await.unwrap();
                if let ApplyOutcome::Applied { transition } = outcome {
                    applied.push(transition.id);
                }
                // Items never overfill Dev, even mid-flight.
                let dev = engine.registry().by_name("Dev").unwrap();
                let in_dev = engine.store().list_in_stage(dev.id).await.unwrap().len();
                assert!(in_dev <= 2, "Dev holds {} items", in_dev);
            }
            (id, applied)
        });
    }

    let mut applied_by_item = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (id, applied) = joined.unwrap();
        applied_by_item.insert(id, applied);
    }

    let policy = runtime.engine.policy();
    for id in &ids {
        let history = runtime.query.history(*id).await.unwrap();
        assert!(history[0].from_stage_id.is_none());

        // History is the initial transition plus every successful apply.
        let recorded: Vec<i64> = history[1..].iter().map(|t| t.id).collect();
        assert_eq!(&recorded, &applied_by_item[id]);

        for pair in history.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
            assert_eq!(pair[1].from_stage_id, Some(pair[0].to_stage_id));
            let from = runtime.registry.by_id(pair[0].to_stage_id).unwrap();
            let to = runtime.registry.by_id(pair[1].to_stage_id).unwrap();
            assert!(
                policy.check(&from, Some(&to), 0).is_allowed(),
                "replayed {} -> {} is not allowed",
                from.name,
                to.name
            );
        }

        let current = runtime.query.current_stage(*id).await.unwrap();
        assert_eq!(current.id, history.last().unwrap().to_stage_id);
    }

    let mut total = 0;
    for stage in runtime.query.stages() {
        let items = runtime.query.items_in(&stage.name).await.unwrap();
        if let Some(limit) = stage.wip_limit {
            assert!(items.len() <= limit as usize);
        }
        total += items.len();
    }
    assert_eq!(total, ids.len());

    let report = runtime.engine.store().verify_projection().await.unwrap();
    assert!(report.is_consistent(), "{:?}", report.mismatches);
    runtime.shutdown().await;
}
