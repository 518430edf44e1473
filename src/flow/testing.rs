//! In-memory flow fixtures shared by unit tests.

use std::sync::Arc;

use chrono::Duration;

pub(crate) use super::db::tests::stage;
use super::aggregator::Aggregator;
use super::db::{DbHandle, FlowDb, NewStage};
use super::engine::{EngineSettings, FlowEngine};
use super::log::TransitionLog;
use super::policy::TransitionPolicy;
use super::registry::StageRegistry;

pub(crate) struct TestFlow {
    pub db: DbHandle,
    pub registry: Arc<StageRegistry>,
    pub engine: Arc<FlowEngine>,
    pub log: TransitionLog,
}

impl TestFlow {
    pub async fn new(stages: Vec<NewStage>) -> Self {
        Self::with_policy(stages, TransitionPolicy::default()).await
    }

    pub async fn with_policy(stages: Vec<NewStage>, policy: TransitionPolicy) -> Self {
        let db = FlowDb::new_in_memory().unwrap();
        for s in &stages {
            db.insert_stage(s).unwrap();
        }
        let db = DbHandle::new(db);
        let registry = Arc::new(StageRegistry::load(db.clone()).await.unwrap());
        let (aggregator, _task) =
            Aggregator::spawn(db.clone(), registry.clone(), Duration::days(30), 256)
                .await
                .unwrap();
        let engine = Arc::new(FlowEngine::new(
            db.clone(),
            registry.clone(),
            Arc::new(policy),
            aggregator,
            16,
            EngineSettings::default(),
        ));
        Self {
            log: TransitionLog::new(db.clone()),
            db,
            registry,
            engine,
        }
    }
}
