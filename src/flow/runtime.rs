use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use super::aggregator::Aggregator;
use super::board::FocalboardClient;
use super::db::DbHandle;
use super::engine::{EngineSettings, FlowEngine};
use super::ingress::direct::DirectApi;
use super::ingress::sync::{BoardClient, BoardSync, SyncHandle, SyncWorker};
use super::ingress::webhook::{IngressCounters, WebhookAdapter};
use super::ingress::{CardResolver, ColumnAliases, DbCardResolver};
use super::policy::TransitionPolicy;
use super::query::QueryFacade;
use super::registry::StageRegistry;
use crate::config::FlowToml;

/// Every long-lived component of a running flow engine.
pub struct FlowRuntime {
    pub db: DbHandle,
    pub registry: Arc<StageRegistry>,
    pub engine: Arc<FlowEngine>,
    pub query: QueryFacade,
    pub direct: DirectApi,
    pub webhook: Arc<WebhookAdapter>,
    pub aliases: Arc<ColumnAliases>,
    pub counters: Arc<IngressCounters>,
    /// `None` when sync is disabled or no board client is available.
    pub sync: Option<SyncHandle>,
    sync_worker: Option<SyncWorker>,
    aggregator_task: JoinHandle<()>,
}

impl FlowRuntime {
    /// Assemble the runtime. The board client is the Focalboard REST client
    /// when a token is configured.
    pub async fn build(db: DbHandle, config: &FlowToml) -> Result<Self> {
        let client = FocalboardClient::from_config(&config.focalboard)
            .map(|c| Arc::new(c) as Arc<dyn BoardClient>);
        Self::build_with(db, config, client).await
    }

    pub async fn build_with(
        db: DbHandle,
        config: &FlowToml,
        board_client: Option<Arc<dyn BoardClient>>,
    ) -> Result<Self> {
        let registry = Arc::new(
            StageRegistry::load(db.clone())
                .await
                .context("No usable stage catalog; run `fawkes-flow load-stages` first")?,
        );

        let policy = TransitionPolicy::from_config(&config.policy)?;
        for name in policy.unknown_stages(&registry.snapshot()) {
            tracing::warn!(stage = %name, "Policy table names a stage that does not exist");
        }
        let policy = Arc::new(policy);

        let (aggregator, aggregator_task) = Aggregator::spawn(
            db.clone(),
            registry.clone(),
            config.metrics.window(),
            config.engine.notify_queue_capacity,
        )
        .await?;

        let engine = Arc::new(FlowEngine::new(
            db.clone(),
            registry.clone(),
            policy.clone(),
            aggregator.clone(),
            config.engine.wip_lock_shards,
            EngineSettings::from(&config.engine),
        ));

        let aliases = Arc::new(ColumnAliases::with_overrides(&config.column_aliases));
        let resolver: Arc<dyn CardResolver> = Arc::new(DbCardResolver::new(db.clone()));
        let counters = Arc::new(IngressCounters::default());
        let webhook = Arc::new(WebhookAdapter::new(
            engine.clone(),
            resolver.clone(),
            aliases.clone(),
            counters.clone(),
        ));

        let (sync, sync_worker) = match (config.sync.enabled, board_client) {
            (true, Some(client)) => {
                let board_sync = Arc::new(BoardSync::new(
                    engine.clone(),
                    client,
                    resolver,
                    aliases.clone(),
                    config.sync.boards.clone(),
                ));
                let (handle, worker) = SyncWorker::spawn(board_sync, config.sync.interval());
                (Some(handle), Some(worker))
            }
            (true, None) => {
                tracing::warn!(
                    token_env = %config.focalboard.token_env,
                    "Board sync enabled but no Focalboard token is set; sync disabled"
                );
                (None, None)
            }
            (false, _) => (None, None),
        };

        tracing::info!(
            stages = registry.snapshot().list().len(),
            policy = policy.table().kind,
            sync = sync.is_some(),
            "Flow runtime ready"
        );

        Ok(Self {
            query: QueryFacade::new(db.clone(), registry.clone(), aggregator, policy),
            direct: DirectApi::new(engine.clone()),
            db,
            registry,
            engine,
            webhook,
            aliases,
            counters,
            sync,
            sync_worker,
            aggregator_task,
        })
    }

    /// Stop background tasks.
    pub async fn shutdown(self) {
        if let Some(worker) = self.sync_worker {
            worker.shutdown().await;
        }
        self.aggregator_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::db::FlowDb;
    use crate::flow::db::tests::stage;
    use flow_common::StageCategory;

    fn db() -> DbHandle {
        let db = FlowDb::new_in_memory().unwrap();
        db.insert_stage(&stage("Backlog", 1, StageCategory::Wait, None)).unwrap();
        db.insert_stage(&stage("Done", 2, StageCategory::Done, None)).unwrap();
        DbHandle::new(db)
    }

    #[tokio::test]
    async fn test_build_without_board_client_disables_sync() {
        let runtime = FlowRuntime::build_with(db(), &FlowToml::default(), None)
            .await
            .unwrap();
        assert!(runtime.sync.is_none());
        assert_eq!(runtime.registry.list().len(), 2);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_build_requires_stages() {
        let empty = DbHandle::new(FlowDb::new_in_memory().unwrap());
        let err = FlowRuntime::build_with(empty, &FlowToml::default(), None)
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("load-stages"));
    }
}
