use std::sync::Arc;

use chrono::Utc;
use flow_common::{TransitionSource, WorkItem, WorkItemId, WorkItemType};

use crate::errors::FlowError;
use crate::flow::engine::{ApplyOutcome, FlowEngine, TransitionRequest};
use crate::flow::store::{Created, NewWorkItem};

/// Caller-driven operations, stamped `source=api` at the time of the call.
#[derive(Clone)]
pub struct DirectApi {
    engine: Arc<FlowEngine>,
}

impl DirectApi {
    pub fn new(engine: Arc<FlowEngine>) -> Self {
        Self { engine }
    }

    pub async fn create_work_item(
        &self,
        title: &str,
        item_type: WorkItemType,
    ) -> Result<WorkItem, FlowError> {
        match self
            .engine
            .create_work_item(NewWorkItem::new(title, item_type))
            .await?
        {
            Created::New { item, .. } => Ok(item),
            // Only bound creations can collide.
            Created::Existing(id) => self.engine.store().get(id).await,
        }
    }

    pub async fn transition(
        &self,
        work_item_id: WorkItemId,
        target_stage: &str,
        expected_stage: Option<&str>,
    ) -> Result<ApplyOutcome, FlowError> {
        let mut req =
            TransitionRequest::new(work_item_id, target_stage, TransitionSource::Api, Utc::now());
        if let Some(expected) = expected_stage {
            req = req.expecting(expected);
        }
        self.engine.apply(req).await
    }
}
