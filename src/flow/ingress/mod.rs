//! Ingress adapters: everything outside the engine that turns external
//! signals into transition requests.
//!
//! - [`direct`]: caller-driven API operations
//! - [`webhook`]: board card events pushed by Focalboard
//! - [`sync`]: periodic reconciliation against the board's own view
//!
//! Board cards reach work items through a [`CardResolver`] and columns reach
//! stages through [`ColumnAliases`].

pub mod direct;
pub mod sync;
pub mod webhook;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_common::{MAX_TITLE_LEN, Stage, WorkItemId};
use serde::{Deserialize, Serialize};

use super::db::DbHandle;
use super::registry::StageSnapshot;
use crate::errors::FlowError;

/// A card as Focalboard reports it, both in webhook bodies and card listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardCard {
    pub id: String,
    pub title: String,
    pub board_id: String,
    /// Column name.
    pub status: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub card_type: Option<String>,
    /// Milliseconds since the epoch.
    pub create_at: i64,
    pub update_at: i64,
}

impl BoardCard {
    pub fn created_at(&self) -> Result<DateTime<Utc>, FlowError> {
        millis(self.create_at, "createAt")
    }

    pub fn updated_at(&self) -> Result<DateTime<Utc>, FlowError> {
        millis(self.update_at, "updateAt")
    }

    /// Title usable for a work item. Overlong titles are cut rather than
    /// rejected since the board does not enforce our limit.
    pub fn work_item_title(&self) -> String {
        let trimmed = self.title.trim();
        if trimmed.is_empty() {
            return format!("Card {}", self.id);
        }
        trimmed.chars().take(MAX_TITLE_LEN).collect()
    }
}

fn millis(value: i64, field: &str) -> Result<DateTime<Utc>, FlowError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| FlowError::Validation(format!("{} is not a valid timestamp: {}", field, value)))
}

/// Maps a board card to the work item it is bound to.
#[async_trait]
pub trait CardResolver: Send + Sync {
    async fn resolve(&self, board_id: &str, card_id: &str)
    -> Result<Option<WorkItemId>, FlowError>;
}

/// Resolver backed by the `card_bindings` table.
pub struct DbCardResolver {
    db: DbHandle,
}

impl DbCardResolver {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CardResolver for DbCardResolver {
    async fn resolve(
        &self,
        board_id: &str,
        card_id: &str,
    ) -> Result<Option<WorkItemId>, FlowError> {
        let board_id = board_id.to_string();
        let card_id = card_id.to_string();
        self.db
            .call(move |db| db.resolve_card(&board_id, &card_id))
            .await
            .map_err(FlowError::from_storage)
    }
}

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("backlog", "Backlog"),
    ("design", "Design"),
    ("development", "Development"),
    ("code review", "Code Review"),
    ("testing", "Testing"),
    ("deployment approval", "Deployment Approval"),
    ("deploy", "Deploy"),
    ("production", "Production"),
    ("done", "Production"),
    ("to do", "Backlog"),
    ("in progress", "Development"),
    ("in review", "Code Review"),
];

/// Lowercase, trimmed, inner whitespace collapsed to single spaces.
pub fn normalize_column(column: &str) -> String {
    column
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Board column name to stage name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnAliases {
    #[serde(rename = "column_to_stage")]
    map: BTreeMap<String, String>,
}

impl ColumnAliases {
    pub fn builtin() -> Self {
        Self {
            map: BUILTIN_ALIASES
                .iter()
                .map(|(column, stage)| (column.to_string(), stage.to_string()))
                .collect(),
        }
    }

    /// Builtin table with configured entries layered on top. Entries with an
    /// empty target are skipped.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut aliases = Self::builtin();
        for (column, stage) in overrides {
            let stage = stage.trim();
            if stage.is_empty() {
                continue;
            }
            aliases.map.insert(normalize_column(column), stage.to_string());
        }
        aliases
    }

    pub fn stage_name(&self, column: &str) -> Option<&str> {
        self.map.get(&normalize_column(column)).map(String::as_str)
    }

    /// Alias first, then a case-insensitive stage name match.
    pub fn resolve<'a>(&self, column: &str, stages: &'a StageSnapshot) -> Option<&'a Stage> {
        let key = normalize_column(column);
        if let Some(stage) = self.map.get(&key).and_then(|name| stages.by_name(name)) {
            return Some(stage);
        }
        stages.by_name(&key)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.map
    }
}

impl Default for ColumnAliases {
    fn default() -> Self {
        Self::builtin()
    }
}
