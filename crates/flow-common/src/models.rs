use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type StageId = i64;
pub type WorkItemId = i64;
pub type TransitionId = i64;

/// Maximum length of a work item title, in characters.
pub const MAX_TITLE_LEN: usize = 500;

/// Error returned when a closed vocabulary value fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ── Stage ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageCategory {
    Wait,
    Active,
    Done,
}

impl StageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Active => "active",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for StageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            _ => Err(ParseEnumError::new("stage category", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub order: i32,
    pub category: StageCategory,
    /// `None` means unlimited.
    pub wip_limit: Option<u32>,
    pub description: String,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        self.category.is_terminal()
    }
}

/// A target stage as supplied by a caller: either a registry id or a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageRef {
    Id(StageId),
    Name(String),
}

impl From<&str> for StageRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for StageRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<StageId> for StageRef {
    fn from(id: StageId) -> Self {
        Self::Id(id)
    }
}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{}", id),
            Self::Name(name) => f.write_str(name),
        }
    }
}

// ── Work item ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemType {
    Feature,
    Bug,
    Task,
    Epic,
}

impl WorkItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Task => "task",
            Self::Epic => "epic",
        }
    }

    /// Infer an item type from a free-form board card type.
    /// Anything unrecognised is a task.
    pub fn from_card_type(card_type: Option<&str>) -> Self {
        let Some(raw) = card_type else {
            return Self::Task;
        };
        let lower = raw.to_lowercase();
        if lower.contains("feature") {
            Self::Feature
        } else if lower.contains("bug") {
            Self::Bug
        } else if lower.contains("epic") {
            Self::Epic
        } else {
            Self::Task
        }
    }
}

impl fmt::Display for WorkItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(Self::Feature),
            "bug" => Ok(Self::Bug),
            "task" => Ok(Self::Task),
            "epic" => Ok(Self::Epic),
            _ => Err(ParseEnumError::new("work item type", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub title: String,
    #[serde(rename = "type")]
    pub item_type: WorkItemType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_stage_id: StageId,
    pub stage_entered_at: DateTime<Utc>,
}

// ── Transition ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSource {
    Api,
    Webhook,
    Sync,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Webhook => "webhook",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for TransitionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "webhook" => Ok(Self::Webhook),
            "sync" => Ok(Self::Sync),
            _ => Err(ParseEnumError::new("transition source", s)),
        }
    }
}

/// One recorded movement of a work item. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub work_item_id: WorkItemId,
    /// Absent for the initial transition.
    pub from_stage_id: Option<StageId>,
    pub to_stage_id: StageId,
    /// Effective timestamp; strictly increasing per work item.
    pub timestamp: DateTime<Utc>,
    /// Timestamp as reported by the caller.
    pub observed_at: DateTime<Utc>,
    pub source: TransitionSource,
    /// Set when `observed_at` was not after the previous transition and the
    /// effective timestamp was moved forward.
    pub timestamp_clamped: bool,
}

/// Projection row: where a work item is now and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCurrent {
    pub work_item_id: WorkItemId,
    pub stage_id: StageId,
    pub entered_at: DateTime<Utc>,
    pub last_transition_id: TransitionId,
}

// ── Policy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialReason {
    UnknownTarget,
    SameStage,
    NotReachable,
    WipLimitExceeded,
    TerminalStage,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTarget => "unknown-target",
            Self::SameStage => "same-stage",
            Self::NotReachable => "not-reachable",
            Self::WipLimitExceeded => "wip-limit-exceeded",
            Self::TerminalStage => "terminal-stage",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
