//! Transition policy: a pure check over the stage catalog and a pair table.

use std::collections::BTreeSet;

use anyhow::{Result, bail};
use flow_common::{DenialReason, Stage};
use serde::Serialize;

use crate::config::{DEFAULT_POLICY_TABLE, PolicySection, PolicyTableConfig, StagePair};

use super::registry::StageSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(DenialReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Pairs are stored with lowercased names so lookups match the registry's
/// case-insensitive name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyTable {
    /// Forward by `order`, plus the listed backward moves.
    ForwardPlusRetry { retry: BTreeSet<(String, String)> },
    /// Only the listed pairs.
    Explicit { pairs: BTreeSet<(String, String)> },
}

fn key(pair: &StagePair) -> (String, String) {
    (pair.from.trim().to_lowercase(), pair.to.trim().to_lowercase())
}

/// Serializable view of the active table.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyTableView {
    pub kind: &'static str,
    pub pairs: Vec<StagePair>,
}

#[derive(Debug, Clone)]
pub struct TransitionPolicy {
    table: PolicyTable,
    /// Original spelling of the configured pairs, for display.
    configured: Vec<StagePair>,
}

impl TransitionPolicy {
    pub fn forward_plus_retry(retry: Vec<StagePair>) -> Self {
        Self {
            table: PolicyTable::ForwardPlusRetry {
                retry: retry.iter().map(key).collect(),
            },
            configured: retry,
        }
    }

    pub fn explicit(pairs: Vec<StagePair>) -> Self {
        Self {
            table: PolicyTable::Explicit {
                pairs: pairs.iter().map(key).collect(),
            },
            configured: pairs,
        }
    }

    pub fn from_config(section: &PolicySection) -> Result<Self> {
        match &section.table {
            PolicyTableConfig::Named(name) if name == DEFAULT_POLICY_TABLE => {
                Ok(Self::forward_plus_retry(section.retry.clone()))
            }
            PolicyTableConfig::Named(name) => bail!("Unknown policy table '{}'", name),
            PolicyTableConfig::Pairs(pairs) => Ok(Self::explicit(pairs.clone())),
        }
    }

    pub fn table(&self) -> PolicyTableView {
        let kind = match self.table {
            PolicyTable::ForwardPlusRetry { .. } => DEFAULT_POLICY_TABLE,
            PolicyTable::Explicit { .. } => "explicit",
        };
        PolicyTableView {
            kind,
            pairs: self.configured.clone(),
        }
    }

    /// Stage names referenced by the table that the catalog does not know.
    pub fn unknown_stages(&self, stages: &StageSnapshot) -> Vec<String> {
        let mut unknown: Vec<String> = self
            .configured
            .iter()
            .flat_map(|p| [&p.from, &p.to])
            .filter(|name| stages.by_name(name).is_none())
            .cloned()
            .collect();
        unknown.sort();
        unknown.dedup();
        unknown
    }

    fn listed(&self, from: &Stage, to: &Stage) -> bool {
        let pair = (from.name.to_lowercase(), to.name.to_lowercase());
        match &self.table {
            PolicyTable::ForwardPlusRetry { retry } => retry.contains(&pair),
            PolicyTable::Explicit { pairs } => pairs.contains(&pair),
        }
    }

    /// Decide whether `current → target` may happen when `target_wip` items
    /// already sit in the target stage.
    pub fn check(&self, current: &Stage, target: Option<&Stage>, target_wip: u32) -> Verdict {
        let Some(target) = target else {
            return Verdict::Denied(DenialReason::UnknownTarget);
        };
        if current.id == target.id {
            return Verdict::Denied(DenialReason::SameStage);
        }

        let listed = self.listed(current, target);
        if !listed && current.is_terminal() {
            return Verdict::Denied(DenialReason::TerminalStage);
        }

        let reachable = match self.table {
            PolicyTable::ForwardPlusRetry { .. } => listed || target.order > current.order,
            PolicyTable::Explicit { .. } => listed,
        };
        if !reachable {
            return Verdict::Denied(DenialReason::NotReachable);
        }

        match target.wip_limit {
            Some(limit) if target_wip >= limit => {
                Verdict::Denied(DenialReason::WipLimitExceeded)
            }
            _ => Verdict::Allowed,
        }
    }
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self::forward_plus_retry(Vec::new())
    }
}
