use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::VcsError;
use crate::model::{CommitId, EntityKind, ObjectHash, QualifiedName, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Both sides modified the entity to different content
    BothModified,
    /// Ours modified, theirs deleted
    ModifiedVsDeleted,
    /// Ours deleted, theirs modified
    DeletedVsModified,
    /// Both sides added the same name with different content
    AddAddDivergent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionState {
    Unresolved,
    Auto,
    Manual,
}

/// Outcome chosen for a conflicted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "hash", rename_all = "snake_case")]
pub enum ResolvedEntry {
    Present(ObjectHash),
    Absent,
}

/// Represents a merge conflict on one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub qualified_name: QualifiedName,
    pub kind: ConflictKind,
    /// Kind of the conflicted entity, taken from whichever side still has it
    pub entity_kind: EntityKind,
    pub base_hash: Option<ObjectHash>,
    pub ours_hash: Option<ObjectHash>,
    pub theirs_hash: Option<ObjectHash>,
    pub resolution: ResolutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedEntry>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution != ResolutionState::Unresolved
    }

    pub fn description(&self) -> String {
        let what = match self.kind {
            ConflictKind::BothModified => "modified on both sides",
            ConflictKind::ModifiedVsDeleted => "modified on ours, deleted on theirs",
            ConflictKind::DeletedVsModified => "deleted on ours, modified on theirs",
            ConflictKind::AddAddDivergent => "added on both sides with different content",
        };
        format!("{} '{}' {}", self.entity_kind, self.qualified_name, what)
    }
}

/// How to settle a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    OursWins,
    TheirsWins,
    /// Additive combination; only for kinds whose policy supports it
    Union,
    /// Caller-supplied definition; `None` resolves to deletion
    Manual { definition: Option<Value> },
}

impl FromStr for ResolutionStrategy {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ours_wins" | "ours" => Ok(ResolutionStrategy::OursWins),
            "theirs_wins" | "theirs" => Ok(ResolutionStrategy::TheirsWins),
            "union" => Ok(ResolutionStrategy::Union),
            other => Err(VcsError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Strategies for one merge: a global default plus per-entity overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolutions {
    pub default: Option<ResolutionStrategy>,
    pub per_entity: BTreeMap<QualifiedName, ResolutionStrategy>,
}

impl Resolutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(strategy: ResolutionStrategy) -> Self {
        Self {
            default: Some(strategy),
            per_entity: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: QualifiedName, strategy: ResolutionStrategy) -> Self {
        self.per_entity.insert(name, strategy);
        self
    }

    pub fn strategy_for(&self, name: &QualifiedName) -> Option<&ResolutionStrategy> {
        self.per_entity.get(name).or(self.default.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.per_entity.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    Initiated,
    Diffing,
    Clean,
    Conflicted,
    Resolved,
    Committed,
    Failed,
}

/// A merge that stopped with conflicts, waiting for resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMerge {
    pub target_branch: String,
    pub source_branch: String,
    pub base: CommitId,
    pub ours: CommitId,
    pub theirs: CommitId,
    /// Auto-merged tree; conflicted names keep their "ours" entry until resolved
    pub merged: Tree,
    pub conflicts: Vec<Conflict>,
    pub status: MergeStatus,
}

impl PendingMerge {
    pub fn unresolved(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    pub fn conflict(&self, name: &QualifiedName) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| &c.qualified_name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub resolutions: Resolutions,
    pub author: Option<String>,
    pub message: Option<String>,
}

impl MergeOptions {
    pub fn with_resolutions(resolutions: Resolutions) -> Self {
        Self {
            resolutions,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_entity_strategy_overrides_default() {
        let name = QualifiedName::parse("public.users").unwrap();
        let other = QualifiedName::parse("public.orders").unwrap();
        let resolutions = Resolutions::all(ResolutionStrategy::OursWins)
            .with(name.clone(), ResolutionStrategy::TheirsWins);
        assert_eq!(
            resolutions.strategy_for(&name),
            Some(&ResolutionStrategy::TheirsWins)
        );
        assert_eq!(
            resolutions.strategy_for(&other),
            Some(&ResolutionStrategy::OursWins)
        );
        assert!(Resolutions::new().strategy_for(&other).is_none());
    }

    #[test]
    fn test_strategy_names_parse() {
        assert_eq!(
            "ours_wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::OursWins
        );
        assert_eq!(
            "union".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::Union
        );
        assert!("manual".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_conflict_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConflictKind::DeletedVsModified).unwrap(),
            "\"DELETED_VS_MODIFIED\""
        );
    }
}
