use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{EntityKind, ObjectHash, QualifiedName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
    Unchanged,
}

/// Compatibility impact of a change. Ordered by impact, so the severity of
/// a set of changes is their maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Patch,
    Additive,
    Breaking,
}

/// Represents a field-level change inside one definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field_path: Vec<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Classified change of one entity between two trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub qualified_name: QualifiedName,
    pub kind: EntityKind,
    pub change_kind: ChangeKind,
    pub before_hash: Option<ObjectHash>,
    pub after_hash: Option<ObjectHash>,
    pub severity: Severity,
    /// Top-level field changes; empty unless `change_kind` is `Modified`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_changes: Vec<FieldChange>,
}

impl DiffEntry {
    pub fn is_change(&self) -> bool {
        self.change_kind != ChangeKind::Unchanged
    }

    /// Hash the entity has after this change, `None` when removed.
    pub fn resulting_hash(&self) -> Option<&ObjectHash> {
        self.after_hash.as_ref()
    }
}

/// A REMOVED/ADDED pair carrying identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rename {
    pub from: QualifiedName,
    pub to: QualifiedName,
    pub content_hash: ObjectHash,
}

/// Event delivered by the change-detection collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub qualified_name: QualifiedName,
    pub kind: EntityKind,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeEvent {
    pub fn created(qualified_name: QualifiedName, kind: EntityKind, after: Value) -> Self {
        Self {
            qualified_name,
            kind,
            before: None,
            after: Some(after),
        }
    }

    pub fn altered(
        qualified_name: QualifiedName,
        kind: EntityKind,
        before: Value,
        after: Value,
    ) -> Self {
        Self {
            qualified_name,
            kind,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn dropped(qualified_name: QualifiedName, kind: EntityKind, before: Value) -> Self {
        Self {
            qualified_name,
            kind,
            before: Some(before),
            after: None,
        }
    }
}
