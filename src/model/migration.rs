use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{CommitId, EntityKind, QualifiedName, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Alter,
    Drop,
}

impl OperationKind {
    pub fn inverse(self) -> Self {
        match self {
            OperationKind::Create => OperationKind::Drop,
            OperationKind::Drop => OperationKind::Create,
            OperationKind::Alter => OperationKind::Alter,
        }
    }
}

/// One step for a downstream applier. `forward_definition` is the state
/// after the step, `reverse_definition` the state before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_kind: OperationKind,
    pub qualified_name: QualifiedName,
    pub kind: EntityKind,
    pub forward_definition: Option<Value>,
    pub reverse_definition: Option<Value>,
    pub severity: Severity,
}

impl Operation {
    pub fn inverse(&self) -> Self {
        Self {
            operation_kind: self.operation_kind.inverse(),
            qualified_name: self.qualified_name.clone(),
            kind: self.kind,
            forward_definition: self.reverse_definition.clone(),
            reverse_definition: self.forward_definition.clone(),
            severity: self.severity,
        }
    }
}

/// Ordered operations transforming the `from` snapshot into `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationScript {
    pub from: CommitId,
    pub to: CommitId,
    pub operations: Vec<Operation>,
}

impl MigrationScript {
    /// Script undoing this one: every operation inverted, order reversed.
    pub fn rollback(&self) -> MigrationScript {
        MigrationScript {
            from: self.to.clone(),
            to: self.from.clone(),
            operations: self.operations.iter().rev().map(Operation::inverse).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Highest severity among the operations, `None` for an empty script.
    pub fn severity(&self) -> Option<Severity> {
        self.operations.iter().map(|op| op.severity).max()
    }

    /// Stable JSON rendering for handing to an applier.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(kind: OperationKind, name: &str, fwd: Option<Value>, rev: Option<Value>) -> Operation {
        Operation {
            operation_kind: kind,
            qualified_name: QualifiedName::parse(name).unwrap(),
            kind: EntityKind::Table,
            forward_definition: fwd,
            reverse_definition: rev,
            severity: Severity::Additive,
        }
    }

    #[test]
    fn test_rollback_inverts_and_reverses() {
        let script = MigrationScript {
            from: CommitId::from_hex("a"),
            to: CommitId::from_hex("b"),
            operations: vec![
                op(OperationKind::Drop, "s.old", None, Some(json!({"v": 0}))),
                op(OperationKind::Alter, "s.mid", Some(json!({"v": 2})), Some(json!({"v": 1}))),
                op(OperationKind::Create, "s.new", Some(json!({"v": 3})), None),
            ],
        };

        let rollback = script.rollback();
        assert_eq!(rollback.from, script.to);
        let kinds: Vec<_> = rollback.operations.iter().map(|o| o.operation_kind).collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Drop, OperationKind::Alter, OperationKind::Create]
        );
        assert_eq!(rollback.operations[0].qualified_name.as_str(), "s.new");
        assert_eq!(rollback.operations[1].forward_definition, Some(json!({"v": 1})));
        assert_eq!(rollback.operations[2].forward_definition, Some(json!({"v": 0})));
        assert_eq!(rollback.rollback(), script);
    }
}
