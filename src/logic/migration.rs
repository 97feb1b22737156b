use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, VcsError};
use crate::logic::classify::ChangeClassifier;
use crate::logic::graph::CommitGraph;
use crate::model::{
    Blob, ChangeKind, CommitId, EntityKind, MigrationScript, Operation, OperationKind, QualifiedName,
    Severity, Tree,
};
use crate::store::{ObjectStoreExt, Store};

/// Builds ordered, reversible migration scripts between two snapshots.
#[derive(Debug, Clone)]
pub struct MigrationGenerator {
    classifier: ChangeClassifier,
}

impl MigrationGenerator {
    pub fn new(classifier: ChangeClassifier) -> Self {
        Self { classifier }
    }

    pub fn generate<S: Store + ?Sized>(
        &self,
        store: &S,
        from: &CommitId,
        to: &CommitId,
    ) -> Result<MigrationScript> {
        let from_tree = store.get_tree(CommitGraph::get_commit(store, from)?.tree_hash())?;
        let to_tree = store.get_tree(CommitGraph::get_commit(store, to)?.tree_hash())?;
        self.generate_between(store, &from_tree, &to_tree, from, to)
    }

    /// Script turning `from_tree` into `to_tree`.
    ///
    /// Creates and alters follow the entities they depend on (in the target
    /// snapshot); drops come after everything that depended on the dropped
    /// entity (in the source snapshot) has been dropped or altered. Within a
    /// dependency tier, drops come first, then alters, then creates, each by
    /// qualified name.
    pub fn generate_between<S: ObjectStoreExt + ?Sized>(
        &self,
        store: &S,
        from_tree: &Tree,
        to_tree: &Tree,
        from: &CommitId,
        to: &CommitId,
    ) -> Result<MigrationScript> {
        let mut operations = Vec::new();
        for entry in self.classifier.diff_trees(store, from_tree, to_tree, false)? {
            let before = match &entry.before_hash {
                Some(hash) => Some(store.get_blob(hash)?),
                None => None,
            };
            let after = match &entry.after_hash {
                Some(hash) => Some(store.get_blob(hash)?),
                None => None,
            };
            let name = entry.qualified_name.clone();

            match (entry.change_kind, before, after) {
                (ChangeKind::Added, _, Some(after)) => operations.push(Operation {
                    operation_kind: OperationKind::Create,
                    qualified_name: name,
                    kind: after.kind,
                    forward_definition: Some(after.definition),
                    reverse_definition: None,
                    severity: entry.severity,
                }),
                (ChangeKind::Removed, Some(before), _) => operations.push(Operation {
                    operation_kind: OperationKind::Drop,
                    qualified_name: name,
                    kind: before.kind,
                    forward_definition: None,
                    reverse_definition: Some(before.definition),
                    severity: entry.severity,
                }),
                // A kind change cannot be altered in place.
                (ChangeKind::Modified, Some(before), Some(after)) if before.kind != after.kind => {
                    operations.push(Operation {
                        operation_kind: OperationKind::Drop,
                        qualified_name: name.clone(),
                        kind: before.kind,
                        forward_definition: None,
                        reverse_definition: Some(before.definition),
                        severity: Severity::Breaking,
                    });
                    operations.push(Operation {
                        operation_kind: OperationKind::Create,
                        qualified_name: name,
                        kind: after.kind,
                        forward_definition: Some(after.definition),
                        reverse_definition: None,
                        severity: Severity::Breaking,
                    });
                }
                (ChangeKind::Modified, Some(before), Some(after)) => operations.push(Operation {
                    operation_kind: OperationKind::Alter,
                    qualified_name: name,
                    kind: after.kind,
                    forward_definition: Some(after.definition),
                    reverse_definition: Some(before.definition),
                    severity: entry.severity,
                }),
                (change_kind, _, _) => {
                    return Err(VcsError::Corrupt(format!(
                        "diff entry for '{}' is {:?} without matching definitions",
                        name, change_kind
                    )))
                }
            }
        }

        let operations = self.order(operations);
        log::debug!(
            "migration {} -> {}: {} operation(s)",
            from.short(),
            to.short(),
            operations.len()
        );
        Ok(MigrationScript {
            from: from.clone(),
            to: to.clone(),
            operations,
        })
    }

    fn dependencies(
        &self,
        op: &Operation,
        definition: &Value,
        namespaces: &HashMap<&str, &QualifiedName>,
    ) -> Vec<QualifiedName> {
        let mut deps = self
            .classifier
            .registry()
            .policy_for(op.kind)
            .dependencies(&op.qualified_name, definition);
        if op.kind != EntityKind::Namespace {
            if let Some(namespace) = namespaces.get(op.qualified_name.namespace()) {
                deps.push((*namespace).clone());
            }
        }
        deps
    }

    /// Kahn's algorithm, one tier at a time.
    fn order(&self, operations: Vec<Operation>) -> Vec<Operation> {
        // A namespace entity `x.public` defines the namespace `public`.
        let namespaces: HashMap<&str, &QualifiedName> = operations
            .iter()
            .filter(|op| op.kind == EntityKind::Namespace)
            .map(|op| (op.qualified_name.name(), &op.qualified_name))
            .collect();

        let mut upserts: HashMap<&QualifiedName, usize> = HashMap::new();
        let mut drops: HashMap<&QualifiedName, usize> = HashMap::new();
        for (i, op) in operations.iter().enumerate() {
            match op.operation_kind {
                OperationKind::Drop => drops.insert(&op.qualified_name, i),
                _ => upserts.insert(&op.qualified_name, i),
            };
        }

        // preds[i]: operations that must run before i
        let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); operations.len()];
        for (i, op) in operations.iter().enumerate() {
            if let Some(forward) = &op.forward_definition {
                for dep in self.dependencies(op, forward, &namespaces) {
                    if let Some(&j) = upserts.get(&dep) {
                        if j != i {
                            preds[i].insert(j);
                        }
                    }
                }
                if let Some(&j) = drops.get(&op.qualified_name) {
                    preds[i].insert(j);
                }
            }
            if let Some(reverse) = &op.reverse_definition {
                for dep in self.dependencies(op, reverse, &namespaces) {
                    if let Some(&j) = drops.get(&dep) {
                        if j != i {
                            preds[j].insert(i);
                        }
                    }
                }
            }
        }

        let sort_key = |i: &usize| {
            let op = &operations[*i];
            let phase = match op.operation_kind {
                OperationKind::Drop => 0,
                OperationKind::Alter => 1,
                OperationKind::Create => 2,
            };
            (phase, op.qualified_name.clone())
        };

        let mut placed = vec![false; operations.len()];
        let mut order: Vec<usize> = Vec::with_capacity(operations.len());
        loop {
            let mut tier: Vec<usize> = (0..operations.len())
                .filter(|i| !placed[*i] && preds[*i].iter().all(|p| placed[*p]))
                .collect();
            if tier.is_empty() {
                break;
            }
            tier.sort_by_key(sort_key);
            for i in &tier {
                placed[*i] = true;
            }
            order.extend(tier);
        }

        if order.len() < operations.len() {
            let mut cyclic: Vec<usize> = (0..operations.len()).filter(|i| !placed[*i]).collect();
            cyclic.sort_by_key(sort_key);
            log::warn!(
                "dependency cycle among {} migration step(s); ordering them by name: {}",
                cyclic.len(),
                cyclic
                    .iter()
                    .map(|i| operations[*i].qualified_name.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            order.extend(cyclic);
        }

        let mut slots: Vec<Option<Operation>> = operations.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect()
    }
}

impl MigrationScript {
    /// Reference applier: run the script against a tree, writing any new
    /// definitions to the store. Each step must match the tree it meets.
    pub fn apply<S: ObjectStoreExt + ?Sized>(&self, store: &S, tree: &Tree) -> Result<Tree> {
        let mut current = tree.clone();
        for op in &self.operations {
            let name = &op.qualified_name;
            let mismatch = |reason: &str| VcsError::MigrationMismatch {
                qualified_name: name.clone(),
                reason: reason.to_string(),
            };
            match op.operation_kind {
                OperationKind::Create if current.contains(name) => {
                    return Err(mismatch("already exists"))
                }
                OperationKind::Create => {}
                OperationKind::Alter | OperationKind::Drop => {
                    let found = current.get(name).ok_or_else(|| mismatch("not present"))?;
                    let expected = op
                        .reverse_definition
                        .as_ref()
                        .map(|definition| Blob::new(op.kind, definition).hash())
                        .ok_or_else(|| mismatch("no prior definition recorded"))?;
                    if *found != expected {
                        return Err(mismatch("current definition differs from the expected one"));
                    }
                }
            }

            match &op.forward_definition {
                Some(definition) => {
                    let hash = store.put_entity(op.kind, definition)?;
                    current.insert(name.clone(), hash);
                }
                None => current.remove(name),
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::PolicyRegistry;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn qn(raw: &str) -> QualifiedName {
        QualifiedName::parse(raw).unwrap()
    }

    fn generator() -> MigrationGenerator {
        MigrationGenerator::new(ChangeClassifier::new(Arc::new(PolicyRegistry::with_defaults())))
    }

    fn script(store: &MemoryStore, from: &Tree, to: &Tree) -> MigrationScript {
        generator()
            .generate_between(store, from, to, &CommitId::from_hex("aa"), &CommitId::from_hex("bb"))
            .unwrap()
    }

    fn steps(script: &MigrationScript) -> Vec<(OperationKind, String)> {
        script
            .operations
            .iter()
            .map(|op| (op.operation_kind, op.qualified_name.to_string()))
            .collect()
    }

    #[test]
    fn test_creates_follow_dependencies() {
        let store = MemoryStore::new();
        let users = store
            .put_entity(EntityKind::Table, &json!({"columns": [{"name": "id"}]}))
            .unwrap();
        let index = store
            .put_entity(
                EntityKind::Index,
                &json!({"table": "app.users", "columns": ["id"]}),
            )
            .unwrap();
        let ns = store.put_entity(EntityKind::Namespace, &json!({})).unwrap();
        let to = Tree::from_entries(vec![
            (qn("app.a_users_idx"), index),
            (qn("app.users"), users),
            (qn("db.app"), ns),
        ]);

        let script = script(&store, &Tree::new(), &to);
        assert_eq!(
            steps(&script),
            vec![
                (OperationKind::Create, "db.app".to_string()),
                (OperationKind::Create, "app.users".to_string()),
                (OperationKind::Create, "app.a_users_idx".to_string()),
            ]
        );
    }

    #[test]
    fn test_drops_run_dependents_first_and_rollback_restores() {
        let store = MemoryStore::new();
        let users = store
            .put_entity(EntityKind::Table, &json!({"columns": [{"name": "id"}]}))
            .unwrap();
        let trigger = store
            .put_entity(EntityKind::Trigger, &json!({"table": "app.users", "function": "audit"}))
            .unwrap();
        let from = Tree::from_entries(vec![(qn("app.users"), users), (qn("app.audit"), trigger)]);

        let script = script(&store, &from, &Tree::new());
        assert_eq!(
            steps(&script),
            vec![
                (OperationKind::Drop, "app.audit".to_string()),
                (OperationKind::Drop, "app.users".to_string()),
            ]
        );

        let emptied = script.apply(&store, &from).unwrap();
        assert!(emptied.is_empty());
        let restored = script.rollback().apply(&store, &emptied).unwrap();
        assert_eq!(restored.hash(), from.hash());
    }

    #[test]
    fn test_kind_change_is_drop_then_create() {
        let store = MemoryStore::new();
        let as_table = store.put_entity(EntityKind::Table, &json!({"columns": []})).unwrap();
        let as_view = store
            .put_entity(EntityKind::View, &json!({"query": "select 1"}))
            .unwrap();
        let from = Tree::from_entries(vec![(qn("app.thing"), as_table)]);
        let to = Tree::from_entries(vec![(qn("app.thing"), as_view)]);

        let script = script(&store, &from, &to);
        assert_eq!(
            steps(&script),
            vec![
                (OperationKind::Drop, "app.thing".to_string()),
                (OperationKind::Create, "app.thing".to_string()),
            ]
        );
        assert_eq!(script.apply(&store, &from).unwrap().hash(), to.hash());
    }

    #[test]
    fn test_cycle_falls_back_to_name_order() {
        let store = MemoryStore::new();
        let a = store
            .put_entity(EntityKind::View, &json!({"query": "q", "depends_on": ["s.b"]}))
            .unwrap();
        let b = store
            .put_entity(EntityKind::View, &json!({"query": "q", "depends_on": ["s.a"]}))
            .unwrap();
        let to = Tree::from_entries(vec![(qn("s.b"), b), (qn("s.a"), a)]);

        let script = script(&store, &Tree::new(), &to);
        assert_eq!(
            steps(&script),
            vec![
                (OperationKind::Create, "s.a".to_string()),
                (OperationKind::Create, "s.b".to_string()),
            ]
        );
    }

    #[test]
    fn test_identical_snapshots_give_empty_script() {
        let store = MemoryStore::new();
        let t = store.put_entity(EntityKind::Table, &json!({"columns": []})).unwrap();
        let tree = Tree::from_entries(vec![(qn("s.t"), t)]);
        assert!(script(&store, &tree, &tree).is_empty());
    }

    #[test]
    fn test_apply_rejects_mismatched_tree() {
        let store = MemoryStore::new();
        let t = store.put_entity(EntityKind::Table, &json!({"columns": []})).unwrap();
        let tree = Tree::from_entries(vec![(qn("s.t"), t)]);
        let drop_all = script(&store, &tree, &Tree::new());
        assert!(matches!(
            drop_all.apply(&store, &Tree::new()),
            Err(VcsError::MigrationMismatch { .. })
        ));
    }

    #[test]
    fn test_apply_rejects_alter_over_foreign_definition() {
        let store = MemoryStore::new();
        let view = |q: &str| {
            store
                .put_entity(EntityKind::View, &json!({ "query": q }))
                .unwrap()
        };
        let from = Tree::from_entries(vec![(qn("s.v"), view("select 1"))]);
        let to = Tree::from_entries(vec![(qn("s.v"), view("select 2"))]);
        let alter = script(&store, &from, &to);
        assert_eq!(alter.operations[0].operation_kind, OperationKind::Alter);

        let foreign = Tree::from_entries(vec![(qn("s.v"), view("unrelated"))]);
        assert!(matches!(
            alter.apply(&store, &foreign),
            Err(VcsError::MigrationMismatch { .. })
        ));
        // the same check guards drops
        let drop = script(&store, &from, &Tree::new());
        assert!(matches!(
            drop.apply(&store, &foreign),
            Err(VcsError::MigrationMismatch { .. })
        ));
        assert_eq!(alter.apply(&store, &from).unwrap().hash(), to.hash());
    }
}
