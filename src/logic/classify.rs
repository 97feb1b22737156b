use itertools::{EitherOrBoth, Itertools};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Result;
use crate::logic::policy::PolicyRegistry;
use crate::model::{
    Blob, ChangeEvent, ChangeKind, DiffEntry, Entity, FieldChange, ObjectHash, QualifiedName,
    Rename, Severity, Tree,
};
use crate::store::ObjectStoreExt;

/// Turns before/after pairs into classified [`DiffEntry`] values, delegating
/// severity to the policy registered for the entity kind.
#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    registry: Arc<PolicyRegistry>,
}

impl ChangeClassifier {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Classify one entity change. `None` when both sides are absent.
    pub fn classify(&self, before: Option<&Entity>, after: Option<&Entity>) -> Option<DiffEntry> {
        let entry = match (before, after) {
            (None, None) => return None,
            (None, Some(after)) => DiffEntry {
                qualified_name: after.qualified_name.clone(),
                kind: after.kind,
                change_kind: ChangeKind::Added,
                before_hash: None,
                after_hash: Some(after.content_hash.clone()),
                severity: Severity::Additive,
                field_changes: Vec::new(),
            },
            (Some(before), None) => DiffEntry {
                qualified_name: before.qualified_name.clone(),
                kind: before.kind,
                change_kind: ChangeKind::Removed,
                before_hash: Some(before.content_hash.clone()),
                after_hash: None,
                severity: Severity::Breaking,
                field_changes: Vec::new(),
            },
            (Some(before), Some(after)) if before.content_hash == after.content_hash => DiffEntry {
                qualified_name: after.qualified_name.clone(),
                kind: after.kind,
                change_kind: ChangeKind::Unchanged,
                before_hash: Some(before.content_hash.clone()),
                after_hash: Some(after.content_hash.clone()),
                severity: Severity::Patch,
                field_changes: Vec::new(),
            },
            (Some(before), Some(after)) => {
                let severity = if before.kind != after.kind {
                    Severity::Breaking
                } else {
                    self.registry
                        .policy_for(after.kind)
                        .severity(&before.definition, &after.definition)
                };
                DiffEntry {
                    qualified_name: after.qualified_name.clone(),
                    kind: after.kind,
                    change_kind: ChangeKind::Modified,
                    before_hash: Some(before.content_hash.clone()),
                    after_hash: Some(after.content_hash.clone()),
                    severity,
                    field_changes: field_changes(&before.definition, &after.definition),
                }
            }
        };
        Some(entry)
    }

    /// Classify an event from the change-detection collaborator. Identical
    /// events always yield identical entries.
    pub fn classify_event(&self, event: &ChangeEvent) -> Option<DiffEntry> {
        let to_entity = |definition: &Value| {
            let blob = Blob::new(event.kind, definition);
            let hash = blob.hash();
            Entity::from_blob(event.qualified_name.clone(), hash, blob)
        };
        let before = event.before.as_ref().map(to_entity);
        let after = event.after.as_ref().map(to_entity);
        self.classify(before.as_ref(), after.as_ref())
    }

    /// Diff two trees, ordered by qualified name. Unchanged entries are only
    /// reported when `include_unchanged` is set.
    pub fn diff_trees<S: ObjectStoreExt + ?Sized>(
        &self,
        store: &S,
        from: &Tree,
        to: &Tree,
        include_unchanged: bool,
    ) -> Result<Vec<DiffEntry>> {
        let mut entries = Vec::new();

        for pair in from
            .entries()
            .iter()
            .merge_join_by(to.entries().iter(), |a, b| a.0.cmp(b.0))
        {
            let entry = match pair {
                EitherOrBoth::Left((name, hash)) => {
                    let before = load(store, name, hash)?;
                    self.classify(Some(&before), None)
                }
                EitherOrBoth::Right((name, hash)) => {
                    let after = load(store, name, hash)?;
                    self.classify(None, Some(&after))
                }
                EitherOrBoth::Both((name, old), (_, new)) => {
                    if old == new && !include_unchanged {
                        continue;
                    }
                    let before = load(store, name, old)?;
                    let after = if old == new {
                        before.clone()
                    } else {
                        load(store, name, new)?
                    };
                    self.classify(Some(&before), Some(&after))
                }
            };
            entries.extend(entry);
        }

        Ok(entries)
    }
}

fn load<S: ObjectStoreExt + ?Sized>(
    store: &S,
    name: &QualifiedName,
    hash: &ObjectHash,
) -> Result<Entity> {
    let blob = store.get_blob(hash)?;
    Ok(Entity::from_blob(name.clone(), hash.clone(), blob))
}

/// Top-level field differences between two definitions.
pub fn field_changes(before: &Value, after: &Value) -> Vec<FieldChange> {
    let (Some(old), Some(new)) = (before.as_object(), after.as_object()) else {
        if before == after {
            return Vec::new();
        }
        return vec![FieldChange {
            field_path: Vec::new(),
            old_value: Some(before.clone()),
            new_value: Some(after.clone()),
        }];
    };

    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old_value = old.get(key.as_str());
            let new_value = new.get(key.as_str());
            if old_value == new_value {
                return None;
            }
            Some(FieldChange {
                field_path: vec![key.clone()],
                old_value: old_value.cloned(),
                new_value: new_value.cloned(),
            })
        })
        .collect()
}

/// Pair REMOVED and ADDED entries that carry identical content. Pairing is
/// one-to-one in name order, so the result is deterministic.
pub fn detect_renames(entries: &[DiffEntry]) -> Vec<Rename> {
    let mut removed: BTreeMap<&ObjectHash, Vec<&QualifiedName>> = BTreeMap::new();
    let mut added: BTreeMap<&ObjectHash, Vec<&QualifiedName>> = BTreeMap::new();

    for entry in entries {
        match (entry.change_kind, &entry.before_hash, &entry.after_hash) {
            (ChangeKind::Removed, Some(hash), _) => {
                removed.entry(hash).or_default().push(&entry.qualified_name)
            }
            (ChangeKind::Added, _, Some(hash)) => {
                added.entry(hash).or_default().push(&entry.qualified_name)
            }
            _ => {}
        }
    }

    let mut renames = Vec::new();
    for (hash, mut from_names) in removed {
        let Some(mut to_names) = added.remove(hash) else {
            continue;
        };
        from_names.sort();
        to_names.sort();
        for (from, to) in from_names.into_iter().zip(to_names) {
            renames.push(Rename {
                from: from.clone(),
                to: to.clone(),
                content_hash: hash.clone(),
            });
        }
    }
    renames.sort_by(|a, b| a.from.cmp(&b.from));
    renames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn classifier() -> ChangeClassifier {
        ChangeClassifier::new(Arc::new(PolicyRegistry::with_defaults()))
    }

    fn qn(raw: &str) -> QualifiedName {
        QualifiedName::parse(raw).unwrap()
    }

    fn entity(name: &str, kind: EntityKind, def: Value) -> Entity {
        let blob = Blob::new(kind, &def);
        let hash = blob.hash();
        Entity::from_blob(qn(name), hash, blob)
    }

    #[test]
    fn test_added_removed_unchanged() {
        let c = classifier();
        let t = entity("public.t", EntityKind::Table, json!({"columns": []}));

        assert_eq!(c.classify(None, Some(&t)).unwrap().change_kind, ChangeKind::Added);
        assert_eq!(c.classify(Some(&t), None).unwrap().change_kind, ChangeKind::Removed);
        let same = c.classify(Some(&t), Some(&t)).unwrap();
        assert_eq!(same.change_kind, ChangeKind::Unchanged);
        assert!(same.field_changes.is_empty());
        assert!(c.classify(None, None).is_none());
    }

    #[test]
    fn test_modified_uses_kind_policy() {
        let c = classifier();
        let before = entity("public.t", EntityKind::Table, json!({"columns": [{"name": "id", "type": "int"}]}));
        let after = entity(
            "public.t",
            EntityKind::Table,
            json!({"columns": [{"name": "id", "type": "int"}, {"name": "note", "type": "text"}]}),
        );
        let entry = c.classify(Some(&before), Some(&after)).unwrap();
        assert_eq!(entry.change_kind, ChangeKind::Modified);
        assert_eq!(entry.severity, Severity::Additive);
        assert_eq!(entry.field_changes.len(), 1);
        assert_eq!(entry.field_changes[0].field_path, vec!["columns".to_string()]);
    }

    #[test]
    fn test_kind_change_is_breaking() {
        let c = classifier();
        let before = entity("public.v", EntityKind::View, json!({"query": "select 1"}));
        let after = entity("public.v", EntityKind::Table, json!({"columns": []}));
        assert_eq!(c.classify(Some(&before), Some(&after)).unwrap().severity, Severity::Breaking);
    }

    #[test]
    fn test_duplicate_events_classify_identically() {
        let c = classifier();
        let event = ChangeEvent::altered(
            qn("public.f"),
            EntityKind::Function,
            json!({"returns": "int", "body": "select 1"}),
            json!({"returns": "int", "body": "select  2"}),
        );
        let first = c.classify_event(&event).unwrap();
        let second = c.classify_event(&event).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.severity, Severity::Patch);
    }

    #[test]
    fn test_diff_trees_is_name_ordered() {
        let store = MemoryStore::new();
        let c = classifier();
        let h_a = store.put_entity(EntityKind::Table, &json!({"columns": []})).unwrap();
        let h_b = store.put_entity(EntityKind::View, &json!({"query": "select 1"})).unwrap();
        let h_b2 = store.put_entity(EntityKind::View, &json!({"query": "select 2"})).unwrap();
        let h_c = store.put_entity(EntityKind::Sequence, &json!({"start": 1})).unwrap();

        let from = Tree::from_entries(vec![(qn("s.a"), h_a.clone()), (qn("s.b"), h_b), (qn("s.d"), h_a)]);
        let to = Tree::from_entries(vec![(qn("s.b"), h_b2), (qn("s.c"), h_c), (qn("s.d"), from.get(&qn("s.d")).unwrap().clone())]);

        let diff = c.diff_trees(&store, &from, &to, false).unwrap();
        let summary: Vec<_> = diff
            .iter()
            .map(|e| (e.qualified_name.as_str().to_string(), e.change_kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("s.a".to_string(), ChangeKind::Removed),
                ("s.b".to_string(), ChangeKind::Modified),
                ("s.c".to_string(), ChangeKind::Added),
            ]
        );

        let with_unchanged = c.diff_trees(&store, &from, &to, true).unwrap();
        assert_eq!(with_unchanged.len(), 4);
        assert_eq!(with_unchanged[3].change_kind, ChangeKind::Unchanged);
    }

    #[test]
    fn test_rename_detection_pairs_identical_hashes() {
        let c = classifier();
        let old = entity("public.users", EntityKind::Table, json!({"columns": [{"name": "id"}]}));
        let new = entity("public.accounts", EntityKind::Table, json!({"columns": [{"name": "id"}]}));
        let other = entity("public.audit", EntityKind::Table, json!({"columns": [{"name": "at"}]}));

        let entries = vec![
            c.classify(None, Some(&new)).unwrap(),
            c.classify(None, Some(&other)).unwrap(),
            c.classify(Some(&old), None).unwrap(),
        ];
        let renames = detect_renames(&entries);
        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].from, qn("public.users"));
        assert_eq!(renames[0].to, qn("public.accounts"));
    }

    #[test]
    fn test_field_changes_report_each_top_level_key() {
        let changes = field_changes(
            &json!({"a": 1, "b": 2, "c": 3}),
            &json!({"a": 1, "b": 20, "d": 4}),
        );
        let paths: Vec<_> = changes.iter().map(|c| c.field_path[0].as_str()).collect();
        assert_eq!(paths, vec!["b", "c", "d"]);
    }
}
