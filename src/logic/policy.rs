//! Per-kind rules for severity, additive merging and dependency edges.
//!
//! The classifier, merge engine and migration generator never match on
//! [`EntityKind`] themselves; they ask the [`PolicyRegistry`] for the policy
//! registered for a kind. New kinds register a policy instead of editing
//! those components.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::model::{is_metadata_field, EntityKind, QualifiedName, Severity};

pub trait KindPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Severity of changing a definition from `before` to `after`.
    fn severity(&self, before: &Value, after: &Value) -> Severity;

    fn supports_union(&self) -> bool {
        false
    }

    /// Additively combine two divergent definitions. `None` when the sides
    /// cannot be combined without choosing one over the other.
    fn union(&self, _base: Option<&Value>, _ours: &Value, _theirs: &Value) -> Option<Value> {
        None
    }

    /// Entities this definition must be created after (and dropped before).
    fn dependencies(&self, _name: &QualifiedName, definition: &Value) -> Vec<QualifiedName> {
        depends_on(definition)
    }
}

/// Kind → policy table, built once when the repository is opened.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<EntityKind, Arc<dyn KindPolicy>>,
    fallback: Arc<dyn KindPolicy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PolicyRegistry {
    /// Registry with only the structural fallback.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
            fallback: Arc::new(StructuralPolicy),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(EntityKind::Table, Arc::new(TablePolicy));
        registry.register(EntityKind::Function, Arc::new(FunctionPolicy));
        registry.register(EntityKind::Index, Arc::new(AttachedPolicy));
        registry.register(EntityKind::Trigger, Arc::new(AttachedPolicy));
        registry.register(EntityKind::Type, Arc::new(TypePolicy));
        registry
    }

    /// Register or replace the policy for `kind`.
    pub fn register(&mut self, kind: EntityKind, policy: Arc<dyn KindPolicy>) {
        log::debug!("registered {} policy for {}", policy.name(), kind);
        self.policies.insert(kind, policy);
    }

    pub fn policy_for(&self, kind: EntityKind) -> &dyn KindPolicy {
        self.policies
            .get(&kind)
            .map(|p| p.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Built-in policies

/// Top-level field comparison; used for kinds without a dedicated policy.
#[derive(Debug, Clone, Copy)]
pub struct StructuralPolicy;

impl KindPolicy for StructuralPolicy {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn severity(&self, before: &Value, after: &Value) -> Severity {
        structural_severity(before, after, &[])
    }
}

/// Column-aware rules for tables.
#[derive(Debug, Clone, Copy)]
pub struct TablePolicy;

impl KindPolicy for TablePolicy {
    fn name(&self) -> &'static str {
        "table"
    }

    fn severity(&self, before: &Value, after: &Value) -> Severity {
        let fields = structural_severity(before, after, &["columns"]);
        let columns = match (named_items(before, "columns"), named_items(after, "columns")) {
            (Some(old), Some(new)) => column_severity(old, new),
            // Unnamed columns cannot be matched up; compare the raw lists.
            _ => structural_severity(
                before.get("columns").unwrap_or(&Value::Null),
                after.get("columns").unwrap_or(&Value::Null),
                &[],
            ),
        };
        fields.max(columns)
    }

    fn supports_union(&self) -> bool {
        true
    }

    fn union(&self, base: Option<&Value>, ours: &Value, theirs: &Value) -> Option<Value> {
        let mut merged = merge_fields(base, ours, theirs, &["columns"])?;
        let base_columns = match base {
            Some(b) => Some(named_items(b, "columns")?),
            None => None,
        };
        let columns = merge_named_items(
            base_columns,
            named_items(ours, "columns")?,
            named_items(theirs, "columns")?,
        )?;
        if !columns.is_empty() {
            merged.insert("columns".to_string(), Value::Array(columns));
        }
        Some(Value::Object(merged))
    }

    fn dependencies(&self, _name: &QualifiedName, definition: &Value) -> Vec<QualifiedName> {
        let mut deps: BTreeSet<QualifiedName> = depends_on(definition).into_iter().collect();
        for (_, column) in named_items(definition, "columns").unwrap_or_default() {
            let target = match column.get("references") {
                Some(Value::String(table)) => Some(table.as_str()),
                Some(Value::Object(fk)) => fk.get("table").and_then(Value::as_str),
                _ => None,
            };
            if let Some(qn) = target.and_then(|t| QualifiedName::parse(t).ok()) {
                deps.insert(qn);
            }
        }
        deps.into_iter().collect()
    }
}

/// Signature-aware rules for functions: the body is an implementation
/// detail, the argument list and return type are the contract.
#[derive(Debug, Clone, Copy)]
pub struct FunctionPolicy;

impl KindPolicy for FunctionPolicy {
    fn name(&self) -> &'static str {
        "function"
    }

    fn severity(&self, before: &Value, after: &Value) -> Severity {
        let mut severity = structural_severity(before, after, &["arguments", "returns", "body"]);

        if before.get("returns") != after.get("returns") {
            return Severity::Breaking;
        }

        let old_args = array_field(before, "arguments");
        let new_args = array_field(after, "arguments");
        if old_args != new_args {
            let appended_optional = new_args.len() > old_args.len()
                && new_args[..old_args.len()] == old_args[..]
                && new_args[old_args.len()..]
                    .iter()
                    .all(|arg| arg.get("default").is_some());
            if !appended_optional {
                return Severity::Breaking;
            }
            severity = severity.max(Severity::Additive);
        }

        severity
    }
}

/// Indexes and triggers: attached to a table named by their `table` field.
#[derive(Debug, Clone, Copy)]
pub struct AttachedPolicy;

impl KindPolicy for AttachedPolicy {
    fn name(&self) -> &'static str {
        "attached"
    }

    fn severity(&self, before: &Value, after: &Value) -> Severity {
        structural_severity(before, after, &[])
    }

    fn dependencies(&self, _name: &QualifiedName, definition: &Value) -> Vec<QualifiedName> {
        let mut deps: BTreeSet<QualifiedName> = depends_on(definition).into_iter().collect();
        if let Some(table) = definition
            .get("table")
            .and_then(Value::as_str)
            .and_then(|t| QualifiedName::parse(t).ok())
        {
            deps.insert(table);
        }
        deps.into_iter().collect()
    }
}

/// Enumerated types: appending a value is additive, removing or reordering
/// one is breaking.
#[derive(Debug, Clone, Copy)]
pub struct TypePolicy;

impl KindPolicy for TypePolicy {
    fn name(&self) -> &'static str {
        "type"
    }

    fn severity(&self, before: &Value, after: &Value) -> Severity {
        let fields = structural_severity(before, after, &["values"]);
        let old = array_field(before, "values");
        let new = array_field(after, "values");
        let values = if old == new {
            Severity::Patch
        } else if new.len() > old.len() && new[..old.len()] == old[..] {
            Severity::Additive
        } else {
            Severity::Breaking
        };
        fields.max(values)
    }

    fn supports_union(&self) -> bool {
        true
    }

    fn union(&self, base: Option<&Value>, ours: &Value, theirs: &Value) -> Option<Value> {
        let mut merged = merge_fields(base, ours, theirs, &["values"])?;
        let base_values = base.map(|b| array_field(b, "values")).unwrap_or_default();
        let ours_values = array_field(ours, "values");
        let theirs_values = array_field(theirs, "values");

        let removed_by_theirs =
            |v: &Value| base_values.contains(v) && !theirs_values.contains(v);
        let mut values: Vec<Value> = ours_values
            .iter()
            .filter(|v| !removed_by_theirs(*v))
            .cloned()
            .collect();
        for value in &theirs_values {
            if !values.contains(value) && !base_values.contains(value) {
                values.push(value.clone());
            }
        }
        if !values.is_empty() {
            merged.insert("values".to_string(), Value::Array(values));
        }
        Some(Value::Object(merged))
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the policies

/// Worst-case severity over the top-level fields of two definitions,
/// ignoring `skip`. Metadata-only changes are patches.
pub fn structural_severity(before: &Value, after: &Value, skip: &[&str]) -> Severity {
    let (Some(old), Some(new)) = (before.as_object(), after.as_object()) else {
        return if before == after {
            Severity::Patch
        } else {
            Severity::Breaking
        };
    };

    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|key| !skip.contains(&key.as_str()))
        .map(|key| {
            if is_metadata_field(key) {
                return Severity::Patch;
            }
            match (old.get(key.as_str()), new.get(key.as_str())) {
                (Some(a), Some(b)) if a == b => Severity::Patch,
                (Some(_), Some(_)) => Severity::Breaking,
                (Some(_), None) => Severity::Breaking,
                (None, Some(_)) => Severity::Additive,
                (None, None) => Severity::Patch,
            }
        })
        .max()
        .unwrap_or(Severity::Patch)
}

fn column_severity(old: Vec<(String, Value)>, new: Vec<(String, Value)>) -> Severity {
    let old_map: HashMap<&str, &Value> = old.iter().map(|(n, c)| (n.as_str(), c)).collect();
    let new_map: HashMap<&str, &Value> = new.iter().map(|(n, c)| (n.as_str(), c)).collect();
    let mut severity = Severity::Patch;

    for (name, column) in &old_map {
        match new_map.get(name) {
            None => return Severity::Breaking,
            Some(after) => severity = severity.max(single_column_severity(column, after)),
        }
    }
    for (name, column) in &new_map {
        if !old_map.contains_key(name) {
            if is_nullable(column) || column.get("default").is_some() {
                severity = severity.max(Severity::Additive);
            } else {
                return Severity::Breaking;
            }
        }
    }
    severity
}

fn single_column_severity(before: &Value, after: &Value) -> Severity {
    if before == after {
        return Severity::Patch;
    }
    if before.get("type") != after.get("type") {
        return Severity::Breaking;
    }
    let nullability = match (is_nullable(before), is_nullable(after)) {
        (true, false) => return Severity::Breaking,
        (false, true) => Severity::Additive,
        _ => Severity::Patch,
    };
    let rest = structural_severity(before, after, &["type", "nullable", "not_null", "default"]);
    nullability.max(rest)
}

/// Columns are nullable unless declared otherwise.
fn is_nullable(column: &Value) -> bool {
    if let Some(nullable) = column.get("nullable").and_then(Value::as_bool) {
        return nullable;
    }
    !column
        .get("not_null")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn array_field(definition: &Value, field: &str) -> Vec<Value> {
    definition
        .get(field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// `(name, item)` pairs of an array of objects keyed by their `name`
/// member, in declaration order. `None` when the field is not such an array
/// (an item without a string name, a repeated name, or a non-array value);
/// an absent field is an empty list.
fn named_items(definition: &Value, field: &str) -> Option<Vec<(String, Value)>> {
    let items = match definition.get(field) {
        None | Some(Value::Null) => return Some(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return None,
    };
    let mut seen = BTreeSet::new();
    items
        .iter()
        .map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            seen.insert(name.clone()).then(|| (name, item.clone()))
        })
        .collect()
}

/// Names listed in a definition's `depends_on` array.
pub fn depends_on(definition: &Value) -> Vec<QualifiedName> {
    let mut deps: Vec<QualifiedName> = array_field(definition, "depends_on")
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|raw| QualifiedName::parse(raw).ok())
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

/// Three-way pick for one value: unchanged sides defer to the changed side;
/// two different changes cannot be combined.
fn pick<'a>(base: Option<&'a Value>, ours: Option<&'a Value>, theirs: Option<&'a Value>) -> Option<Option<&'a Value>> {
    if ours == theirs {
        Some(ours)
    } else if ours == base {
        Some(theirs)
    } else if theirs == base {
        Some(ours)
    } else {
        None
    }
}

/// Three-way merge of top-level object members, excluding `skip`.
fn merge_fields(
    base: Option<&Value>,
    ours: &Value,
    theirs: &Value,
    skip: &[&str],
) -> Option<Map<String, Value>> {
    let empty = Map::new();
    let base_map = base.and_then(Value::as_object).unwrap_or(&empty);
    let ours_map = ours.as_object()?;
    let theirs_map = theirs.as_object()?;

    let keys: BTreeSet<&String> = base_map
        .keys()
        .chain(ours_map.keys())
        .chain(theirs_map.keys())
        .filter(|k| !skip.contains(&k.as_str()))
        .collect();

    let mut merged = Map::new();
    for key in keys {
        let chosen = pick(base_map.get(key), ours_map.get(key), theirs_map.get(key))?;
        if let Some(value) = chosen {
            merged.insert(key.clone(), value.clone());
        }
    }
    Some(merged)
}

/// Three-way merge of name-keyed items. Keeps ours' order, then appends
/// items only theirs introduced.
fn merge_named_items(
    base: Option<Vec<(String, Value)>>,
    ours: Vec<(String, Value)>,
    theirs: Vec<(String, Value)>,
) -> Option<Vec<Value>> {
    let base = base.unwrap_or_default();
    let lookup = |items: &[(String, Value)], name: &str| -> Option<Value> {
        items.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
    };

    let mut order: Vec<String> = ours.iter().map(|(n, _)| n.clone()).collect();
    for (name, _) in &theirs {
        if !order.contains(name) {
            order.push(name.clone());
        }
    }

    let mut merged = Vec::new();
    for name in order {
        let b = lookup(&base, &name);
        let o = lookup(&ours, &name);
        let t = lookup(&theirs, &name);
        if let Some(value) = pick(b.as_ref(), o.as_ref(), t.as_ref())? {
            merged.push(value.clone());
        }
    }
    Some(merged)
}
