use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::model::{ObjectHash, QualifiedName};

/// Kinds of tracked definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Namespace,
    Table,
    View,
    Function,
    Index,
    Sequence,
    Trigger,
    Type,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Namespace,
        EntityKind::Table,
        EntityKind::View,
        EntityKind::Function,
        EntityKind::Index,
        EntityKind::Sequence,
        EntityKind::Trigger,
        EntityKind::Type,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Namespace => "namespace",
            EntityKind::Table => "table",
            EntityKind::View => "view",
            EntityKind::Function => "function",
            EntityKind::Index => "index",
            EntityKind::Sequence => "sequence",
            EntityKind::Trigger => "trigger",
            EntityKind::Type => "type",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-text fields whose whitespace is not significant.
pub const NORMALIZED_TEXT_FIELDS: &[&str] = &["body", "expression", "query"];

/// Fields that never change the meaning of a definition.
pub const METADATA_FIELDS: &[&str] = &[
    "comment",
    "description",
    "owner",
    "created_at",
    "updated_at",
    "created_by",
    "updated_by",
];

pub fn is_metadata_field(field: &str) -> bool {
    METADATA_FIELDS.contains(&field)
}

/// Immutable stored form of an entity: its kind and canonical definition.
///
/// The qualified name lives in the tree, not the blob, so an entity that is
/// renamed without other changes keeps its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub kind: EntityKind,
    pub definition: Value,
}

impl Blob {
    /// Build a blob, normalizing the definition.
    pub fn new(kind: EntityKind, definition: &Value) -> Self {
        Self {
            kind,
            definition: canonicalize(definition),
        }
    }

    /// Canonical byte form that is hashed.
    pub fn canonical_encoding(&self) -> String {
        format!(
            "kind:{}\ndefinition:{}\n",
            self.kind,
            canonical_json(&self.definition)
        )
    }

    pub fn hash(&self) -> ObjectHash {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update("blob\n");
        hasher.update(self.canonical_encoding());
        ObjectHash::from_hex(hex::encode(hasher.finalize()))
    }
}

/// An entity as seen through a tree: a blob bound to its qualified name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub qualified_name: QualifiedName,
    pub kind: EntityKind,
    pub definition: Value,
    pub content_hash: ObjectHash,
}

impl Entity {
    pub fn from_blob(qualified_name: QualifiedName, content_hash: ObjectHash, blob: Blob) -> Self {
        Self {
            qualified_name,
            kind: blob.kind,
            definition: blob.definition,
            content_hash,
        }
    }
}

/// Normalize a definition so superficially different spellings collide:
/// object members with `null` values are dropped and whitespace in free-text
/// fields is collapsed. Key order is handled by [`canonical_json`].
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, member) in map {
                if member.is_null() {
                    continue;
                }
                let normalized = match member {
                    Value::String(text) if NORMALIZED_TEXT_FIELDS.contains(&key.as_str()) => {
                        Value::String(collapse_whitespace(text))
                    }
                    other => canonicalize(other),
                };
                out.insert(key.clone(), normalized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Serialize with object keys in sorted order regardless of how the map
/// type orders them.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_does_not_change_hash() {
        let a = Blob::new(EntityKind::Table, &json!({"columns": [], "comment": "x"}));
        let b = Blob::new(EntityKind::Table, &json!({"comment": "x", "columns": []}));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_null_members_are_dropped() {
        let a = Blob::new(EntityKind::View, &json!({"query": "select 1", "comment": null}));
        let b = Blob::new(EntityKind::View, &json!({"query": "select 1"}));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_body_whitespace_is_normalized() {
        let a = Blob::new(
            EntityKind::Function,
            &json!({"body": "begin\n    return 1;\nend"}),
        );
        let b = Blob::new(EntityKind::Function, &json!({"body": "begin return 1; end"}));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_whitespace_outside_text_fields_is_significant() {
        let a = Blob::new(EntityKind::Type, &json!({"values": ["a b"]}));
        let b = Blob::new(EntityKind::Type, &json!({"values": ["a  b"]}));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_kind_participates_in_hash() {
        let def = json!({"depends_on": []});
        assert_ne!(
            Blob::new(EntityKind::View, &def).hash(),
            Blob::new(EntityKind::Sequence, &def).hash()
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [ {"y": true, "x": null} ]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[{"x":null,"y":true}],"b":{"a":2,"z":1}}"#
        );
    }
}
