use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Blob, ObjectHash, QualifiedName};

/// Snapshot of every tracked entity: `qualified_name -> content_hash`.
///
/// Entries are kept sorted, so the hash never depends on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: BTreeMap<QualifiedName, ObjectHash>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (QualifiedName, ObjectHash)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &BTreeMap<QualifiedName, ObjectHash> {
        &self.entries
    }

    pub fn get(&self, name: &QualifiedName) -> Option<&ObjectHash> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &QualifiedName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &QualifiedName> {
        self.entries.keys()
    }

    /// Copy of this tree with `name` bound to `hash`.
    pub fn with_entry(&self, name: QualifiedName, hash: ObjectHash) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(name, hash);
        Self { entries }
    }

    /// Copy of this tree without `name`.
    pub fn without_entry(&self, name: &QualifiedName) -> Self {
        let mut entries = self.entries.clone();
        entries.remove(name);
        Self { entries }
    }

    pub(crate) fn insert(&mut self, name: QualifiedName, hash: ObjectHash) {
        self.entries.insert(name, hash);
    }

    pub(crate) fn remove(&mut self, name: &QualifiedName) {
        self.entries.remove(name);
    }

    pub fn canonical_encoding(&self) -> String {
        let mut out = String::new();
        for (name, hash) in &self.entries {
            out.push_str(name.as_str());
            out.push('\t');
            out.push_str(hash.as_str());
            out.push('\n');
        }
        out
    }

    pub fn hash(&self) -> ObjectHash {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update("tree\n");
        hasher.update(self.canonical_encoding());
        ObjectHash::from_hex(hex::encode(hasher.finalize()))
    }
}

/// Anything the object store can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
}

impl Object {
    pub fn hash(&self) -> ObjectHash {
        match self {
            Object::Blob(blob) => blob.hash(),
            Object::Tree(tree) => tree.hash(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Blob(_) => "blob",
            Object::Tree(_) => "tree",
        }
    }
}
