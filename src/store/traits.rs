use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, VcsError};
use crate::model::{
    Blob, Branch, Commit, CommitId, Entity, EntityKind, Object, ObjectHash, QualifiedName, Tag,
    Tree,
};

/// Content-addressed storage of blobs and trees. Append-only.
pub trait ObjectStore: Send + Sync {
    /// Store an object under its content hash. Storing identical content
    /// twice is a no-op; different content under an existing hash is a
    /// collision and fails without overwriting.
    fn put_object(&self, object: Object) -> Result<ObjectHash>;
    fn get_object(&self, hash: &ObjectHash) -> Result<Option<Arc<Object>>>;
    fn contains_object(&self, hash: &ObjectHash) -> Result<bool>;
    fn object_count(&self) -> Result<usize>;
}

/// Append-only commit arena keyed by commit id.
pub trait CommitStore: Send + Sync {
    fn insert_commit(&self, commit: Commit) -> Result<Arc<Commit>>;
    fn get_commit(&self, id: &CommitId) -> Result<Option<Arc<Commit>>>;
    fn commit_count(&self) -> Result<usize>;
}

/// Branches and tags. Branch heads only move through compare-and-swap.
pub trait RefStore: Send + Sync {
    fn get_branch(&self, name: &str) -> Result<Option<Branch>>;
    fn list_branches(&self) -> Result<Vec<Branch>>;
    /// Fails with `BranchExists` if the name is taken
    fn create_branch(&self, branch: Branch) -> Result<()>;
    /// Move `name` from `expected` to `new`. Fails with
    /// `ConcurrentModification` if the head is no longer `expected`.
    fn compare_and_swap_branch(&self, name: &str, expected: &CommitId, new: CommitId)
        -> Result<()>;
    fn delete_branch(&self, name: &str) -> Result<Branch>;

    fn get_tag(&self, name: &str) -> Result<Option<Tag>>;
    fn list_tags(&self) -> Result<Vec<Tag>>;
    fn create_tag(&self, tag: Tag) -> Result<()>;
    fn delete_tag(&self, name: &str) -> Result<Tag>;
}

pub trait Store: ObjectStore + CommitStore + RefStore {}
impl<T: ObjectStore + CommitStore + RefStore> Store for T {}

/// Typed access on top of [`ObjectStore`].
pub trait ObjectStoreExt: ObjectStore {
    /// Store an entity definition and return its content hash.
    fn put_entity(&self, kind: EntityKind, definition: &Value) -> Result<ObjectHash> {
        self.put_object(Object::Blob(Blob::new(kind, definition)))
    }

    /// Store a tree after checking that every entry resolves to a blob.
    fn put_tree(&self, tree: Tree) -> Result<ObjectHash> {
        for (name, hash) in tree.entries() {
            let object = self.get_object(hash)?.ok_or_else(|| {
                log::error!("tree entry '{}' references missing blob {}", name, hash);
                VcsError::DanglingReference {
                    referrer: format!("tree entry '{}'", name),
                    missing: hash.to_string(),
                }
            })?;
            if !matches!(*object, Object::Blob(_)) {
                return Err(VcsError::WrongObjectType {
                    hash: hash.clone(),
                    expected: "blob",
                    found: object.type_name(),
                });
            }
        }
        self.put_object(Object::Tree(tree))
    }

    fn get(&self, hash: &ObjectHash) -> Result<Arc<Object>> {
        self.get_object(hash)?
            .ok_or_else(|| VcsError::ObjectNotFound(hash.clone()))
    }

    fn get_blob(&self, hash: &ObjectHash) -> Result<Blob> {
        match &*self.get(hash)? {
            Object::Blob(blob) => Ok(blob.clone()),
            other => Err(VcsError::WrongObjectType {
                hash: hash.clone(),
                expected: "blob",
                found: other.type_name(),
            }),
        }
    }

    fn get_tree(&self, hash: &ObjectHash) -> Result<Tree> {
        match &*self.get(hash)? {
            Object::Tree(tree) => Ok(tree.clone()),
            other => Err(VcsError::WrongObjectType {
                hash: hash.clone(),
                expected: "tree",
                found: other.type_name(),
            }),
        }
    }

    /// Look an entity up by name inside a tree.
    fn get_entity(&self, tree: &Tree, name: &QualifiedName) -> Result<Entity> {
        let hash = tree.get(name).ok_or_else(|| VcsError::EntityNotFound {
            qualified_name: name.clone(),
            tree: tree.hash(),
        })?;
        let blob = self.get_blob(hash)?;
        Ok(Entity::from_blob(name.clone(), hash.clone(), blob))
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreExt for T {}
