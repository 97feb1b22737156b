use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Result, VcsError};
use crate::model::{Branch, Commit, CommitId, Object, ObjectHash, Tag};
use crate::store::traits::{CommitStore, ObjectStore, RefStore};

/// In-process store. Objects and commits are append-only maps; every branch
/// head sits behind its own mutex so advancing one branch never waits on
/// another.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectHash, Arc<Object>>>,
    commits: RwLock<HashMap<CommitId, Arc<Commit>>>,
    branches: RwLock<BTreeMap<String, Arc<Mutex<Branch>>>>,
    tags: RwLock<BTreeMap<String, Tag>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn objects_snapshot(&self) -> BTreeMap<ObjectHash, Object> {
        self.objects
            .read()
            .iter()
            .map(|(hash, object)| (hash.clone(), (**object).clone()))
            .collect()
    }

    pub(crate) fn commits_snapshot(&self) -> Vec<Commit> {
        let mut commits: Vec<Commit> = self
            .commits
            .read()
            .values()
            .map(|commit| (**commit).clone())
            .collect();
        commits.sort_by(|a, b| {
            a.generation()
                .cmp(&b.generation())
                .then_with(|| a.commit_id().cmp(b.commit_id()))
        });
        commits
    }
}

impl ObjectStore for MemoryStore {
    fn put_object(&self, object: Object) -> Result<ObjectHash> {
        let hash = object.hash();
        let mut objects = self.objects.write();

        if let Some(existing) = objects.get(&hash) {
            if **existing != object {
                log::error!(
                    "hash collision on {}: stored {} differs from incoming {}",
                    hash,
                    existing.type_name(),
                    object.type_name()
                );
                return Err(VcsError::HashCollision {
                    hash,
                    context: object.type_name().to_string(),
                });
            }
            return Ok(hash);
        }

        log::debug!("stored {} {}", object.type_name(), hash.short());
        objects.insert(hash.clone(), Arc::new(object));
        Ok(hash)
    }

    fn get_object(&self, hash: &ObjectHash) -> Result<Option<Arc<Object>>> {
        Ok(self.objects.read().get(hash).cloned())
    }

    fn contains_object(&self, hash: &ObjectHash) -> Result<bool> {
        Ok(self.objects.read().contains_key(hash))
    }

    fn object_count(&self) -> Result<usize> {
        Ok(self.objects.read().len())
    }
}

impl CommitStore for MemoryStore {
    fn insert_commit(&self, commit: Commit) -> Result<Arc<Commit>> {
        let mut commits = self.commits.write();

        if let Some(existing) = commits.get(commit.commit_id()) {
            if **existing != commit {
                log::error!("commit id collision on {}", commit.commit_id());
                return Err(VcsError::Corrupt(format!(
                    "commit id {} already bound to different content",
                    commit.commit_id()
                )));
            }
            return Ok(existing.clone());
        }

        let commit = Arc::new(commit);
        commits.insert(commit.commit_id().clone(), commit.clone());
        Ok(commit)
    }

    fn get_commit(&self, id: &CommitId) -> Result<Option<Arc<Commit>>> {
        Ok(self.commits.read().get(id).cloned())
    }

    fn commit_count(&self) -> Result<usize> {
        Ok(self.commits.read().len())
    }
}

impl RefStore for MemoryStore {
    fn get_branch(&self, name: &str) -> Result<Option<Branch>> {
        Ok(self
            .branches
            .read()
            .get(name)
            .map(|cell| cell.lock().clone()))
    }

    fn list_branches(&self) -> Result<Vec<Branch>> {
        Ok(self
            .branches
            .read()
            .values()
            .map(|cell| cell.lock().clone())
            .collect())
    }

    fn create_branch(&self, branch: Branch) -> Result<()> {
        let mut branches = self.branches.write();
        if branches.contains_key(&branch.name) {
            return Err(VcsError::BranchExists(branch.name));
        }
        branches.insert(branch.name.clone(), Arc::new(Mutex::new(branch)));
        Ok(())
    }

    fn compare_and_swap_branch(
        &self,
        name: &str,
        expected: &CommitId,
        new: CommitId,
    ) -> Result<()> {
        // The shared map guard is held across the swap so a concurrent delete
        // cannot detach the cell, while swaps on other branches proceed.
        let branches = self.branches.read();
        let cell = branches
            .get(name)
            .ok_or_else(|| VcsError::BranchNotFound(name.to_string()))?;

        let mut branch = cell.lock();
        if &branch.head_commit_id != expected {
            return Err(VcsError::ConcurrentModification {
                branch: name.to_string(),
                expected: expected.clone(),
                actual: branch.head_commit_id.clone(),
            });
        }
        branch.head_commit_id = new;
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<Branch> {
        let mut branches = self.branches.write();
        let cell = branches
            .remove(name)
            .ok_or_else(|| VcsError::BranchNotFound(name.to_string()))?;
        let branch = cell.lock().clone();
        Ok(branch)
    }

    fn get_tag(&self, name: &str) -> Result<Option<Tag>> {
        Ok(self.tags.read().get(name).cloned())
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.tags.read().values().cloned().collect())
    }

    fn create_tag(&self, tag: Tag) -> Result<()> {
        let mut tags = self.tags.write();
        if tags.contains_key(&tag.name) {
            return Err(VcsError::TagExists(tag.name));
        }
        tags.insert(tag.name.clone(), tag);
        Ok(())
    }

    fn delete_tag(&self, name: &str) -> Result<Tag> {
        self.tags
            .write()
            .remove(name)
            .ok_or_else(|| VcsError::TagNotFound(name.to_string()))
    }
}
