use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{Result, VcsError};
use crate::model::{Commit, CommitId, ObjectHash};
use crate::store::{CommitStore, ObjectStoreExt, Store};

/// Operations over the append-only commit DAG. Parents are referenced by id
/// only; a commit's id covers its parents' ids, so cycles cannot be formed.
pub struct CommitGraph;

impl CommitGraph {
    /// Record a new commit. The tree must already be stored and every
    /// parent must exist; otherwise nothing is written.
    pub fn commit<S: Store + ?Sized>(
        store: &S,
        tree_hash: &ObjectHash,
        parent_ids: Vec<CommitId>,
        author: &str,
        message: &str,
    ) -> Result<Arc<Commit>> {
        // Resolving the tree also checks that the hash names a tree.
        store.get_tree(tree_hash).map_err(|err| match err {
            VcsError::ObjectNotFound(missing) => {
                log::error!("refusing commit: tree {} is not stored", missing);
                VcsError::DanglingReference {
                    referrer: "new commit".to_string(),
                    missing: missing.to_string(),
                }
            }
            other => other,
        })?;

        let mut seen = HashSet::new();
        let mut generation = 0;
        for parent in &parent_ids {
            if !seen.insert(parent) {
                return Err(VcsError::Corrupt(format!(
                    "parent {} listed twice in new commit",
                    parent
                )));
            }
            let parent_commit = store.get_commit(parent)?.ok_or_else(|| {
                log::error!("refusing commit: parent {} is not stored", parent);
                VcsError::DanglingReference {
                    referrer: "new commit".to_string(),
                    missing: parent.to_string(),
                }
            })?;
            generation = generation.max(parent_commit.generation() + 1);
        }

        let commit = Commit::new(
            tree_hash.clone(),
            parent_ids,
            author,
            message,
            Utc::now(),
            generation,
        );
        let commit = store.insert_commit(commit)?;
        log::info!(
            "created commit {} (tree {}, {} parent(s)) by {}: {}",
            commit.commit_id().short(),
            commit.tree_hash().short(),
            commit.parent_ids().len(),
            commit.author(),
            commit.message()
        );
        Ok(commit)
    }

    pub fn get_commit<S: CommitStore + ?Sized>(store: &S, id: &CommitId) -> Result<Arc<Commit>> {
        store
            .get_commit(id)?
            .ok_or_else(|| VcsError::CommitNotFound(id.clone()))
    }

    /// Lowest common ancestor of two commits.
    ///
    /// Candidates are the commits reachable from both sides that are not an
    /// ancestor of another candidate. The winner has the greatest generation,
    /// then the lexically smallest id. Both criteria are symmetric in `a` and
    /// `b`.
    pub fn find_lca<S: CommitStore + ?Sized>(
        store: &S,
        a: &CommitId,
        b: &CommitId,
    ) -> Result<Option<CommitId>> {
        let from_a = Self::ancestry(store, a)?;
        let from_b = Self::ancestry(store, b)?;
        let common: HashMap<&CommitId, &Arc<Commit>> = from_a
            .iter()
            .filter(|(id, _)| from_b.contains_key(*id))
            .collect();

        // Every ancestor of a common ancestor is common too, so one walk
        // from the candidates' parents marks all the dominated ones.
        let mut dominated: HashSet<&CommitId> = HashSet::new();
        let mut queue: VecDeque<&CommitId> = common
            .values()
            .copied()
            .flat_map(|commit| commit.parent_ids())
            .collect();
        while let Some(id) = queue.pop_front() {
            if !dominated.insert(id) {
                continue;
            }
            if let Some(&commit) = common.get(id) {
                queue.extend(commit.parent_ids());
            }
        }

        let best = common
            .iter()
            .filter(|(id, _)| !dominated.contains(*id))
            .map(|(id, commit)| (Reverse(commit.generation()), *id))
            .min();

        if let Some((_, id)) = &best {
            log::debug!("lca of {} and {} is {}", a.short(), b.short(), id.short());
        }
        Ok(best.map(|(_, id)| id.clone()))
    }

    /// Every ancestor of `start`, including `start` itself.
    fn ancestry<S: CommitStore + ?Sized>(
        store: &S,
        start: &CommitId,
    ) -> Result<HashMap<CommitId, Arc<Commit>>> {
        let root = Self::get_commit(store, start)?;
        let mut seen: HashMap<CommitId, Arc<Commit>> = HashMap::new();
        let mut queue = VecDeque::from([Arc::clone(&root)]);
        seen.insert(start.clone(), root);

        while let Some(commit) = queue.pop_front() {
            for parent_id in commit.parent_ids() {
                if seen.contains_key(parent_id) {
                    continue;
                }
                let parent = Self::load_parent(store, &commit, parent_id)?;
                seen.insert(parent_id.clone(), Arc::clone(&parent));
                queue.push_back(parent);
            }
        }

        Ok(seen)
    }

    fn load_parent<S: CommitStore + ?Sized>(
        store: &S,
        child: &Commit,
        parent_id: &CommitId,
    ) -> Result<Arc<Commit>> {
        store.get_commit(parent_id)?.ok_or_else(|| {
            log::error!(
                "commit {} references missing parent {}",
                child.commit_id(),
                parent_id
            );
            VcsError::DanglingReference {
                referrer: format!("commit {}", child.commit_id()),
                missing: parent_id.to_string(),
            }
        })
    }

    /// Whether `ancestor` is reachable from `descendant` (a commit is its
    /// own ancestor).
    pub fn is_ancestor<S: CommitStore + ?Sized>(
        store: &S,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool> {
        let target = Self::get_commit(store, ancestor)?;
        let start = Self::get_commit(store, descendant)?;

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(commit) = queue.pop_front() {
            if commit.commit_id() == ancestor {
                return Ok(true);
            }
            // Generations strictly decrease towards the root.
            if commit.generation() <= target.generation() {
                continue;
            }
            for parent_id in commit.parent_ids() {
                if seen.insert(parent_id.clone()) {
                    queue.push_back(Self::load_parent(store, &commit, parent_id)?);
                }
            }
        }
        Ok(false)
    }

    /// History reachable from `start`, newest generation first (ties by id),
    /// at most `limit` commits.
    pub fn log<S: CommitStore + ?Sized>(
        store: &S,
        start: &CommitId,
        limit: Option<usize>,
    ) -> Result<Vec<Arc<Commit>>> {
        let first = Self::get_commit(store, start)?;
        let mut heap = BinaryHeap::new();
        let mut seen = HashSet::new();
        let mut by_id: HashMap<CommitId, Arc<Commit>> = HashMap::new();

        seen.insert(start.clone());
        heap.push((first.generation(), Reverse(start.clone())));
        by_id.insert(start.clone(), first);

        let mut history = Vec::new();
        while let Some((_, Reverse(id))) = heap.pop() {
            if limit.is_some_and(|max| history.len() >= max) {
                break;
            }
            let commit = by_id
                .remove(&id)
                .ok_or_else(|| VcsError::CommitNotFound(id.clone()))?;
            for parent_id in commit.parent_ids() {
                if seen.insert(parent_id.clone()) {
                    let parent = Self::load_parent(store, &commit, parent_id)?;
                    heap.push((parent.generation(), Reverse(parent_id.clone())));
                    by_id.insert(parent_id.clone(), parent);
                }
            }
            history.push(commit);
        }
        Ok(history)
    }
}
