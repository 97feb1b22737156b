use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, VcsError};
use crate::logic::graph::CommitGraph;
use crate::logic::merge::{MergeEngine, MergeOutcome, MergePlan};
use crate::logic::repository::Repository;
use crate::model::{
    Blob, Branch, ChangeEvent, CommitId, DiffEntry, EntityKind, Id, MergeOptions, MergeStatus,
    PendingMerge, QualifiedName, Resolutions, Tree, WorkingTree,
};
use crate::store::{MemoryStore, ObjectStoreExt, Store};

/// Result of recording a batch of change events.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        commit_id: CommitId,
        changes: Vec<DiffEntry>,
    },
    /// The events changed nothing (for example, a redelivered batch)
    Unchanged { head: CommitId },
}

/// A caller's view of the repository: which branch is current. Dropping
/// the session releases its checkout.
pub struct Session<S: Store = MemoryStore> {
    repo: Arc<Repository<S>>,
    id: Id,
    current_branch: String,
}

impl<S: Store> Session<S> {
    pub(crate) fn new(repo: Arc<Repository<S>>, id: Id, current_branch: String) -> Self {
        log::debug!("session {} opened on '{}'", id, current_branch);
        Self {
            repo,
            id,
            current_branch,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn repository(&self) -> &Arc<Repository<S>> {
        &self.repo
    }

    pub fn current_branch(&self) -> &str {
        &self.current_branch
    }

    pub fn head(&self) -> Result<CommitId> {
        Ok(self.repo.get_branch(&self.current_branch)?.head_commit_id)
    }

    /// Switch to `name` and return its working state.
    pub fn checkout(&mut self, name: &str) -> Result<WorkingTree> {
        if name != self.current_branch {
            self.repo.register_checkout(name, &self.id)?;
            self.repo.release_checkout(&self.current_branch, &self.id);
            log::debug!(
                "session {} switched '{}' -> '{}'",
                self.id,
                self.current_branch,
                name
            );
            self.current_branch = name.to_string();
        }
        self.working_tree()
    }

    /// Working state at the current head. Edits never touch the branch until
    /// committed.
    pub fn working_tree(&self) -> Result<WorkingTree> {
        let head = self.head()?;
        let commit = self.repo.get_commit(&head)?;
        let tree = self.repo.store().get_tree(commit.tree_hash())?;
        Ok(WorkingTree::new(
            self.id.clone(),
            self.current_branch.clone(),
            head,
            tree,
        ))
    }

    /// New working tree with `name` set to `definition`.
    pub fn with_entity(
        &self,
        working: &WorkingTree,
        name: QualifiedName,
        kind: EntityKind,
        definition: &Value,
    ) -> Result<WorkingTree> {
        let hash = self.repo.put_entity(kind, definition)?;
        Ok(working.with_tree(working.tree.with_entry(name, hash)))
    }

    /// New working tree without `name`.
    pub fn without_entity(&self, working: &WorkingTree, name: &QualifiedName) -> Result<WorkingTree> {
        if !working.tree.contains(name) {
            return Err(VcsError::EntityNotFound {
                qualified_name: name.clone(),
                tree: working.tree.hash(),
            });
        }
        Ok(working.with_tree(working.tree.without_entry(name)))
    }

    /// Uncommitted changes relative to the head the working tree came from.
    pub fn status(&self, working: &WorkingTree) -> Result<Vec<DiffEntry>> {
        let base = self.repo.get_commit(&working.based_on)?;
        let base_tree = self.repo.store().get_tree(base.tree_hash())?;
        self.repo
            .classifier()
            .diff_trees(self.repo.store(), &base_tree, &working.tree, false)
    }

    /// Commit a working tree onto its branch. Fails with
    /// `ConcurrentModification` if the branch moved since checkout, and with
    /// `ForeignWorkingTree` if the tree was checked out by another session
    /// or from a branch this session has since left.
    pub fn commit(&self, working: &WorkingTree, author: &str, message: &str) -> Result<CommitId> {
        if working.session_id != self.id || working.branch_name != self.current_branch {
            return Err(VcsError::ForeignWorkingTree {
                owner: working.session_id.clone(),
                branch: working.branch_name.clone(),
                session: self.id.clone(),
                current: self.current_branch.clone(),
            });
        }
        let store = self.repo.store();
        let tree_hash = store.put_tree(working.tree.clone())?;
        let commit = CommitGraph::commit(
            store,
            &tree_hash,
            vec![working.based_on.clone()],
            author,
            message,
        )?;
        let commit_id = commit.commit_id().clone();
        self.repo
            .advance(&working.branch_name, &working.based_on, commit_id.clone())?;
        Ok(commit_id)
    }

    /// Branch off the current head.
    pub fn create_branch(&self, name: &str) -> Result<Branch> {
        let head = self.head()?;
        self.repo
            .create_branch_with_parent(name, &head, Some(self.current_branch.clone()))
    }

    pub fn delete_branch(&self, name: &str) -> Result<Branch> {
        self.repo.delete_branch(name)
    }

    /// Record change events on top of the current head. Redelivered or
    /// no-op batches leave the branch alone.
    pub fn apply_events(
        &self,
        events: &[ChangeEvent],
        author: &str,
        message: &str,
    ) -> Result<CommitOutcome> {
        let store = self.repo.store();
        let max_retries = self.repo.config().merge.max_retries;
        let mut attempt = 0;

        loop {
            let head = self.head()?;
            let tree = store.get_tree(self.repo.get_commit(&head)?.tree_hash())?;
            let next = apply_events_to_tree(store, &tree, events)?;
            if next == tree {
                log::debug!(
                    "{} event(s) left '{}' unchanged",
                    events.len(),
                    self.current_branch
                );
                return Ok(CommitOutcome::Unchanged { head });
            }

            let changes = self
                .repo
                .classifier()
                .diff_trees(store, &tree, &next, false)?;
            let tree_hash = store.put_tree(next)?;
            let commit = CommitGraph::commit(store, &tree_hash, vec![head.clone()], author, message)?;
            let commit_id = commit.commit_id().clone();

            match self
                .repo
                .advance(&self.current_branch, &head, commit_id.clone())
            {
                Ok(()) => return Ok(CommitOutcome::Committed { commit_id, changes }),
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    log::warn!(
                        "retrying events on '{}' (attempt {} of {})",
                        self.current_branch,
                        attempt,
                        max_retries
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Merge `source_branch` into the current branch.
    ///
    /// Conflicts are settled with `options.resolutions`, or with the
    /// configured default strategy when none are given; whatever remains is
    /// returned as [`MergeOutcome::Conflicted`] without committing. A clean
    /// merge that loses the race for the branch head starts over from the
    /// new head.
    pub fn merge(&self, source_branch: &str, options: MergeOptions) -> Result<MergeOutcome> {
        let resolutions = if options.resolutions.is_empty() {
            match self.repo.config().merge.default_strategy()? {
                Some(strategy) => Resolutions::all(strategy),
                None => Resolutions::new(),
            }
        } else {
            options.resolutions.clone()
        };
        let max_retries = self.repo.config().merge.max_retries;
        let mut attempt = 0;

        loop {
            let ours = self.head()?;
            let theirs = self.repo.get_branch(source_branch)?.head_commit_id;
            let plan = MergeEngine::plan(
                self.repo.store(),
                self.repo.classifier(),
                &self.current_branch,
                source_branch,
                &ours,
                &theirs,
            )?;

            let result = match plan {
                MergePlan::UpToDate { head } => {
                    log::info!(
                        "'{}' already contains '{}'",
                        self.current_branch,
                        source_branch
                    );
                    return Ok(MergeOutcome::AlreadyMerged { head });
                }
                MergePlan::FastForward { from, to } => self
                    .repo
                    .advance(&self.current_branch, &from, to.clone())
                    .map(|()| MergeOutcome::FastForward { from, to }),
                MergePlan::ThreeWay(pending) => {
                    let pending = if pending.conflicts.is_empty() || resolutions.is_empty() {
                        pending
                    } else {
                        MergeEngine::resolve(
                            self.repo.store(),
                            self.repo.registry(),
                            &pending,
                            &resolutions,
                        )?
                    };
                    if pending.unresolved_count() > 0 {
                        log::info!(
                            "merge '{}' <- '{}' stopped with {} unresolved conflict(s)",
                            self.current_branch,
                            source_branch,
                            pending.unresolved_count()
                        );
                        return Ok(MergeOutcome::Conflicted(pending));
                    }
                    self.finish_merge(&pending, &options)
                }
            };

            match result {
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    log::warn!(
                        "merge '{}' <- '{}' lost the branch head, retrying (attempt {} of {})",
                        self.current_branch,
                        source_branch,
                        attempt,
                        max_retries
                    );
                }
                other => return other,
            }
        }
    }

    /// Resolve the remaining conflicts of a stopped merge and commit it. If
    /// the target branch moved in the meantime this fails with
    /// `ConcurrentModification`; run [`Session::merge`] again.
    pub fn complete_merge(
        &self,
        pending: &PendingMerge,
        resolutions: &Resolutions,
        options: &MergeOptions,
    ) -> Result<MergeOutcome> {
        let resolved =
            MergeEngine::resolve(self.repo.store(), self.repo.registry(), pending, resolutions)?;
        self.finish_merge(&resolved, options)
    }

    fn finish_merge(&self, pending: &PendingMerge, options: &MergeOptions) -> Result<MergeOutcome> {
        let author = options
            .author
            .clone()
            .unwrap_or_else(|| self.repo.config().repository.system_author.clone());
        let message = options.message.clone().unwrap_or_else(|| {
            format!(
                "Merge branch '{}' into '{}'",
                pending.source_branch, pending.target_branch
            )
        });

        let commit = MergeEngine::commit_merge(self.repo.store(), pending, &author, &message)?;
        let commit_id = commit.commit_id().clone();
        self.repo
            .advance(&pending.target_branch, &pending.ours, commit_id.clone())?;
        log::info!(
            "merge '{}' <- '{}': {:?} as {}",
            pending.target_branch,
            pending.source_branch,
            MergeStatus::Committed,
            commit_id.short()
        );

        Ok(MergeOutcome::Merged {
            commit_id,
            base: pending.base.clone(),
            resolved: pending.conflicts.clone(),
        })
    }
}

impl<S: Store> Drop for Session<S> {
    fn drop(&mut self) {
        self.repo.release_checkout(&self.current_branch, &self.id);
        log::debug!("session {} closed", self.id);
    }
}

/// Apply events in order: an after-image replaces the entity, a missing one
/// removes it. The events' before-images are informational only.
pub fn apply_events_to_tree<S: ObjectStoreExt + ?Sized>(
    store: &S,
    tree: &Tree,
    events: &[ChangeEvent],
) -> Result<Tree> {
    let mut next = tree.clone();
    for event in events {
        if let Some(before) = &event.before {
            let expected = Blob::new(event.kind, before).hash();
            if next.get(&event.qualified_name) != Some(&expected) {
                log::debug!(
                    "event for '{}' does not match the recorded state; applying its after-image",
                    event.qualified_name
                );
            }
        }
        match &event.after {
            Some(after) => {
                let hash = store.put_entity(event.kind, after)?;
                next.insert(event.qualified_name.clone(), hash);
            }
            None => next.remove(&event.qualified_name),
        }
    }
    Ok(next)
}
