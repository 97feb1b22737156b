use itertools::{EitherOrBoth, Itertools};
use std::sync::Arc;

use crate::error::{Result, VcsError};
use crate::logic::classify::ChangeClassifier;
use crate::logic::graph::CommitGraph;
use crate::logic::policy::PolicyRegistry;
use crate::model::{
    ChangeKind, Commit, CommitId, Conflict, ConflictKind, DiffEntry, MergeStatus, ObjectHash,
    PendingMerge, ResolutionState, ResolutionStrategy, ResolvedEntry, Resolutions, Tree,
};
use crate::store::{ObjectStoreExt, Store};

/// How a merge request was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Theirs is already contained in ours; nothing changed
    AlreadyMerged { head: CommitId },
    /// Ours was an ancestor of theirs; the branch now points at theirs
    FastForward { from: CommitId, to: CommitId },
    /// A merge commit with parents `[ours, theirs]` was created
    Merged {
        commit_id: CommitId,
        base: CommitId,
        /// Conflicts that were settled by the supplied strategies
        resolved: Vec<Conflict>,
    },
    /// Conflicts remain; nothing was committed
    Conflicted(PendingMerge),
}

/// What a merge between two heads needs before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub enum MergePlan {
    UpToDate { head: CommitId },
    FastForward { from: CommitId, to: CommitId },
    ThreeWay(PendingMerge),
}

/// Implements three-way merge of entity trees
pub struct MergeEngine;

impl MergeEngine {
    /// Work out how to merge `theirs` into `ours`. Only reads the store.
    pub fn plan<S: Store + ?Sized>(
        store: &S,
        classifier: &ChangeClassifier,
        target_branch: &str,
        source_branch: &str,
        ours: &CommitId,
        theirs: &CommitId,
    ) -> Result<MergePlan> {
        log::debug!(
            "merge {} <- {}: {:?}",
            target_branch,
            source_branch,
            MergeStatus::Initiated
        );

        if ours == theirs {
            return Ok(MergePlan::UpToDate { head: ours.clone() });
        }

        let base = CommitGraph::find_lca(store, ours, theirs)?.ok_or_else(|| {
            log::warn!(
                "merge {} <- {}: {:?}, no common ancestor",
                target_branch,
                source_branch,
                MergeStatus::Failed
            );
            VcsError::NoCommonAncestor {
                ours: ours.clone(),
                theirs: theirs.clone(),
            }
        })?;

        if &base == theirs {
            return Ok(MergePlan::UpToDate { head: ours.clone() });
        }
        if &base == ours {
            return Ok(MergePlan::FastForward {
                from: ours.clone(),
                to: theirs.clone(),
            });
        }

        log::debug!(
            "merge {} <- {}: {:?} against base {}",
            target_branch,
            source_branch,
            MergeStatus::Diffing,
            base.short()
        );
        let base_tree = Self::tree_of(store, &base)?;
        let ours_tree = Self::tree_of(store, ours)?;
        let theirs_tree = Self::tree_of(store, theirs)?;
        let (merged, conflicts) =
            Self::three_way(store, classifier, &base_tree, &ours_tree, &theirs_tree)?;

        let status = if conflicts.is_empty() {
            MergeStatus::Clean
        } else {
            MergeStatus::Conflicted
        };
        log::debug!(
            "merge {} <- {}: {:?} with {} conflict(s)",
            target_branch,
            source_branch,
            status,
            conflicts.len()
        );

        Ok(MergePlan::ThreeWay(PendingMerge {
            target_branch: target_branch.to_string(),
            source_branch: source_branch.to_string(),
            base,
            ours: ours.clone(),
            theirs: theirs.clone(),
            merged,
            conflicts,
            status,
        }))
    }

    fn tree_of<S: Store + ?Sized>(store: &S, commit: &CommitId) -> Result<Tree> {
        let commit = CommitGraph::get_commit(store, commit)?;
        store.get_tree(commit.tree_hash())
    }

    /// Combine two sides against their base. Changes made on one side only
    /// are applied; identical changes on both sides are applied once; every
    /// other overlap becomes a conflict and keeps the "ours" entry.
    pub fn three_way<S: ObjectStoreExt + ?Sized>(
        store: &S,
        classifier: &ChangeClassifier,
        base: &Tree,
        ours: &Tree,
        theirs: &Tree,
    ) -> Result<(Tree, Vec<Conflict>)> {
        let ours_diff = classifier.diff_trees(store, base, ours, false)?;
        let theirs_diff = classifier.diff_trees(store, base, theirs, false)?;

        let mut merged = ours.clone();
        let mut conflicts = Vec::new();

        for pair in ours_diff
            .iter()
            .merge_join_by(theirs_diff.iter(), |a, b| a.qualified_name.cmp(&b.qualified_name))
        {
            match pair {
                // Only ours changed: already in place.
                EitherOrBoth::Left(_) => {}
                EitherOrBoth::Right(change) => apply_change(&mut merged, change),
                EitherOrBoth::Both(ours_change, theirs_change) => {
                    if ours_change.resulting_hash() == theirs_change.resulting_hash() {
                        continue;
                    }
                    conflicts.push(Self::conflict_for(base, ours_change, theirs_change));
                }
            }
        }

        Ok((merged, conflicts))
    }

    fn conflict_for(base: &Tree, ours: &DiffEntry, theirs: &DiffEntry) -> Conflict {
        let kind = match (ours.change_kind, theirs.change_kind) {
            (ChangeKind::Added, _) | (_, ChangeKind::Added) => ConflictKind::AddAddDivergent,
            (ChangeKind::Removed, _) => ConflictKind::DeletedVsModified,
            (_, ChangeKind::Removed) => ConflictKind::ModifiedVsDeleted,
            _ => ConflictKind::BothModified,
        };
        // The deleting side carries the old kind; prefer the side that kept it.
        let entity_kind = if ours.after_hash.is_some() {
            ours.kind
        } else {
            theirs.kind
        };
        Conflict {
            qualified_name: ours.qualified_name.clone(),
            kind,
            entity_kind,
            base_hash: base.get(&ours.qualified_name).cloned(),
            ours_hash: ours.after_hash.clone(),
            theirs_hash: theirs.after_hash.clone(),
            resolution: ResolutionState::Unresolved,
            resolved: None,
        }
    }

    /// Apply strategies to the unresolved conflicts of `pending`. Returns the
    /// updated merge; on error `pending` is untouched.
    pub fn resolve<S: ObjectStoreExt + ?Sized>(
        store: &S,
        registry: &PolicyRegistry,
        pending: &PendingMerge,
        resolutions: &Resolutions,
    ) -> Result<PendingMerge> {
        let mut next = pending.clone();

        for conflict in next.conflicts.iter_mut().filter(|c| !c.is_resolved()) {
            let Some(strategy) = resolutions.strategy_for(&conflict.qualified_name) else {
                continue;
            };
            let (entry, state) = Self::settle(store, registry, conflict, strategy)?;
            match &entry {
                ResolvedEntry::Present(hash) => {
                    next.merged.insert(conflict.qualified_name.clone(), hash.clone())
                }
                ResolvedEntry::Absent => next.merged.remove(&conflict.qualified_name),
            }
            log::debug!(
                "resolved {} as {:?} via {:?}",
                conflict.qualified_name,
                state,
                strategy
            );
            conflict.resolution = state;
            conflict.resolved = Some(entry);
        }

        if next.unresolved_count() == 0 {
            next.status = MergeStatus::Resolved;
        }
        Ok(next)
    }

    fn settle<S: ObjectStoreExt + ?Sized>(
        store: &S,
        registry: &PolicyRegistry,
        conflict: &Conflict,
        strategy: &ResolutionStrategy,
    ) -> Result<(ResolvedEntry, ResolutionState)> {
        let side = |hash: &Option<ObjectHash>| match hash {
            Some(hash) => ResolvedEntry::Present(hash.clone()),
            None => ResolvedEntry::Absent,
        };

        match strategy {
            ResolutionStrategy::OursWins => Ok((side(&conflict.ours_hash), ResolutionState::Auto)),
            ResolutionStrategy::TheirsWins => {
                Ok((side(&conflict.theirs_hash), ResolutionState::Auto))
            }
            ResolutionStrategy::Union => {
                let hash = Self::union(store, registry, conflict)?;
                Ok((ResolvedEntry::Present(hash), ResolutionState::Auto))
            }
            ResolutionStrategy::Manual { definition: None } => {
                Ok((ResolvedEntry::Absent, ResolutionState::Manual))
            }
            ResolutionStrategy::Manual {
                definition: Some(definition),
            } => {
                let hash = store.put_entity(conflict.entity_kind, definition)?;
                Ok((ResolvedEntry::Present(hash), ResolutionState::Manual))
            }
        }
    }

    fn union<S: ObjectStoreExt + ?Sized>(
        store: &S,
        registry: &PolicyRegistry,
        conflict: &Conflict,
    ) -> Result<ObjectHash> {
        let reject = |reason: String| VcsError::InvalidResolution {
            qualified_name: conflict.qualified_name.clone(),
            reason,
        };

        let (Some(ours_hash), Some(theirs_hash)) = (&conflict.ours_hash, &conflict.theirs_hash)
        else {
            return Err(reject("union needs the entity on both sides".to_string()));
        };
        let ours = store.get_blob(ours_hash)?;
        let theirs = store.get_blob(theirs_hash)?;
        if ours.kind != theirs.kind {
            return Err(reject(format!(
                "sides disagree on kind ({} vs {})",
                ours.kind, theirs.kind
            )));
        }

        let policy = registry.policy_for(ours.kind);
        if !policy.supports_union() {
            return Err(reject(format!("{} does not support union", ours.kind)));
        }

        let base = match &conflict.base_hash {
            Some(hash) => Some(store.get_blob(hash)?.definition),
            None => None,
        };
        let combined = policy
            .union(base.as_ref(), &ours.definition, &theirs.definition)
            .ok_or_else(|| reject("the sides cannot be combined additively".to_string()))?;
        store.put_entity(ours.kind, &combined)
    }

    /// Write the merged tree and a merge commit with parents `[ours, theirs]`.
    /// The target branch is not moved.
    pub fn commit_merge<S: Store + ?Sized>(
        store: &S,
        pending: &PendingMerge,
        author: &str,
        message: &str,
    ) -> Result<Arc<Commit>> {
        let remaining = pending.unresolved_count();
        if remaining > 0 {
            return Err(VcsError::UnresolvedConflicts {
                branch: pending.target_branch.clone(),
                remaining,
            });
        }

        let tree_hash = store.put_tree(pending.merged.clone())?;
        CommitGraph::commit(
            store,
            &tree_hash,
            vec![pending.ours.clone(), pending.theirs.clone()],
            author,
            message,
        )
    }
}

fn apply_change(tree: &mut Tree, change: &DiffEntry) {
    match &change.after_hash {
        Some(hash) => tree.insert(change.qualified_name.clone(), hash.clone()),
        None => tree.remove(&change.qualified_name),
    }
}
