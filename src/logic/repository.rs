use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::VcsConfig;
use crate::error::{Result, VcsError};
use crate::logic::classify::ChangeClassifier;
use crate::logic::graph::CommitGraph;
use crate::logic::migration::MigrationGenerator;
use crate::logic::policy::PolicyRegistry;
use crate::logic::session::Session;
use crate::model::{
    generate_id, validate_ref_name, Branch, Commit, CommitId, DiffEntry, EntityKind, Id,
    MigrationScript, Object, ObjectHash, SnapshotRef, Tag, Tree,
};
use crate::store::{MemoryStore, ObjectStoreExt, Store};

const ROOT_COMMIT_MESSAGE: &str = "Initial empty commit";

/// One logical repository shared by every session. Holds the store, the
/// kind policies and the record of which sessions have which branch checked
/// out.
pub struct Repository<S: Store = MemoryStore> {
    store: S,
    classifier: ChangeClassifier,
    migrations: MigrationGenerator,
    config: VcsConfig,
    /// branch name → sessions that have it checked out
    checkouts: Mutex<HashMap<String, BTreeSet<Id>>>,
}

impl<S: Store> Repository<S> {
    /// Wrap `store`, creating a root commit on the default branch if that
    /// branch does not exist yet.
    pub fn init(store: S, config: VcsConfig) -> Result<Arc<Self>> {
        Self::init_with_registry(store, config, PolicyRegistry::with_defaults())
    }

    pub fn init_with_registry(
        store: S,
        config: VcsConfig,
        registry: PolicyRegistry,
    ) -> Result<Arc<Self>> {
        let classifier = ChangeClassifier::new(Arc::new(registry));
        let repo = Self {
            store,
            migrations: MigrationGenerator::new(classifier.clone()),
            classifier,
            config,
            checkouts: Mutex::new(HashMap::new()),
        };

        let default_branch = repo.config.repository.default_branch.clone();
        if repo.store.get_branch(&default_branch)?.is_none() {
            validate_ref_name(&default_branch)?;
            let tree_hash = repo.store.put_tree(Tree::new())?;
            let root = CommitGraph::commit(
                &repo.store,
                &tree_hash,
                vec![],
                &repo.config.repository.system_author,
                ROOT_COMMIT_MESSAGE,
            )?;
            repo.store.create_branch(Branch::new(
                default_branch.clone(),
                root.commit_id().clone(),
                None,
            ))?;
            log::info!(
                "initialized branch '{}' at root commit {}",
                default_branch,
                root.commit_id().short()
            );
        }

        Ok(Arc::new(repo))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &VcsConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ChangeClassifier {
        &self.classifier
    }

    pub fn registry(&self) -> &PolicyRegistry {
        self.classifier.registry()
    }

    /// Open a session with `branch` checked out.
    pub fn session(self: &Arc<Self>, branch: &str) -> Result<Session<S>> {
        let id = generate_id();
        self.register_checkout(branch, &id)?;
        Ok(Session::new(Arc::clone(self), id, branch.to_string()))
    }

    /// Open a session on the default branch.
    pub fn default_session(self: &Arc<Self>) -> Result<Session<S>> {
        let branch = self.config.repository.default_branch.clone();
        self.session(&branch)
    }

    // Objects

    pub fn put_entity(&self, kind: EntityKind, definition: &Value) -> Result<ObjectHash> {
        self.store.put_entity(kind, definition)
    }

    pub fn put_tree(&self, tree: Tree) -> Result<ObjectHash> {
        self.store.put_tree(tree)
    }

    pub fn get(&self, hash: &ObjectHash) -> Result<Arc<Object>> {
        self.store.get(hash)
    }

    // Commit graph

    pub fn commit(
        &self,
        tree_hash: &ObjectHash,
        parent_ids: Vec<CommitId>,
        author: &str,
        message: &str,
    ) -> Result<CommitId> {
        CommitGraph::commit(&self.store, tree_hash, parent_ids, author, message)
            .map(|commit| commit.commit_id().clone())
    }

    pub fn get_commit(&self, id: &CommitId) -> Result<Arc<Commit>> {
        CommitGraph::get_commit(&self.store, id)
    }

    pub fn find_lca(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>> {
        CommitGraph::find_lca(&self.store, a, b)
    }

    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
        CommitGraph::is_ancestor(&self.store, ancestor, descendant)
    }

    pub fn log(&self, from: &SnapshotRef, limit: Option<usize>) -> Result<Vec<Arc<Commit>>> {
        let start = self.resolve(from)?;
        CommitGraph::log(&self.store, start.commit_id(), limit)
    }

    // Branches

    pub fn create_branch(&self, name: &str, from_commit: &CommitId) -> Result<Branch> {
        self.create_branch_with_parent(name, from_commit, None)
    }

    pub(crate) fn create_branch_with_parent(
        &self,
        name: &str,
        from_commit: &CommitId,
        parent_branch: Option<String>,
    ) -> Result<Branch> {
        validate_ref_name(name)?;
        self.get_commit(from_commit)?;
        let branch = Branch::new(name.to_string(), from_commit.clone(), parent_branch);
        self.store.create_branch(branch.clone())?;
        log::info!("created branch '{}' at {}", name, from_commit.short());
        Ok(branch)
    }

    pub fn get_branch(&self, name: &str) -> Result<Branch> {
        self.store
            .get_branch(name)?
            .ok_or_else(|| VcsError::BranchNotFound(name.to_string()))
    }

    pub fn list_branches(&self) -> Result<Vec<Branch>> {
        self.store.list_branches()
    }

    /// Delete a branch nobody has checked out. Its commits stay.
    pub fn delete_branch(&self, name: &str) -> Result<Branch> {
        // Held across the delete so no session can check the branch out
        // in between.
        let checkouts = self.checkouts.lock();
        if let Some(session) = checkouts.get(name).and_then(|ids| ids.iter().next()) {
            return Err(VcsError::BranchInUse {
                branch: name.to_string(),
                session: session.clone(),
            });
        }
        let branch = self.store.delete_branch(name)?;
        log::info!(
            "deleted branch '{}' (was at {})",
            name,
            branch.head_commit_id.short()
        );
        Ok(branch)
    }

    /// Move a branch head from `expected` to `new`. Exactly one of several
    /// concurrent callers with the same `expected` succeeds; the others get
    /// `ConcurrentModification`.
    pub fn advance(&self, name: &str, expected: &CommitId, new: CommitId) -> Result<()> {
        self.get_commit(&new)?;
        match self.store.compare_and_swap_branch(name, expected, new.clone()) {
            Ok(()) => {
                log::info!(
                    "advanced branch '{}' {} -> {}",
                    name,
                    expected.short(),
                    new.short()
                );
                Ok(())
            }
            Err(err) => {
                if err.is_retryable() {
                    log::warn!("lost race advancing branch '{}': {}", name, err);
                }
                Err(err)
            }
        }
    }

    /// Tree at the head of a branch.
    pub fn checkout_tree(&self, name: &str) -> Result<Tree> {
        self.tree_at(&SnapshotRef::branch(name))
    }

    pub(crate) fn register_checkout(&self, branch: &str, session: &Id) -> Result<()> {
        let mut checkouts = self.checkouts.lock();
        self.get_branch(branch)?;
        checkouts
            .entry(branch.to_string())
            .or_default()
            .insert(session.clone());
        Ok(())
    }

    pub(crate) fn release_checkout(&self, branch: &str, session: &Id) {
        let mut checkouts = self.checkouts.lock();
        if let Some(ids) = checkouts.get_mut(branch) {
            ids.remove(session);
            if ids.is_empty() {
                checkouts.remove(branch);
            }
        }
    }

    // Tags

    pub fn create_tag(
        &self,
        name: &str,
        target: &SnapshotRef,
        message: Option<String>,
    ) -> Result<Tag> {
        validate_ref_name(name)?;
        let commit = self.resolve(target)?;
        let tag = Tag::new(name.to_string(), commit.commit_id().clone(), message);
        self.store.create_tag(tag.clone())?;
        log::info!("tagged {} as '{}'", commit.commit_id().short(), name);
        Ok(tag)
    }

    pub fn get_tag(&self, name: &str) -> Result<Tag> {
        self.store
            .get_tag(name)?
            .ok_or_else(|| VcsError::TagNotFound(name.to_string()))
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        self.store.list_tags()
    }

    pub fn delete_tag(&self, name: &str) -> Result<Tag> {
        self.store.delete_tag(name)
    }

    // Snapshots

    pub fn resolve(&self, reference: &SnapshotRef) -> Result<Arc<Commit>> {
        let id = match reference {
            SnapshotRef::Commit(id) => id.clone(),
            SnapshotRef::Branch(name) => self.get_branch(name)?.head_commit_id,
            SnapshotRef::Tag(name) => self.get_tag(name)?.commit_id,
        };
        self.get_commit(&id)
    }

    pub fn tree_at(&self, reference: &SnapshotRef) -> Result<Tree> {
        let commit = self.resolve(reference)?;
        self.store.get_tree(commit.tree_hash())
    }

    /// Classified changes between two snapshots, ordered by qualified name.
    pub fn diff(&self, from: &SnapshotRef, to: &SnapshotRef) -> Result<Vec<DiffEntry>> {
        let from = self.tree_at(from)?;
        let to = self.tree_at(to)?;
        self.classifier.diff_trees(&self.store, &from, &to, false)
    }

    pub fn generate_migration(
        &self,
        from: &SnapshotRef,
        to: &SnapshotRef,
    ) -> Result<MigrationScript> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        self.migrations
            .generate(&self.store, from.commit_id(), to.commit_id())
    }
}

impl Repository<MemoryStore> {
    /// Load the snapshot at `repository.data_path` if there is one, otherwise
    /// start a fresh in-memory repository.
    pub fn open(config: VcsConfig) -> Result<Arc<Self>> {
        let store = match &config.repository.data_path {
            Some(path) if path.exists() => MemoryStore::load_snapshot(path)?,
            _ => MemoryStore::new(),
        };
        Self::init(store, config)
    }

    /// Write the repository back to `repository.data_path`. A no-op for
    /// memory-only repositories.
    pub fn persist(&self) -> Result<()> {
        match &self.config.repository.data_path {
            Some(path) => self.store.save_snapshot(path),
            None => {
                log::debug!("no data path configured; nothing to persist");
                Ok(())
            }
        }
    }
}
