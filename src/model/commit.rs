use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CommitId, Id, ObjectHash, Tree};

/// A commit is an immutable point in history referencing a tree snapshot.
///
/// Fields are only readable; a commit is never changed after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// SHA-256 over tree, parents and metadata
    commit_id: CommitId,
    tree_hash: ObjectHash,
    /// Empty for the root commit, two entries for merges (ours, theirs)
    parent_ids: Vec<CommitId>,
    author: String,
    message: String,
    created_at: DateTime<Utc>,
    /// Longest path length from the root commit; root is 0
    generation: u64,
}

impl Commit {
    pub fn new(
        tree_hash: ObjectHash,
        parent_ids: Vec<CommitId>,
        author: impl Into<String>,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
        generation: u64,
    ) -> Self {
        let author = author.into();
        let message = message.into();
        let commit_id =
            Self::calculate_id(&tree_hash, &parent_ids, &author, &message, &created_at);

        Self {
            commit_id,
            tree_hash,
            parent_ids,
            author,
            message,
            created_at,
            generation,
        }
    }

    /// Calculate the SHA-256 id for the commit
    fn calculate_id(
        tree_hash: &ObjectHash,
        parent_ids: &[CommitId],
        author: &str,
        message: &str,
        created_at: &DateTime<Utc>,
    ) -> CommitId {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(format!("tree:{}\n", tree_hash));
        for parent in parent_ids {
            hasher.update(format!("parent:{}\n", parent));
        }
        hasher.update(format!("author:{}\n", author));
        hasher.update(format!(
            "created_at:{}\n",
            created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ));
        hasher.update(format!("message:{}\n", message));

        CommitId::from_hex(hex::encode(hasher.finalize()))
    }

    /// Recompute the id from the content and compare.
    pub fn verify_id(&self) -> bool {
        Self::calculate_id(
            &self.tree_hash,
            &self.parent_ids,
            &self.author,
            &self.message,
            &self.created_at,
        ) == self.commit_id
    }

    pub fn commit_id(&self) -> &CommitId {
        &self.commit_id
    }

    pub fn tree_hash(&self) -> &ObjectHash {
        &self.tree_hash
    }

    pub fn parent_ids(&self) -> &[CommitId] {
        &self.parent_ids
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }
}

/// Copy-on-write working state materialized from a branch head.
///
/// Edits never touch this value; they return a new working tree (see
/// [`crate::logic::Session::with_entity`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingTree {
    /// Session that checked this tree out
    pub session_id: Id,
    /// Branch the tree was checked out from
    pub branch_name: String,
    /// Commit this work is built on
    pub based_on: CommitId,
    pub tree: Tree,
}

impl WorkingTree {
    pub fn new(session_id: Id, branch_name: String, based_on: CommitId, tree: Tree) -> Self {
        Self {
            session_id,
            branch_name,
            based_on,
            tree,
        }
    }

    pub(crate) fn with_tree(&self, tree: Tree) -> Self {
        Self {
            session_id: self.session_id.clone(),
            branch_name: self.branch_name.clone(),
            based_on: self.based_on.clone(),
            tree,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_covers_parents_and_metadata() {
        let now = Utc::now();
        let tree = ObjectHash::from_hex("aa");
        let a = Commit::new(tree.clone(), vec![], "alice", "init", now, 0);
        let b = Commit::new(tree.clone(), vec![], "bob", "init", now, 0);
        let c = Commit::new(tree.clone(), vec![a.commit_id().clone()], "alice", "init", now, 1);
        assert_ne!(a.commit_id(), b.commit_id());
        assert_ne!(a.commit_id(), c.commit_id());
        assert!(a.verify_id());
        assert!(c.verify_id());
    }

    #[test]
    fn test_commit_id_is_deterministic() {
        let now = Utc::now();
        let a = Commit::new(ObjectHash::from_hex("aa"), vec![], "x", "m", now, 0);
        let b = Commit::new(ObjectHash::from_hex("aa"), vec![], "x", "m", now, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_serde_roundtrip_preserves_id() {
        let commit = Commit::new(ObjectHash::from_hex("aa"), vec![], "x", "m", Utc::now(), 0);
        let json = serde_json::to_string(&commit).unwrap();
        let back: Commit = serde_json::from_str(&json).unwrap();
        assert!(back.verify_id());
        assert_eq!(back, commit);
    }

    #[test]
    fn test_root_and_merge_flags() {
        let now = Utc::now();
        let root = Commit::new(ObjectHash::from_hex("aa"), vec![], "x", "root", now, 0);
        let merge = Commit::new(
            ObjectHash::from_hex("aa"),
            vec![CommitId::from_hex("1"), CommitId::from_hex("2")],
            "x",
            "merge",
            now,
            3,
        );
        assert!(root.is_root());
        assert!(!root.is_merge());
        assert!(merge.is_merge());
        assert_eq!(merge.generation(), 3);
    }
}
