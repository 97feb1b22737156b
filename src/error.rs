use thiserror::Error;

use crate::model::{CommitId, ObjectHash, QualifiedName};

pub type Result<T> = std::result::Result<T, VcsError>;

/// Error taxonomy for every repository operation.
///
/// Merge conflicts are not represented here: a conflicted merge is a normal
/// outcome (see [`crate::logic::MergeOutcome`]).
#[derive(Debug, Error)]
pub enum VcsError {
    // Integrity: fatal, never retried
    #[error("integrity violation: hash collision on {hash} while storing {context}")]
    HashCollision { hash: ObjectHash, context: String },

    #[error("integrity violation: {referrer} references missing object {missing}")]
    DanglingReference { referrer: String, missing: String },

    #[error("integrity violation: commits {ours} and {theirs} share no history")]
    NoCommonAncestor { ours: CommitId, theirs: CommitId },

    #[error("integrity violation: object {hash} is a {found}, expected a {expected}")]
    WrongObjectType {
        hash: ObjectHash,
        expected: &'static str,
        found: &'static str,
    },

    #[error("integrity violation: {0}")]
    Corrupt(String),

    // Concurrency: retryable
    #[error("concurrent modification of branch '{branch}': expected head {expected}, found {actual}")]
    ConcurrentModification {
        branch: String,
        expected: CommitId,
        actual: CommitId,
    },

    // Not found
    #[error("object {0} not found")]
    ObjectNotFound(ObjectHash),

    #[error("commit {0} not found")]
    CommitNotFound(CommitId),

    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    #[error("tag '{0}' not found")]
    TagNotFound(String),

    #[error("entity '{qualified_name}' not found in tree {tree}")]
    EntityNotFound {
        qualified_name: QualifiedName,
        tree: ObjectHash,
    },

    // Usage
    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("tag '{0}' already exists")]
    TagExists(String),

    #[error("branch '{branch}' is checked out by session {session}")]
    BranchInUse { branch: String, session: String },

    #[error("working tree from session {owner} on '{branch}' cannot be committed by session {session} on '{current}'")]
    ForeignWorkingTree {
        owner: String,
        branch: String,
        session: String,
        current: String,
    },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("cannot resolve conflict on '{qualified_name}': {reason}")]
    InvalidResolution {
        qualified_name: QualifiedName,
        reason: String,
    },

    #[error("merge of '{branch}' still has {remaining} unresolved conflict(s)")]
    UnresolvedConflicts { branch: String, remaining: usize },

    #[error("unknown merge strategy '{0}'")]
    UnknownStrategy(String),

    #[error("migration step on '{qualified_name}' does not fit the tree: {reason}")]
    MigrationMismatch {
        qualified_name: QualifiedName,
        reason: String,
    },

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Integrity,
    Concurrency,
    NotFound,
    Usage,
}

impl VcsError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VcsError::HashCollision { .. }
            | VcsError::DanglingReference { .. }
            | VcsError::NoCommonAncestor { .. }
            | VcsError::WrongObjectType { .. }
            | VcsError::Corrupt(_) => ErrorClass::Integrity,
            VcsError::ConcurrentModification { .. } => ErrorClass::Concurrency,
            VcsError::ObjectNotFound(_)
            | VcsError::CommitNotFound(_)
            | VcsError::BranchNotFound(_)
            | VcsError::TagNotFound(_)
            | VcsError::EntityNotFound { .. } => ErrorClass::NotFound,
            VcsError::BranchExists(_)
            | VcsError::TagExists(_)
            | VcsError::BranchInUse { .. }
            | VcsError::ForeignWorkingTree { .. }
            | VcsError::InvalidName { .. }
            | VcsError::InvalidResolution { .. }
            | VcsError::UnresolvedConflicts { .. }
            | VcsError::UnknownStrategy(_)
            | VcsError::MigrationMismatch { .. }
            | VcsError::Io(_)
            | VcsError::Serialization(_) => ErrorClass::Usage,
        }
    }

    /// Only lost compare-and-swap races may be retried automatically.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Concurrency
    }

    pub fn is_integrity(&self) -> bool {
        self.class() == ErrorClass::Integrity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_concurrency_errors_are_retryable() {
        let lost = VcsError::ConcurrentModification {
            branch: "main".to_string(),
            expected: CommitId::from_hex("aa"),
            actual: CommitId::from_hex("bb"),
        };
        assert!(lost.is_retryable());
        assert!(!VcsError::BranchNotFound("x".to_string()).is_retryable());
        assert!(!VcsError::Corrupt("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = VcsError::BranchInUse {
            branch: "feature".to_string(),
            session: "s-1".to_string(),
        };
        assert!(err.to_string().contains("feature"));

        let err = VcsError::NoCommonAncestor {
            ours: CommitId::from_hex("abc"),
            theirs: CommitId::from_hex("def"),
        };
        assert!(err.is_integrity());
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("def"));
    }
}
