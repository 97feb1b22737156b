use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::CommitId;

/// Named, movable pointer into the commit graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub head_commit_id: CommitId,
    /// Branch this one was created from, if any
    pub parent_branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(name: String, head_commit_id: CommitId, parent_branch_name: Option<String>) -> Self {
        Self {
            name,
            head_commit_id,
            parent_branch_name,
            created_at: Utc::now(),
        }
    }
}

/// Immutable named pointer to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub commit_id: CommitId,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(name: String, commit_id: CommitId, message: Option<String>) -> Self {
        Self {
            name,
            commit_id,
            message,
            created_at: Utc::now(),
        }
    }
}

/// Any way of naming a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SnapshotRef {
    Commit(CommitId),
    Branch(String),
    Tag(String),
}

impl SnapshotRef {
    pub fn branch(name: impl Into<String>) -> Self {
        SnapshotRef::Branch(name.into())
    }

    pub fn tag(name: impl Into<String>) -> Self {
        SnapshotRef::Tag(name.into())
    }
}

impl From<CommitId> for SnapshotRef {
    fn from(id: CommitId) -> Self {
        SnapshotRef::Commit(id)
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotRef::Commit(id) => write!(f, "commit {}", id.short()),
            SnapshotRef::Branch(name) => write!(f, "branch '{}'", name),
            SnapshotRef::Tag(name) => write!(f, "tag '{}'", name),
        }
    }
}
