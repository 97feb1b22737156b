//! Git-style version control over named, structured definitions.
//!
//! Definitions are stored as content-addressed blobs, grouped into trees and
//! recorded in an append-only commit graph. Branches are the only mutable
//! state and move by compare-and-swap. On top of that sit a three-way merge
//! with per-entity conflict classification and a generator for ordered,
//! reversible migration scripts.
//!
//! ```no_run
//! use schema_vcs::{ChangeEvent, EntityKind, QualifiedName, Repository, VcsConfig};
//! use serde_json::json;
//!
//! # fn main() -> schema_vcs::Result<()> {
//! let repo = Repository::open(VcsConfig::in_memory())?;
//! let session = repo.default_session()?;
//! session.apply_events(
//!     &[ChangeEvent::created(
//!         QualifiedName::parse("public.users").unwrap(),
//!         EntityKind::Table,
//!         json!({"columns": [{"name": "id", "type": "bigint"}]}),
//!     )],
//!     "alice",
//!     "add users",
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use config::{init_logging, VcsConfig};
pub use error::{ErrorClass, Result, VcsError};
pub use logic::{
    ChangeClassifier, CommitGraph, CommitOutcome, KindPolicy, MergeEngine, MergeOutcome,
    MigrationGenerator, PolicyRegistry, Repository, Session,
};
pub use model::*;
pub use store::{MemoryStore, ObjectStore, ObjectStoreExt, Store};
