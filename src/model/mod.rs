pub mod branch;
pub mod commit;
pub mod common;
pub mod diff;
pub mod entity;
pub mod merge;
pub mod migration;
pub mod tree;

pub use branch::*;
pub use commit::*;
pub use common::*;
pub use diff::*;
pub use entity::*;
pub use merge::*;
pub use migration::*;
pub use tree::*;
