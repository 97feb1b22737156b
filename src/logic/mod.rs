pub mod classify;
pub mod graph;
pub mod merge;
pub mod migration;
pub mod policy;
pub mod repository;
pub mod session;

pub use classify::*;
pub use graph::*;
pub use merge::*;
pub use migration::*;
pub use policy::*;
pub use repository::*;
pub use session::*;
