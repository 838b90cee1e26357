//! Ambient stack shared by every other crate in the workspace: the error
//! enum, the config schema, logging setup, and the few type aliases
//! (`Nid`, `SnapshotId`, `Pos`) that name concepts rather than wrapping them.

pub mod config;
pub mod error;
pub mod ids;
pub mod log;

pub use config::Config;
pub use error::{Error, Result};
pub use ids::{Nid, Pos, SnapshotId};
