//! Generic column-family key-value layer. Deliberately schema-agnostic —
//! table names, key encodings and value formats all belong to
//! `sync3-service::store`, the same split the teacher keeps between its own
//! `database` crate (raw `Engine`/`Map`) and the services that pick column
//! names.

pub mod engine;
pub mod map;

pub use engine::{Batch, Engine};
pub use map::Map;
