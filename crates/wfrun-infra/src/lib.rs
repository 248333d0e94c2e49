//! Infrastructure layer for wfrun.
//!
//! Contains implementations of the repository traits defined in `wfrun-core`
//! (SQLite run repository and context store) and the engine config loader.

pub mod config;
pub mod sqlite;
