//! Shared domain types for wfrun.
//!
//! The persisted data model of workflow runs: step definitions, execution
//! modes, the status tree with its phases and conditions, plus engine
//! configuration and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod condition;
pub mod config;
pub mod error;
pub mod workflow;
