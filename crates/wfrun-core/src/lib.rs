//! Workflow run engine and repository trait definitions for wfrun.
//!
//! This crate defines the "ports" (repository and context store traits) that
//! the infrastructure layer implements, plus the engine that advances runs.
//! It depends only on `wfrun-types`, never on `wfrun-infra` or any database
//! crate.

pub mod repository;
pub mod workflow;
