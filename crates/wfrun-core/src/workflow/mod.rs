//! Workflow engine core: definitions, planning, execution and status recording.
//!
//! - `definition` -- manifest parsing, validation, duration parsing
//! - `graph` -- step dependency graph and cycle detection
//! - `expression` -- JEXL condition evaluator
//! - `context` -- run context variables and the expression scope
//! - `action` -- step action trait, registry and built-in actions
//! - `step_runner` -- input/output binding and bounded concurrent invocation
//! - `plan` -- pure admission and aggregation rules
//! - `recorder` -- idempotent status persistence
//! - `scheduler` -- tick driver and run control operations

pub mod action;
pub mod context;
pub mod definition;
pub mod expression;
pub mod graph;
pub mod plan;
pub mod recorder;
pub mod scheduler;
pub mod step_runner;
