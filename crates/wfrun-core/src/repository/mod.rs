//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (wfrun-infra) implements. `memory` holds in-process implementations.

pub mod context_store;
pub mod memory;
pub mod run;
