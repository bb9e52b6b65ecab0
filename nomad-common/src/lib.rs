//! Common utilities for the Nomad workspace provider
//!
//! Process-level concerns shared by the provider binary and its tests:
//! tracing setup and terminal inspection.

pub mod terminal;
pub mod tracing_init;
