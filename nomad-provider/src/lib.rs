//! Workspace lifecycle engine for running DevPod workspaces as Nomad jobs.
//!
//! The engine turns a resolved [`ProviderOptions`] into a registered Nomad job,
//! provisions and tears down the optional CSI volume behind it, waits for the
//! workspace task to become usable, and runs commands inside it.
//!
//! Remote systems are reached through the [`api::SchedulerApi`],
//! [`api::VolumeApi`] and [`api::SecretStore`] traits. [`api::NomadClient`] and
//! [`api::VaultClient`] implement them over HTTP; the `testing` module provides
//! in-memory doubles.

// External crates
pub use nomad_config::ProviderOptions;
pub use nomad_core::error::{Result, WorkspaceError};

pub mod api;
pub mod command;
pub mod jobspec;
pub mod readiness;
pub mod templates;
pub mod volume;
pub mod workspace;

// When the `test-helpers` feature is enabled, include the in-memory collaborators.
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use command::{CommandChannel, CommandSpec};
pub use jobspec::JobSpecBuilder;
pub use readiness::{ReadinessPoller, ReadinessState, ReadyAllocation};
pub use templates::secret_templates;
pub use volume::{VolumeManager, VolumeOutcome};
pub use workspace::{Workspace, WorkspaceStatus};
