//! Provider configuration.
//!
//! Every invocation resolves a single immutable [`ProviderOptions`] from three
//! layers: environment variables, the workspace's `.devpod/nomad.yaml`, and
//! built-in defaults. See [`ConfigLoader`] for the precedence rules and
//! [`ConfigValidator`] for the checks that run before any remote call.

pub mod config;
pub mod env;
pub mod file;
pub mod loader;
pub mod validate;

pub use config::{
    volume_id_for, ChangeMode, ComputeCapability, CsiOptions, DriverOverrides, GpuOptions,
    NomadConnection, ProviderOptions, Resources, SecretDefinition, StorageMode, VaultOptions,
};
pub use env::Environment;
pub use file::ConfigFile;
pub use loader::ConfigLoader;
pub use validate::ConfigValidator;
