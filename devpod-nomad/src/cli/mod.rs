// CLI argument parsing and definitions

use clap::{Parser, Subcommand};

/// Provider commands invoked by DevPod. Settings come from the environment
/// and the workspace's `.devpod/nomad.yaml`, not from flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "devpod-provider-nomad")]
#[command(about = "Run DevPod workspaces as Nomad jobs")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check that the Nomad cluster is reachable
    Init,
    /// Create or update the workspace job, provisioning its volume if needed
    Create,
    /// Purge the workspace job and its volume
    Delete,
    /// Print the workspace status (Running, Busy, Stopped or NotFound)
    Status,
    /// Run a command inside the workspace
    Command {
        /// Shell command to run; takes precedence over trailing arguments
        #[arg(long, env = "COMMAND", hide_env_values = true)]
        command: Option<String>,

        /// Program and arguments to run when no shell command is given
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::Create => "create",
            Command::Delete => "delete",
            Command::Status => "status",
            Command::Command { .. } => "command",
        }
    }
}
