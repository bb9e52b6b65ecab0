// Command handlers for provider operations

use std::io::Write;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cli::{Args, Command};
use nomad_config::ConfigLoader;
use nomad_core::CancellationToken;
use nomad_provider::api::{NomadClient, VaultClient};
use nomad_provider::{CommandSpec, Workspace};

/// Resolve configuration, build the HTTP collaborators and run the command.
///
/// Returns the process exit code.
pub async fn execute_command(args: Args) -> Result<i32> {
    let options = ConfigLoader::from_process_env()
        .load()
        .context("failed to load provider configuration")?;

    let nomad = NomadClient::new(&options)?;
    let vault = VaultClient::new(&options.vault)?;
    let workspace = Workspace::new(&options, &nomad, &nomad, &vault);
    let cancel = CancellationToken::new();

    let mut stdout = std::io::stdout();
    dispatch(&args.command, &workspace, &cancel, &mut stdout).await
}

/// Main command dispatcher
pub async fn dispatch(
    command: &Command,
    workspace: &Workspace<'_>,
    cancel: &CancellationToken,
    out: &mut dyn Write,
) -> Result<i32> {
    debug!(command = command.name(), "dispatching");
    match command {
        Command::Init => {
            workspace.init().await?;
            Ok(0)
        }
        Command::Create => {
            workspace.create().await?;
            Ok(0)
        }
        Command::Delete => {
            workspace.delete().await?;
            Ok(0)
        }
        Command::Status => {
            let status = workspace.status().await?;
            writeln!(out, "{}", status)?;
            out.flush()?;
            Ok(0)
        }
        Command::Command { command, args } => {
            let spec = command_spec(command.as_deref(), args)?;
            Ok(workspace.command(&spec, cancel).await?)
        }
    }
}

/// `COMMAND` (or `--command`) runs through the shell; otherwise the trailing
/// arguments run as-is.
pub fn command_spec(command: Option<&str>, args: &[String]) -> Result<CommandSpec> {
    match command.filter(|c| !c.trim().is_empty()) {
        Some(command) => Ok(CommandSpec::Shell(command.to_string())),
        None if !args.is_empty() => Ok(CommandSpec::Argv(args.to_vec())),
        None => anyhow::bail!("no command given: set COMMAND or pass the command as arguments"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nomad_config::ProviderOptions;
    use nomad_provider::testing::{FakeScheduler, FakeSecretStore, FakeVolumes};

    #[test]
    fn test_command_spec_prefers_shell_command() {
        let spec = command_spec(Some("echo hi"), &["ls".to_string()]).unwrap();
        assert_eq!(spec, CommandSpec::Shell("echo hi".into()));
    }

    #[test]
    fn test_command_spec_falls_back_to_args() {
        let spec = command_spec(Some("  "), &["ls".to_string(), "-la".to_string()]).unwrap();
        assert_eq!(spec, CommandSpec::Argv(vec!["ls".into(), "-la".into()]));
    }

    #[test]
    fn test_command_spec_requires_something() {
        assert!(command_spec(None, &[]).is_err());
    }

    #[tokio::test]
    async fn test_status_prints_to_output() {
        let options = ProviderOptions::default();
        let scheduler = FakeScheduler::default().with_job_status("devpod", "running");
        let volumes = FakeVolumes::default();
        let secrets = FakeSecretStore::default();
        let workspace = Workspace::new(&options, &scheduler, &volumes, &secrets);
        let cancel = CancellationToken::new();

        let mut out = Vec::new();
        let code = dispatch(&Command::Status, &workspace, &cancel, &mut out)
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(String::from_utf8(out).unwrap(), "Running\n");
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let options = ProviderOptions::default();
        let scheduler = FakeScheduler::default();
        let volumes = FakeVolumes::default();
        let secrets = FakeSecretStore::default();
        let workspace = Workspace::new(&options, &scheduler, &volumes, &secrets);
        let cancel = CancellationToken::new();
        let mut out = Vec::new();

        dispatch(&Command::Create, &workspace, &cancel, &mut out)
            .await
            .unwrap();
        assert!(scheduler.registered_jobs().contains_key("devpod"));

        dispatch(&Command::Delete, &workspace, &cancel, &mut out)
            .await
            .unwrap();
        assert!(scheduler.registered_jobs().is_empty());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_init_failure_surfaces() {
        let options = ProviderOptions::default();
        let scheduler = FakeScheduler::default().unreachable();
        let volumes = FakeVolumes::default();
        let secrets = FakeSecretStore::default();
        let workspace = Workspace::new(&options, &scheduler, &volumes, &secrets);
        let cancel = CancellationToken::new();

        let err = dispatch(&Command::Init, &workspace, &cancel, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("connect to scheduler failed"));
    }
}
