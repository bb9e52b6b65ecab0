//! Running commands inside a ready workspace.
//!
//! Every run waits for readiness first instead of reusing an allocation id
//! from an earlier invocation: the scheduler may have replaced the
//! allocation in between.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{ExecIo, ExecRequest, SchedulerApi};
use crate::readiness::ReadinessPoller;
use nomad_common::terminal::{self, TerminalSize};
use nomad_core::error::{PhaseContext, Result, WorkspaceError};
use nomad_core::poll::PollSchedule;
use nomad_core::CancellationToken;

/// A command as given by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Run through `/bin/sh -c`.
    Shell(String),
    /// Run as-is.
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(script) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), script.clone()]
            }
            CommandSpec::Argv(argv) => argv.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Shell(script) => script.trim().is_empty(),
            CommandSpec::Argv(argv) => argv.is_empty(),
        }
    }
}

pub struct CommandChannel<'a> {
    scheduler: &'a dyn SchedulerApi,
    poller: ReadinessPoller<'a>,
}

impl<'a> CommandChannel<'a> {
    pub fn new(scheduler: &'a dyn SchedulerApi) -> Self {
        Self {
            scheduler,
            poller: ReadinessPoller::new(scheduler),
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.poller = self.poller.with_schedule(schedule);
        self
    }

    /// Wait for readiness, then run `command` in `task` over the given streams.
    ///
    /// Returns the remote exit code; a non-zero code is not an error.
    pub async fn run(
        &self,
        job_id: &str,
        task: &str,
        command: &CommandSpec,
        tty: bool,
        io: ExecIo,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        if command.is_empty() {
            return Err(WorkspaceError::Config("no command given".to_string()));
        }

        let ready = self
            .poller
            .wait(job_id, task, cancel)
            .await
            .phase("wait for allocation")?;

        info!(job_id, alloc_id = %ready.id, tty, "attaching to workspace");
        let request = ExecRequest {
            command: command.to_argv(),
            tty,
        };
        let code = self
            .scheduler
            .exec(&ready.id, task, request, io, cancel)
            .await
            .phase("run command")?;
        debug!(job_id, exit_code = code, "command finished");
        Ok(code)
    }

    /// Run `command` bound to this process's stdin, stdout and stderr.
    ///
    /// A pseudo-terminal is requested when stdin is a terminal, and window
    /// size changes are forwarded for the life of the session. SIGINT and
    /// SIGTERM cancel the session.
    pub async fn run_interactive(
        &self,
        job_id: &str,
        task: &str,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let tty = terminal::stdin_is_terminal();
        let signals = spawn_signal_listener(cancel.clone());

        let (resize, resizer) = if tty {
            let (tx, rx) = mpsc::channel(4);
            (Some(rx), Some(spawn_resize_forwarder(tx, cancel.clone())))
        } else {
            (None, None)
        };

        let io = ExecIo {
            stdin: Some(Box::new(tokio::io::stdin())),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            resize,
        };
        let result = self.run(job_id, task, command, tty, io, cancel).await;

        signals.abort();
        if let Some(resizer) = resizer {
            resizer.abort();
        }
        result
    }
}

/// Cancel `cancel` on SIGINT, or SIGTERM on Unix.
pub fn spawn_signal_listener(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = shutdown_signal() => {
                info!("received shutdown signal, cancelling");
                cancel.cancel();
            }
        }
    })
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            debug!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Send the current terminal size, then a new size after every SIGWINCH.
fn spawn_resize_forwarder(
    tx: mpsc::Sender<TerminalSize>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(size) = terminal::current_size() {
            if tx.send(size).await.is_err() {
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = forward_window_changes(&tx) => {}
        }
    })
}

#[cfg(unix)]
async fn forward_window_changes(tx: &mpsc::Sender<TerminalSize>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            debug!(error = %e, "cannot listen for SIGWINCH");
            return;
        }
    };
    while winch.recv().await.is_some() {
        if let Some(size) = terminal::current_size() {
            if tx.send(size).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(not(unix))]
async fn forward_window_changes(_tx: &mpsc::Sender<TerminalSize>) {
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{allocation, stub, FakeScheduler};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn ready_scheduler() -> FakeScheduler {
        FakeScheduler::default()
            .with_allocation_lists([Some(vec![stub("a1", "running")])])
            .with_allocation(allocation("a1", "ws", "running"))
    }

    #[test]
    fn test_shell_command_runs_through_sh() {
        assert_eq!(
            CommandSpec::Shell("echo $HOME".into()).to_argv(),
            vec!["/bin/sh", "-c", "echo $HOME"]
        );
        assert_eq!(
            CommandSpec::Argv(vec!["ls".into(), "-la".into()]).to_argv(),
            vec!["ls", "-la"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_exit_is_a_result() {
        let scheduler = ready_scheduler().with_exec_results([Some(0), Some(3)]);
        let cancel = CancellationToken::new();

        let code = CommandChannel::new(&scheduler)
            .run(
                "ws",
                "ws",
                &CommandSpec::Shell("false".into()),
                true,
                ExecIo::discard(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(code, 3);

        let calls = scheduler.exec_calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].tty);
        assert_eq!(calls[1].alloc_id, "a1");
        assert_eq!(calls[1].command, vec!["/bin/sh", "-c", "false"]);
        assert!(calls[1].tty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_reaches_caller() {
        let scheduler = ready_scheduler().with_exec_output(b"hello\n");
        let cancel = CancellationToken::new();
        let (writer, mut reader) = tokio::io::duplex(1024);
        let io = ExecIo {
            stdin: None,
            stdout: Box::new(writer),
            stderr: Box::new(tokio::io::sink()),
            resize: None,
        };

        let code = CommandChannel::new(&scheduler)
            .run("ws", "ws", &CommandSpec::Argv(vec!["echo".into()]), false, io, &cancel)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let mut output = String::new();
        reader.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_is_wrapped() {
        let scheduler = FakeScheduler::default();
        let cancel = CancellationToken::new();

        let err = CommandChannel::new(&scheduler)
            .with_schedule(PollSchedule::new(Duration::from_secs(1), Duration::from_secs(3)))
            .run(
                "ws",
                "ws",
                &CommandSpec::Shell("true".into()),
                false,
                ExecIo::discard(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("wait for allocation failed"));
        assert!(matches!(err.root(), WorkspaceError::Timeout { .. }));
        assert!(scheduler.exec_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_attached_session() {
        let scheduler = ready_scheduler().hanging_commands();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let err = CommandChannel::new(&scheduler)
            .run(
                "ws",
                "ws",
                &CommandSpec::Shell("sleep infinity".into()),
                false,
                ExecIo::discard(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.to_string().starts_with("run command failed"));
        assert_eq!(scheduler.exec_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let scheduler = FakeScheduler::default();
        let cancel = CancellationToken::new();

        let err = CommandChannel::new(&scheduler)
            .run(
                "ws",
                "ws",
                &CommandSpec::Argv(Vec::new()),
                false,
                ExecIo::discard(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Config(_)));
        assert_eq!(scheduler.allocation_list_calls(), 0);
    }
}
