// External crates
use clap::Parser;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

// Internal imports
use nomad_core::WorkspaceError;

// Local modules
mod cli;
mod commands;

use cli::Args;
use commands::execute_command;

/// Exit code for a run interrupted by SIGINT or SIGTERM.
const EXIT_CANCELLED: i32 = 130;

fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<WorkspaceError>() {
        Some(e) if e.is_cancelled() => EXIT_CANCELLED,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries command output and status answers.
    if let Err(e) = nomad_common::tracing_init::init() {
        eprintln!("warning: {}", e);
    }

    let args = Args::parse();
    let request_id = Uuid::new_v4();
    let span = info_span!("request", request_id = %request_id, command = args.command.name());

    let code = match execute_command(args).instrument(span).await {
        Ok(code) => code,
        Err(e) => {
            debug!(error = ?e, "command failed");
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };

    // Exit explicitly: a blocked stdin reader would otherwise hold the runtime open.
    std::process::exit(code);
}
