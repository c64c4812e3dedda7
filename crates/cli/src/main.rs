//! appctl CLI - run a local command under lifecycle control.

mod job;

use anyhow::Result;
use appctl_apps::SubprocessError;
use appctl_core::{legal, AppState, Controller, ControllerError, StateSet};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::job::JobFile;

#[derive(Parser)]
#[command(name = "appctl")]
#[command(about = "Run external computations under lifecycle control", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and wait for it
    Run {
        /// Give up (and cancel) after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Fixed poll interval in milliseconds
        #[arg(long)]
        interval: Option<u64>,
        /// JSON job file
        #[arg(long)]
        job: Option<PathBuf>,
        /// Program and arguments
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Print the legal states of each operation
    StateTable,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            timeout,
            interval,
            job,
            command,
        } => {
            let job = match job {
                Some(path) => JobFile::load(&path)?,
                None => JobFile::default(),
            };
            let job = job.merge(command, timeout, interval);
            let code = run(job).await?;
            std::process::exit(code);
        }
        Commands::StateTable => {
            print_state_table();
        }
    }

    Ok(())
}

/// Run the job to completion; returns the exit code to forward.
async fn run(job: JobFile) -> Result<i32> {
    let timeout = job.timeout();
    let app = job.into_app()?;
    let command_line = app.command_line();
    let controller = Controller::new(app);

    info!("Running `{}` as {}", command_line, controller.id());
    controller.start().await?;

    let joined = tokio::select! {
        joined = controller.join(timeout) => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling `{}`", command_line);
            controller.cancel().await?;
            return Ok(130);
        }
    };

    match joined {
        Ok(output) => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            info!("Finished in {:.2?}", output.duration);
            Ok(output.exit_code)
        }
        Err(ControllerError::Timeout(limit)) => {
            warn!("`{}` did not finish within {:?}, cancelling", command_line, limit);
            controller.cancel().await?;
            Ok(124)
        }
        Err(ControllerError::Evaluation(source)) => {
            eprintln!("{:#}", source);
            match source.downcast_ref::<SubprocessError>() {
                Some(SubprocessError::NonZeroExit { exit_code, .. }) if *exit_code > 0 => {
                    Ok(*exit_code)
                }
                _ => Ok(1),
            }
        }
        Err(err) => {
            eprintln!("{}", err);
            Ok(1)
        }
    }
}

fn print_state_table() {
    let rows: [(&str, StateSet); 5] = [
        ("start", legal::START),
        ("join", legal::JOIN),
        ("cancel", legal::CANCEL),
        ("get_app_state", StateSet::ANY),
        ("clean_up", StateSet::ANY),
    ];

    println!("{:<14} legal states", "operation");
    for (operation, states) in rows {
        println!("{:<14} {}", operation, states);
    }

    println!();
    let terminal: Vec<String> = AppState::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.to_string())
        .collect();
    println!("terminal: {}", terminal.join(", "));
}
