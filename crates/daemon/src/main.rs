//! `drayhorse` — process supervision CLI for the job-queue worker.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

mod runner;
mod settings;
mod shell_lock;
mod supervisor;
mod watch;

use settings::Settings;
use shell_lock::CommandLock;
use supervisor::{DaemonError, ProcessStatus, Supervisor};
use watch::SysinfoSampler;

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 2;
const EXIT_NOT_RUNNING: u8 = 3;
const EXIT_LOCK_HELD: u8 = 4;

const STOP_WAIT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "drayhorse", about = "Database-backed job queue worker")]
struct Cli {
    /// Directory for pid and lock files.
    #[arg(long, default_value = "/tmp/drayhorse")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker process in the background
    Start,
    /// Gracefully stop the worker process
    Stop,
    /// Stop the worker process if running, then start a fresh one
    Restart,
    /// Report whether the worker process is running
    Status,
    /// One-shot health check: start if down, restart if over the memory ceiling
    Watch,
    /// Run the engine in the foreground (used internally by `start`)
    Run,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let supervisor = Supervisor::new(&cli.state_dir);

    // `run` is the managed child; everything else is an operator command.
    let exit = match cli.command {
        Command::Run => match runner::run_foreground(&settings) {
            Ok(()) => EXIT_OK,
            Err(err) => {
                eprintln!("drayhorse: {err:#}");
                EXIT_FAILED
            }
        },
        command => run_operator_command(command, &supervisor, &settings),
    };
    ExitCode::from(exit)
}

fn run_operator_command(command: Command, supervisor: &Supervisor, settings: &Settings) -> u8 {
    let changes_state = !matches!(command, Command::Status);
    let _lock = if changes_state && settings.config.lock_shell_commands {
        match CommandLock::acquire(&supervisor.lock_file()) {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                eprintln!("drayhorse: another command is in progress");
                return EXIT_LOCK_HELD;
            }
            Err(err) => {
                eprintln!("drayhorse: failed to take command lock: {err}");
                return EXIT_FAILED;
            }
        }
    } else {
        None
    };

    let outcome = match command {
        Command::Start => supervisor.start().map(|pid| {
            println!("started worker process (pid {pid})");
        }),
        Command::Stop => supervisor.stop(STOP_WAIT).map(|()| {
            println!("stopped worker process");
        }),
        Command::Restart => supervisor.restart(STOP_WAIT).map(|pid| {
            println!("restarted worker process (pid {pid})");
        }),
        Command::Status => match supervisor.status() {
            ProcessStatus::Running { pid } => {
                println!("worker process running (pid {pid})");
                return EXIT_OK;
            }
            ProcessStatus::NotRunning => {
                println!("worker process not running");
                return EXIT_NOT_RUNNING;
            }
        },
        Command::Watch => {
            watch::run_watch(supervisor, &settings.config, &SysinfoSampler).map(|_| ())
        }
        Command::Run => unreachable!("handled by main"),
    };

    match outcome {
        Ok(()) => EXIT_OK,
        Err(DaemonError::AlreadyRunning(pid)) => {
            eprintln!("drayhorse: worker already running (pid {pid})");
            EXIT_ALREADY_RUNNING
        }
        Err(DaemonError::NotRunning) => {
            eprintln!("drayhorse: worker is not running");
            EXIT_NOT_RUNNING
        }
        Err(DaemonError::LockHeld) => {
            eprintln!("drayhorse: another command is in progress");
            EXIT_LOCK_HELD
        }
        Err(DaemonError::Other(err)) => {
            eprintln!("drayhorse: {err:#}");
            EXIT_FAILED
        }
    }
}
