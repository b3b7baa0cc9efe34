mod commands;
mod configs;
mod control;
mod daemon;
mod error;
mod pidfile;
mod process;
mod signals;
mod socket;

use crate::configs::Config;
use crate::daemon::LaunchOptions;
use crate::process::types::RunOptions;
use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PROCFLEET_LOG";

#[derive(Parser, Debug)]
#[command(version, about = "Runs and supervises the processes of a Procfile")]
struct Args {
    /// Application root containing the Procfile
    #[arg(
        short,
        long,
        env = "PROCFLEET_ROOT",
        value_name = "DIR",
        default_value = "."
    )]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the supervisor, or start processes on a running one
    Start {
        /// Process types or instances, e.g. `web,worker.2`
        #[arg(short, long, value_delimiter = ',')]
        processes: Vec<String>,
        /// Stay attached to the terminal
        #[arg(short, long)]
        foreground: bool,
        /// Remove pid files left by a previous supervisor
        #[arg(long)]
        clean: bool,
        /// Leave crashed processes down
        #[arg(long)]
        no_respawn: bool,
        /// Stop everything when any process crashes
        #[arg(long)]
        brittle: bool,
        /// Exit once no processes are running
        #[arg(long)]
        stop_when_none: bool,
    },
    Stop {
        #[arg(short, long, value_delimiter = ',')]
        processes: Vec<String>,
        /// Also stop the supervisor once the processes have exited
        #[arg(short, long)]
        stop_supervisor: bool,
    },
    Restart {
        #[arg(short, long, value_delimiter = ',')]
        processes: Vec<String>,
        /// Tag passed to the new instances as PROC_TAG
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Reload the Procfile and options without touching processes
    Reload,
    /// Start or stop processes to match the configured quantities
    CheckConcurrency {
        /// Use the configuration already loaded by the supervisor
        #[arg(long)]
        no_reload: bool,
    },
    Status {
        #[arg(long)]
        json: bool,
    },
    /// SIGKILL every process with a pid file
    Kill,
}

fn selection(processes: Vec<String>) -> Option<Vec<String>> {
    Some(processes).filter(|p| !p.is_empty())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if std::env::var(LOG_ENV).is_err() {
        std::env::set_var(LOG_ENV, "info");
    }
    let daemonizing = matches!(args.command, Command::Start { foreground: false, .. });
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env(LOG_ENV))
        .with_ansi(!daemonizing)
        .init();

    let config = Config::load(&args.root).wrap_err("Failed to load config")?;

    match args.command {
        Command::Start {
            processes,
            foreground,
            clean,
            no_respawn,
            brittle,
            stop_when_none,
        } => commands::start(
            config,
            LaunchOptions {
                foreground,
                clean,
                processes: selection(processes),
                run: RunOptions {
                    respawn: !no_respawn,
                    brittle,
                    stop_when_none,
                },
            },
        ),
        Command::Stop {
            processes,
            stop_supervisor,
        } => commands::stop(&config, selection(processes), stop_supervisor),
        Command::Restart { processes, tag } => commands::restart(&config, selection(processes), tag),
        Command::Reload => commands::reload(&config),
        Command::CheckConcurrency { no_reload } => commands::check_concurrency(&config, !no_reload),
        Command::Status { json } => commands::status(&config, json),
        Command::Kill => commands::kill_all(&config),
    }
}
