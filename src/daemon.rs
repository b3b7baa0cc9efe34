use crate::configs::Config;
use crate::pidfile::{self, TidyOutcome};
use crate::process::run::OsBackend;
use crate::process::types::{RunOptions, SpawnOutcome};
use crate::process::Supervisor;
use crate::signals::{self, SignalRouter};
use crate::socket;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use nix::unistd::{dup2, fork, setsid, ForkResult};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub foreground: bool,
    /// Forget every instance pid file left by a previous supervisor.
    pub clean: bool,
    pub processes: Option<Vec<String>>,
    pub run: RunOptions,
}

/// Starts a supervisor for `config`, detaching first unless running in the foreground.
///
/// Forking happens before the runtime exists, so this must be called from a
/// plain synchronous `main`.
pub fn launch(config: Config, options: LaunchOptions) -> Result<()> {
    if let Some(pid) = pidfile::supervisor_running(&config) {
        bail!("Supervisor is already running with pid {pid}");
    }
    prepare_pid_root(&config, options.clean)?;
    if !options.foreground {
        daemonize(&config.log_path)?;
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Failed to build runtime")?;
    runtime.block_on(run(config, options))
}

fn prepare_pid_root(config: &Config, clean: bool) -> Result<()> {
    std::fs::create_dir_all(&config.pid_root).wrap_err("Failed to create pid directory")?;
    if clean {
        let removed = pidfile::clean(&config.pid_root).wrap_err("Failed to clean pid directory")?;
        info!(removed, "Cleaned pid directory");
    }
    let still_active: Vec<String> = pidfile::tidy(config)
        .wrap_err("Failed to tidy pid directory")?
        .into_iter()
        .filter_map(|outcome| match outcome {
            TidyOutcome::StillActive { name, pid } => Some(format!("{name} (pid {pid})")),
            TidyOutcome::Removed { name } => {
                info!("Removed stale pid file for {name}");
                None
            }
        })
        .collect();
    if !still_active.is_empty() {
        bail!(
            "Processes from a previous supervisor are still running: {}. Stop them or start with --clean",
            still_active.join(", ")
        );
    }
    Ok(())
}

fn daemonize(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).wrap_err("Failed to create log directory")?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .wrap_err("Failed to open supervisor log")?;
    let null = File::open("/dev/null").wrap_err("Failed to open /dev/null")?;

    // SAFETY: no runtime or other threads exist yet.
    match unsafe { fork() }.wrap_err("Failed to fork")? {
        ForkResult::Parent { child } => {
            println!("Started supervisor with pid {child}");
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }
    setsid().wrap_err("Failed to create session")?;
    dup2(null.as_raw_fd(), 0).wrap_err("Failed to redirect stdin")?;
    dup2(log.as_raw_fd(), 1).wrap_err("Failed to redirect stdout")?;
    dup2(log.as_raw_fd(), 2).wrap_err("Failed to redirect stderr")?;
    Ok(())
}

#[instrument(skip_all)]
async fn run(config: Config, options: LaunchOptions) -> Result<()> {
    let pid_path = config.supervisor_pid_path();
    let sock_path = config.sock_path.clone();
    pidfile::write(&pid_path, std::process::id() as i32)
        .wrap_err("Failed to write supervisor pid file")?;
    info!(root = ?config.root, pid = std::process::id(), "Supervisor started");

    let supervisor = Arc::new(Mutex::new(Supervisor::new(
        config,
        options.run,
        Box::new(OsBackend),
    )));
    let result = serve(supervisor, &sock_path, options.processes).await;

    pidfile::remove(&pid_path);
    if let Err(err) = std::fs::remove_file(&sock_path) {
        warn!(?err, "Failed to remove socket");
    }
    result
}

async fn serve(
    supervisor: Arc<Mutex<Supervisor>>,
    sock_path: &Path,
    processes: Option<Vec<String>>,
) -> Result<()> {
    let server = socket::setup(sock_path, supervisor.clone()).await?;
    let mut signals = SignalRouter::install().wrap_err("Failed to install signal handlers")?;

    {
        let mut supervisor = supervisor.lock().await;
        let outcomes = supervisor
            .start(processes.as_deref())
            .wrap_err("Failed to start processes")?;
        for outcome in outcomes {
            if let SpawnOutcome::Failed(failure) = outcome {
                error!(error = %failure.error, "Could not start {}", failure.description);
            }
        }
    }

    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            Some(event) = signals.recv() => {
                let mut supervisor = supervisor.lock().await;
                signals::apply(event, &mut supervisor);
                if supervisor.should_exit() {
                    break;
                }
            }
            _ = tick.tick() => {
                let mut supervisor = supervisor.lock().await;
                supervisor.tick();
                if supervisor.should_exit() {
                    break;
                }
            }
        }
    }

    server.abort();
    info!("All processes stopped, supervisor exiting");
    Ok(())
}
