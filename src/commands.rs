use crate::configs::Config;
use crate::control::{
    self, CheckConcurrencyParams, ClientError, Operation, Request, RestartParams, StartParams,
    StopParams,
};
use crate::daemon::{self, LaunchOptions};
use crate::pidfile;
use crate::process::types::{
    ConcurrencyChange, InstanceDescriptor, ReloadSummary, RestartPair, SpawnOutcome, StatusReport,
};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Starts a supervisor, or asks a running one to start the given processes.
pub fn start(config: Config, options: LaunchOptions) -> Result<()> {
    if pidfile::supervisor_running(&config).is_none() {
        return daemon::launch(config, options);
    }
    let params = StartParams {
        processes: options.processes,
    };
    let outcomes: Vec<SpawnOutcome> = call(&config, Operation::StartProcesses, params)?;
    if outcomes.is_empty() {
        println!("No processes needed starting");
    }
    for outcome in outcomes {
        match outcome {
            SpawnOutcome::Started(instance) => println!("Started {}", describe(&instance)),
            SpawnOutcome::Failed(failure) => {
                println!("Failed to start {}: {}", failure.description, failure.error)
            }
        }
    }
    Ok(())
}

pub fn stop(config: &Config, processes: Option<Vec<String>>, stop_supervisor: bool) -> Result<()> {
    let params = StopParams {
        processes,
        stop_supervisor,
    };
    let stopped: Vec<InstanceDescriptor> = call(config, Operation::Stop, params)?;
    if stopped.is_empty() {
        println!("No processes were stopped");
    }
    for instance in stopped {
        println!("Stopping {}", describe(&instance));
    }
    if stop_supervisor {
        println!("Supervisor will exit once all processes have stopped");
    }
    Ok(())
}

pub fn restart(config: &Config, processes: Option<Vec<String>>, tag: Option<String>) -> Result<()> {
    let pairs: Vec<RestartPair> = call(config, Operation::Restart, RestartParams { processes, tag })?;
    if pairs.is_empty() {
        println!("No processes were restarted");
    }
    for RestartPair(old, new) in pairs {
        match (old, new) {
            (Some(old), Some(SpawnOutcome::Started(new))) if old.pid == new.pid => {
                println!("Signalled {} to restart in place", describe(&old))
            }
            (Some(old), Some(SpawnOutcome::Started(new))) => {
                println!("Restarted {} as {}", describe(&old), describe(&new))
            }
            (Some(old), Some(SpawnOutcome::Failed(failure))) => {
                println!("Failed to restart {}: {}", describe(&old), failure.error)
            }
            (Some(old), None) => println!("Stopped {}", describe(&old)),
            (None, Some(SpawnOutcome::Started(new))) => println!("Started {}", describe(&new)),
            (None, Some(SpawnOutcome::Failed(failure))) => {
                println!("Failed to start {}: {}", failure.description, failure.error)
            }
            (None, None) => {}
        }
    }
    Ok(())
}

pub fn reload(config: &Config) -> Result<()> {
    let summary: ReloadSummary = call(config, Operation::ReloadConfig, Value::Null)?;
    println!("Reloaded configuration");
    for (label, names) in [
        ("Added", summary.added),
        ("Removed", summary.removed),
        ("Changed", summary.changed),
    ] {
        if !names.is_empty() {
            println!("  {label}: {}", names.join(", "));
        }
    }
    Ok(())
}

pub fn check_concurrency(config: &Config, reload: bool) -> Result<()> {
    let change: ConcurrencyChange =
        call(config, Operation::CheckConcurrency, CheckConcurrencyParams { reload })?;
    if change.is_empty() {
        println!("Processes are running at the configured quantities");
    }
    for outcome in change.started {
        match outcome {
            SpawnOutcome::Started(instance) => println!("Started {}", describe(&instance)),
            SpawnOutcome::Failed(failure) => {
                println!("Failed to start {}: {}", failure.description, failure.error)
            }
        }
    }
    for instance in change.stopped {
        println!("Stopping {}", describe(&instance));
    }
    Ok(())
}

pub fn status(config: &Config, json: bool) -> Result<()> {
    let request = Request::new(Operation::Status, Value::Null)?;
    let result = send(config, &request)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    let report: StatusReport =
        serde_json::from_value(result).wrap_err("Unexpected status from supervisor")?;

    println!("{} (procfleet {})", report.app_name, report.version);
    println!("Root: {}", report.root.display());
    println!(
        "Supervisor pid {} since {}",
        report.supervisor.pid,
        report.supervisor.started_at.format("%Y-%m-%d %H:%M:%S %Z")
    );
    for spec in &report.processes {
        println!();
        println!(
            "\x1b[{}m{}\x1b[0m  quantity {}  {}",
            spec.log_color,
            spec.name,
            spec.quantity,
            serde_json::to_value(spec.restart_mode)?
                .as_str()
                .unwrap_or_default()
        );
        println!("  {}", spec.command);
        for instance in report.instances.get(&spec.name).into_iter().flatten() {
            println!(
                "  {:<16} {:<10} {:<9} respawns {:<3} {}",
                instance.description,
                instance
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into()),
                format!("{:?}", instance.status).to_lowercase(),
                instance.respawns,
                instance.tag.as_deref().unwrap_or_default()
            );
        }
    }
    if !report.messages.is_empty() {
        println!();
        for message in &report.messages {
            println!("! {}", message.message);
        }
    }
    Ok(())
}

/// SIGKILLs every process with a pid file, supervisor included, and forgets them.
pub fn kill_all(config: &Config) -> Result<()> {
    let mut targets =
        pidfile::instance_files(&config.pid_root).wrap_err("Failed to read pid directory")?;
    let supervisor = config.supervisor_pid_path();
    if let Ok(pid) = pidfile::read(&supervisor) {
        targets.push(("supervisor".into(), supervisor, pid));
    }
    for (name, path, pid) in targets {
        match pid {
            Some(pid) if pidfile::is_alive(pid) => match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => println!("Killed {name} (pid {pid})"),
                Err(err) => println!("Failed to kill {name} (pid {pid}): {err}"),
            },
            _ => {}
        }
        pidfile::remove(&path);
    }
    if config.sock_path.exists() {
        std::fs::remove_file(&config.sock_path).wrap_err("Failed to remove socket")?;
    }
    Ok(())
}

fn describe(instance: &InstanceDescriptor) -> String {
    match instance.pid {
        Some(pid) => format!("{} (pid {pid})", instance.description),
        None => instance.description.clone(),
    }
}

fn call<T: DeserializeOwned>(config: &Config, operation: Operation, params: impl Serialize) -> Result<T> {
    let request = Request::new(operation, params)?;
    let result = send(config, &request)?;
    serde_json::from_value(result).wrap_err("Unexpected response from supervisor")
}

fn send(config: &Config, request: &Request) -> Result<Value, ClientError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(control::request(&config.sock_path, request))
}
