use crate::configs::Config;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub fn write(path: &Path, pid: i32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{pid}\n"))
}

pub fn read(path: &Path) -> io::Result<Option<i32>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(?path, "Removed pid file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(?err, ?path, "Failed to remove pid file"),
    }
}

pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Pid of the running supervisor, if its pid file points at a live process.
pub fn supervisor_running(config: &Config) -> Option<i32> {
    read(&config.supervisor_pid_path())
        .ok()
        .flatten()
        .filter(|pid| is_alive(*pid))
}

/// Instance pid files under the pid root, as `(name, path, pid)`.
pub fn instance_files(pid_root: &Path) -> io::Result<Vec<(String, PathBuf, Option<i32>)>> {
    let entries = match std::fs::read_dir(pid_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".pid"))
        else {
            continue;
        };
        if name == "supervisor" {
            continue;
        }
        let name = name.to_string();
        let pid = read(&path)?;
        files.push((name, path, pid));
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, PartialEq, Eq)]
pub enum TidyOutcome {
    Removed { name: String },
    StillActive { name: String, pid: i32 },
}

/// Clears leftovers of a previous supervisor: its pid file and socket, and
/// instance pid files whose process is gone.
pub fn tidy(config: &Config) -> io::Result<Vec<TidyOutcome>> {
    remove(&config.supervisor_pid_path());
    if let Err(err) = std::fs::remove_file(&config.sock_path) {
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err);
        }
    }
    let mut outcomes = Vec::new();
    for (name, path, pid) in instance_files(&config.pid_root)? {
        match pid {
            Some(pid) if is_alive(pid) => outcomes.push(TidyOutcome::StillActive { name, pid }),
            _ => {
                remove(&path);
                outcomes.push(TidyOutcome::Removed { name });
            }
        }
    }
    Ok(outcomes)
}

/// Removes every instance pid file regardless of liveness.
pub fn clean(pid_root: &Path) -> io::Result<usize> {
    let files = instance_files(pid_root)?;
    for (_, path, _) in &files {
        remove(path);
    }
    Ok(files.len())
}
