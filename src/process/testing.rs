//! Scripted process backend for exercising the supervisor without real children.

use super::run::{ProcessBackend, SpawnRequest};
use super::types::ExitStatus;
use crate::configs::{Config, LOCAL_FILE, OPTIONS_FILE, PROCFILE};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

/// Spawns and signals in the order the backend saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Spawned(i32),
    Signalled(i32, Signal),
}

#[derive(Default)]
struct FakeState {
    next_pid: i32,
    spawned: Vec<(i32, SpawnRequest)>,
    signals: Vec<(i32, Signal)>,
    events: Vec<BackendEvent>,
    exits: VecDeque<(i32, ExitStatus)>,
    fail_spawns: usize,
    exit_on_term: bool,
}

#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                next_pid: 1000,
                exit_on_term: true,
                ..Default::default()
            })),
        }
    }

    /// Whether SIGTERM/SIGKILL make the target exit on the next reap.
    pub fn set_exit_on_term(&self, exit: bool) {
        self.state.lock().exit_on_term = exit;
    }

    pub fn fail_next_spawns(&self, count: usize) {
        self.state.lock().fail_spawns = count;
    }

    pub fn exit(&self, pid: i32, status: ExitStatus) {
        self.state.lock().exits.push_back((pid, status));
    }

    pub fn crash(&self, pid: i32) {
        self.exit(pid, ExitStatus::Exited { code: 1 });
    }

    pub fn spawned(&self) -> Vec<(i32, SpawnRequest)> {
        self.state.lock().spawned.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().spawned.len()
    }

    pub fn signals(&self) -> Vec<(i32, Signal)> {
        self.state.lock().signals.clone()
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }
}

impl ProcessBackend for FakeBackend {
    fn spawn(&self, request: &SpawnRequest) -> std::io::Result<i32> {
        let mut state = self.state.lock();
        if state.fail_spawns > 0 {
            state.fail_spawns -= 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No such file or directory",
            ));
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.spawned.push((pid, request.clone()));
        state.events.push(BackendEvent::Spawned(pid));
        Ok(pid)
    }

    fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()> {
        let mut state = self.state.lock();
        state.signals.push((pid, signal));
        state.events.push(BackendEvent::Signalled(pid, signal));
        if state.exit_on_term && matches!(signal, Signal::SIGTERM | Signal::SIGKILL) {
            state.exits.push_back((
                pid,
                ExitStatus::Signaled {
                    signal: signal as i32,
                },
            ));
        }
        Ok(())
    }

    fn try_reap(&self) -> Option<(i32, ExitStatus)> {
        self.state.lock().exits.pop_front()
    }
}

/// Writes a Procfile (and optional options file) into `dir` and loads it.
pub fn write_config(dir: &Path, procfile: &str, options: Option<&str>) -> Config {
    std::fs::write(dir.join(PROCFILE), procfile).unwrap();
    match options {
        Some(options) => std::fs::write(dir.join(OPTIONS_FILE), options).unwrap(),
        None => {
            let _ = std::fs::remove_file(dir.join(OPTIONS_FILE));
        }
    }
    let _ = std::fs::remove_file(dir.join(LOCAL_FILE));
    Config::load(dir).unwrap()
}
