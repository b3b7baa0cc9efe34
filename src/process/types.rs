use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl InstanceStatus {
    /// Counts towards the desired quantity.
    pub fn is_live(self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitStatus {
    Exited { code: i32 },
    Signaled { signal: i32 },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited { code } => write!(f, "exit code {code}"),
            ExitStatus::Signaled { signal } => write!(f, "signal {signal}"),
        }
    }
}

/// Rolling record of unintentional crashes for one slot.
#[derive(Debug, Clone, Default)]
pub struct RespawnHistory {
    crashes: VecDeque<Instant>,
    count: u32,
}

impl RespawnHistory {
    /// Records a crash at `now` and returns whether the slot may respawn.
    ///
    /// Crashes older than `window` are forgotten first. When `max` crashes
    /// remain inside the window the crash is not recorded and `false` is
    /// returned.
    pub fn record_crash(&mut self, now: Instant, window: Duration, max: u32) -> bool {
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        if self.crashes.len() >= max as usize {
            return false;
        }
        self.crashes.push_back(now);
        self.count += 1;
        true
    }

    /// Total respawns of this slot since it was last (re)started explicitly.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn recent(&self) -> usize {
        self.crashes.len()
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub process: String,
    pub index: u32,
    pub pid: Option<i32>,
    pub tag: Option<String>,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    /// Creation order across the supervisor's lifetime; lower is older.
    pub generation: u64,
    pub respawns: RespawnHistory,
    pub exit_status: Option<ExitStatus>,
    pub pid_file: PathBuf,
    pub ready_at: Option<Instant>,
    pub stopping_since: Option<Instant>,
    pub killed: bool,
    /// Why a crashed instance is not coming back.
    pub failure: Option<(MessageKind, String)>,
}

impl Instance {
    pub fn description(&self) -> String {
        format!("{}.{}", self.process, self.index)
    }

    pub fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor {
            description: self.description(),
            process: self.process.clone(),
            index: self.index,
            pid: self.pid,
            tag: self.tag.clone(),
            status: self.status,
            started_at: self.started_at,
            respawns: self.respawns.count(),
            exit_status: self.exit_status,
        }
    }
}

/// Wire representation of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub description: String,
    pub process: String,
    pub index: u32,
    pub pid: Option<i32>,
    pub tag: Option<String>,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub respawns: u32,
    pub exit_status: Option<ExitStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnFailure {
    pub description: String,
    pub process: String,
    pub index: u32,
    pub error: String,
}

/// Result of one spawn attempt; failures are reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpawnOutcome {
    Started(InstanceDescriptor),
    Failed(SpawnFailure),
}

impl SpawnOutcome {
    pub fn started(&self) -> Option<&InstanceDescriptor> {
        match self {
            SpawnOutcome::Started(descriptor) => Some(descriptor),
            SpawnOutcome::Failed(_) => None,
        }
    }

    pub fn failed(&self) -> Option<&SpawnFailure> {
        match self {
            SpawnOutcome::Started(_) => None,
            SpawnOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// `(old, new)`; either side may be missing when quantity changed. A
/// replacement that could not be brought up is reported as a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPair(pub Option<InstanceDescriptor>, pub Option<SpawnOutcome>);

impl RestartPair {
    pub fn replacement(&self) -> Option<&InstanceDescriptor> {
        self.1.as_ref().and_then(SpawnOutcome::started)
    }

    pub fn failure(&self) -> Option<&SpawnFailure> {
        self.1.as_ref().and_then(SpawnOutcome::failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyChange {
    pub started: Vec<SpawnOutcome>,
    pub stopped: Vec<InstanceDescriptor>,
}

impl ConcurrencyChange {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    CrashLoop,
    Crashed,
    IncorrectQuantity,
    SpawnFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub kind: MessageKind,
    pub process: String,
    pub instance: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub version: String,
    pub app_name: String,
    pub root: PathBuf,
    pub supervisor: SupervisorInfo,
    pub processes: Vec<crate::configs::ProcessSpec>,
    pub instances: std::collections::BTreeMap<String, Vec<InstanceDescriptor>>,
    pub messages: Vec<StatusMessage>,
}

/// Options fixed for the lifetime of one supervisor.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub respawn: bool,
    /// Any unintentional crash shuts the whole group down.
    pub brittle: bool,
    pub stop_when_none: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            respawn: true,
            brittle: false,
            stop_when_none: false,
        }
    }
}
