mod event_handlers;
pub mod run;
#[cfg(test)]
pub mod testing;
pub mod types;

use self::run::{prepare, ProcessBackend};
use self::types::*;
use crate::configs::{Config, ProcessSpec, RestartMode};
use crate::error::SupervisorError;
use crate::pidfile;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const WAIT_STEP: Duration = Duration::from_millis(50);

/// Process names from a request: `web` selects a type, `web.2` one instance.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    entries: Option<Vec<(String, Option<u32>)>>,
}

impl Selection {
    pub fn all() -> Self {
        Self { entries: None }
    }

    fn includes_process(&self, process: &str) -> bool {
        match &self.entries {
            None => true,
            Some(entries) => entries.iter().any(|(name, _)| name == process),
        }
    }

    fn includes(&self, process: &str, index: u32) -> bool {
        match &self.entries {
            None => true,
            Some(entries) => entries
                .iter()
                .any(|(name, i)| name == process && i.map_or(true, |i| i == index)),
        }
    }

    /// Selected as a whole type rather than by instance.
    fn whole_process(&self, process: &str) -> bool {
        match &self.entries {
            None => true,
            Some(entries) => entries
                .iter()
                .any(|(name, i)| name == process && i.is_none()),
        }
    }
}

pub struct Supervisor {
    config: Config,
    options: RunOptions,
    backend: Box<dyn ProcessBackend>,
    instances: Vec<Instance>,
    next_generation: u64,
    pid: u32,
    started_at: DateTime<Utc>,
    shutting_down: bool,
    /// Latest spawn error per process type, cleared by the next successful spawn.
    spawn_failures: BTreeMap<String, String>,
}

impl Supervisor {
    pub fn new(config: Config, options: RunOptions, backend: Box<dyn ProcessBackend>) -> Self {
        Self {
            config,
            options,
            backend,
            instances: Vec::new(),
            next_generation: 0,
            pid: std::process::id(),
            started_at: Utc::now(),
            shutting_down: false,
            spawn_failures: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// True once nothing is left running and the supervisor was asked to go away.
    pub fn should_exit(&self) -> bool {
        let any_alive = self.instances.iter().any(|i| i.pid.is_some());
        !any_alive && (self.shutting_down || self.options.stop_when_none)
    }

    pub fn live_count(&self, process: &str) -> usize {
        self.instances
            .iter()
            .filter(|i| i.process == process && i.status.is_live())
            .count()
    }

    /// Resolves requested names, failing on any name that is not known.
    pub fn select(&self, names: Option<&[String]>) -> Result<Selection, SupervisorError> {
        let names = match names {
            Some(names) if !names.is_empty() => names,
            _ => return Ok(Selection::all()),
        };
        let mut entries = Vec::with_capacity(names.len());
        for raw in names {
            let raw = raw.trim();
            if self.knows_process(raw) {
                entries.push((raw.to_string(), None));
                continue;
            }
            match raw.rsplit_once('.') {
                Some((name, index)) if self.knows_process(name) => {
                    let index = index
                        .parse::<u32>()
                        .map_err(|_| SupervisorError::UnknownProcess(raw.to_string()))?;
                    entries.push((name.to_string(), Some(index)));
                }
                _ => return Err(SupervisorError::UnknownProcess(raw.to_string())),
            }
        }
        Ok(Selection {
            entries: Some(entries),
        })
    }

    fn knows_process(&self, name: &str) -> bool {
        self.config.processes.contains_key(name) || self.instances.iter().any(|i| i.process == name)
    }

    #[instrument(skip(self))]
    pub fn start(&mut self, names: Option<&[String]>) -> Result<Vec<SpawnOutcome>, SupervisorError> {
        let selection = self.select(names)?;
        if self.shutting_down {
            warn!("Supervisor is shutting down, not starting processes");
            return Ok(Vec::new());
        }
        let specs: Vec<ProcessSpec> = self
            .config
            .processes
            .values()
            .filter(|s| selection.includes_process(&s.name))
            .cloned()
            .collect();
        let mut outcomes = Vec::new();
        for spec in specs {
            outcomes.extend(self.fill(&spec));
        }
        Ok(outcomes)
    }

    /// Clears crashed slots of `spec` and spawns until it reaches its quantity.
    fn fill(&mut self, spec: &ProcessSpec) -> Vec<SpawnOutcome> {
        self.instances
            .retain(|i| !(i.process == spec.name && i.status == InstanceStatus::Crashed));
        let deficit = (spec.quantity as usize).saturating_sub(self.live_count(&spec.name));
        (0..deficit)
            .map(|_| {
                let index = self.free_index(&spec.name);
                let spawned = self.spawn_slot(spec, index, None, RespawnHistory::default(), None);
                self.outcome(spawned)
            })
            .collect()
    }

    #[instrument(skip(self))]
    pub fn stop(
        &mut self,
        names: Option<&[String]>,
        stop_supervisor: bool,
    ) -> Result<Vec<InstanceDescriptor>, SupervisorError> {
        let selection = self.select(names)?;
        Ok(self.stop_selected(&selection, stop_supervisor))
    }

    /// Stops everything and exits once the last instance is reaped.
    pub fn shutdown(&mut self) -> Vec<InstanceDescriptor> {
        self.stop_selected(&Selection::all(), true)
    }

    fn stop_selected(&mut self, selection: &Selection, stop_supervisor: bool) -> Vec<InstanceDescriptor> {
        if stop_supervisor && !self.shutting_down {
            info!("Supervisor will exit once all processes have stopped");
            self.shutting_down = true;
        }
        let targets: Vec<u64> = self
            .instances
            .iter()
            .filter(|i| i.status.is_live() && selection.includes(&i.process, i.index))
            .map(|i| i.generation)
            .collect();
        let stopped = targets
            .into_iter()
            .filter_map(|generation| self.terminate(generation))
            .collect();
        self.reap_children();
        stopped
    }

    #[instrument(skip(self))]
    pub async fn restart(
        &mut self,
        names: Option<&[String]>,
        tag: Option<String>,
    ) -> Result<Vec<RestartPair>, SupervisorError> {
        let selection = self.select(names)?;
        if self.shutting_down {
            warn!("Supervisor is shutting down, not restarting processes");
            return Ok(Vec::new());
        }

        let process_names: BTreeSet<String> = self
            .config
            .processes
            .keys()
            .chain(self.instances.iter().map(|i| &i.process))
            .filter(|name| selection.includes_process(name))
            .cloned()
            .collect();

        let mut pairs = Vec::new();
        for name in process_names {
            let mut targets: Vec<&Instance> = self
                .instances
                .iter()
                .filter(|i| {
                    i.process == name
                        && (i.status.is_live() || i.status == InstanceStatus::Crashed)
                        && selection.includes(&i.process, i.index)
                })
                .collect();
            targets.sort_by_key(|i| i.index);
            let targeted_live = targets.iter().filter(|i| i.status.is_live()).count();
            let targets: Vec<u64> = targets.into_iter().map(|i| i.generation).collect();

            let Some(spec) = self.config.process(&name).cloned() else {
                for generation in targets {
                    pairs.push(RestartPair(self.retire(generation), None));
                }
                continue;
            };

            let untouched = self.live_count(&name) - targeted_live;
            let capacity = (spec.quantity as usize).saturating_sub(untouched);
            let replaced = targets.len().min(capacity);
            for (position, generation) in targets.into_iter().enumerate() {
                let pair = if position >= replaced {
                    RestartPair(self.retire(generation), None)
                } else {
                    self.restart_one(&spec, generation, tag.clone()).await
                };
                pairs.push(pair);
            }

            if selection.whole_process(&name) {
                let deficit = (spec.quantity as usize).saturating_sub(untouched + replaced);
                for _ in 0..deficit {
                    let index = self.free_index(&name);
                    let spawned =
                        self.spawn_slot(&spec, index, tag.clone(), RespawnHistory::default(), None);
                    pairs.push(RestartPair(None, Some(self.outcome(spawned))));
                }
            }
        }
        Ok(pairs)
    }

    async fn restart_one(&mut self, spec: &ProcessSpec, generation: u64, tag: Option<String>) -> RestartPair {
        let Some(old) = self.find(generation) else {
            return RestartPair(None, None);
        };
        if old.status == InstanceStatus::Crashed {
            let index = old.index;
            let old = self.retire(generation);
            let spawned = self.spawn_slot(spec, index, tag, RespawnHistory::default(), None);
            return RestartPair(old, Some(self.outcome(spawned)));
        }
        match spec.restart_mode {
            RestartMode::StartBeforeStop => self.restart_start_first(spec, generation, tag).await,
            RestartMode::StopBeforeStart => self.restart_stop_first(spec, generation, tag).await,
            RestartMode::Usr1 => self.restart_in_place(spec, generation, Signal::SIGUSR1, tag),
            RestartMode::Usr2 => self.restart_in_place(spec, generation, Signal::SIGUSR2, tag),
        }
    }

    async fn restart_start_first(&mut self, spec: &ProcessSpec, old: u64, tag: Option<String>) -> RestartPair {
        let old_descriptor = self.find(old).map(Instance::descriptor);
        let index = self.free_index(&spec.name);
        let ready_at = Instant::now() + spec.readiness_grace;
        let new = match self.spawn_slot(spec, index, tag, RespawnHistory::default(), Some(ready_at)) {
            Ok(new) => new,
            Err(failure) => {
                warn!(error = %failure.error, "Replacement {} failed to spawn, keeping the old instance", failure.description);
                return RestartPair(old_descriptor, Some(SpawnOutcome::Failed(failure)));
            }
        };

        self.await_ready(new, ready_at).await;

        let ready = match self.find_mut(new) {
            Some(instance) if instance.status.is_live() => {
                instance.status = InstanceStatus::Running;
                instance.ready_at = None;
                Some(instance.descriptor())
            }
            _ => None,
        };
        let Some(new_descriptor) = ready else {
            let failure = SpawnFailure {
                description: format!("{}.{index}", spec.name),
                process: spec.name.clone(),
                index,
                error: "exited during its readiness grace".into(),
            };
            warn!("Replacement {} {}, keeping the old instance", failure.description, failure.error);
            self.spawn_failures.insert(
                spec.name.clone(),
                format!("replacement {} {}", failure.description, failure.error),
            );
            return RestartPair(old_descriptor, Some(SpawnOutcome::Failed(failure)));
        };
        let old_descriptor = self.terminate(old).or(old_descriptor);
        self.reap_children();
        RestartPair(old_descriptor, Some(SpawnOutcome::Started(new_descriptor)))
    }

    async fn restart_stop_first(&mut self, spec: &ProcessSpec, old: u64, tag: Option<String>) -> RestartPair {
        let Some(index) = self.find(old).map(|i| i.index) else {
            return RestartPair(None, None);
        };
        let old_descriptor = self.terminate(old);
        self.await_exit(old, spec.term_timeout, spec.kill_timeout).await;
        let index = if self.index_taken(&spec.name, index) {
            self.free_index(&spec.name)
        } else {
            index
        };
        let spawned = self.spawn_slot(spec, index, tag, RespawnHistory::default(), None);
        RestartPair(old_descriptor, Some(self.outcome(spawned)))
    }

    fn restart_in_place(
        &mut self,
        spec: &ProcessSpec,
        generation: u64,
        signal: Signal,
        tag: Option<String>,
    ) -> RestartPair {
        let Some(instance) = self.instances.iter_mut().find(|i| i.generation == generation) else {
            return RestartPair(None, None);
        };
        let before = instance.descriptor();
        if let Some(pid) = instance.pid {
            match self.backend.signal(pid, signal) {
                Ok(()) => info!(pid, "Sent {} to {}", signal, before.description),
                Err(err) => warn!(?err, pid, "Failed to send {} to {}", signal, before.description),
            }
        }
        if let (true, Some(tag)) = (spec.taggable, tag) {
            instance.tag = Some(tag);
        }
        let after = instance.descriptor();
        RestartPair(Some(before), Some(SpawnOutcome::Started(after)))
    }

    /// Waits until the instance's readiness grace has passed, reaping meanwhile.
    async fn await_ready(&mut self, generation: u64, deadline: Instant) {
        loop {
            self.reap_children();
            let alive = self.find(generation).map_or(false, |i| i.status.is_live());
            let now = Instant::now();
            if !alive || now >= deadline {
                return;
            }
            tokio::time::sleep(WAIT_STEP.min(deadline - now)).await;
        }
    }

    /// Waits for a terminated instance to be reaped, escalating to SIGKILL.
    async fn await_exit(&mut self, generation: u64, term_timeout: Duration, kill_timeout: Duration) {
        let started = Instant::now();
        loop {
            self.reap_children();
            let Some(instance) = self.instances.iter_mut().find(|i| i.generation == generation) else {
                return;
            };
            let waited = started.elapsed();
            if waited >= term_timeout + kill_timeout {
                warn!("{} did not exit, giving up waiting", instance.description());
                return;
            }
            if waited >= term_timeout && !instance.killed {
                warn!("Term timeout reached for {}", instance.description());
                if let Some(pid) = instance.pid {
                    if let Err(err) = self.backend.signal(pid, Signal::SIGKILL) {
                        error!(?err, pid, "Failed to kill");
                    }
                }
                instance.killed = true;
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    /// Brings every process type to its configured quantity.
    #[instrument(skip(self))]
    pub fn check_concurrency(&mut self, reload: bool) -> Result<ConcurrencyChange, SupervisorError> {
        if reload {
            self.reload_config()?;
        }
        let mut change = ConcurrencyChange::default();
        if self.shutting_down {
            return Ok(change);
        }

        let config = &self.config;
        self.instances
            .retain(|i| i.status != InstanceStatus::Crashed || config.process(&i.process).is_some());
        let orphans: Vec<u64> = self
            .instances
            .iter()
            .filter(|i| i.status.is_live() && self.config.process(&i.process).is_none())
            .map(|i| i.generation)
            .collect();
        for generation in orphans {
            change.stopped.extend(self.terminate(generation));
        }

        let specs: Vec<ProcessSpec> = self.config.processes.values().cloned().collect();
        for spec in specs {
            let mut live: Vec<&Instance> = self
                .instances
                .iter()
                .filter(|i| i.process == spec.name && i.status.is_live())
                .collect();
            let quantity = spec.quantity as usize;
            if live.len() > quantity {
                live.sort_by_key(|i| i.generation);
                let surplus: Vec<u64> = live[..live.len() - quantity]
                    .iter()
                    .map(|i| i.generation)
                    .collect();
                for generation in surplus {
                    change.stopped.extend(self.terminate(generation));
                }
                self.instances
                    .retain(|i| !(i.process == spec.name && i.status == InstanceStatus::Crashed));
            } else {
                change.started.extend(self.fill(&spec));
            }
        }
        self.reap_children();

        if !change.is_empty() {
            info!(
                started = change.started.len(),
                stopped = change.stopped.len(),
                "Concurrency adjusted"
            );
        }
        Ok(change)
    }

    /// Re-reads configuration from disk. Nothing is started or stopped.
    #[instrument(skip(self))]
    pub fn reload_config(&mut self) -> Result<ReloadSummary, SupervisorError> {
        let mut fresh = Config::load(&self.config.root)?;
        if fresh.pid_root != self.config.pid_root || fresh.sock_path != self.config.sock_path {
            warn!("Changes to pid_root or sock_path take effect after a supervisor restart");
            fresh.pid_root = self.config.pid_root.clone();
            fresh.sock_path = self.config.sock_path.clone();
        }

        let old = &self.config.processes;
        let summary = ReloadSummary {
            added: fresh.processes.keys().filter(|n| !old.contains_key(*n)).cloned().collect(),
            removed: old.keys().filter(|n| !fresh.processes.contains_key(*n)).cloned().collect(),
            changed: fresh
                .processes
                .iter()
                .filter(|(n, spec)| old.get(*n).map_or(false, |o| o != *spec))
                .map(|(n, _)| n.clone())
                .collect(),
        };
        self.config = fresh;
        info!(?summary, "Reloaded config");
        Ok(summary)
    }

    pub fn status(&self) -> StatusReport {
        let mut instances: BTreeMap<String, Vec<InstanceDescriptor>> = self
            .config
            .processes
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        let mut sorted: Vec<&Instance> = self.instances.iter().collect();
        sorted.sort_by_key(|i| (i.index, i.generation));
        for instance in sorted {
            instances
                .entry(instance.process.clone())
                .or_default()
                .push(instance.descriptor());
        }
        StatusReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            app_name: self.config.app_name.clone(),
            root: self.config.root.clone(),
            supervisor: SupervisorInfo {
                pid: self.pid,
                started_at: self.started_at,
            },
            processes: self.config.processes.values().cloned().collect(),
            instances,
            messages: self.messages(),
        }
    }

    pub fn messages(&self) -> Vec<StatusMessage> {
        let mut messages: Vec<StatusMessage> = self
            .instances
            .iter()
            .filter_map(|i| {
                let (kind, message) = i.failure.clone()?;
                Some(StatusMessage {
                    kind,
                    process: i.process.clone(),
                    instance: Some(i.description()),
                    message,
                })
            })
            .collect();
        for spec in self.config.processes.values() {
            let live = self.live_count(&spec.name);
            if live != spec.quantity as usize {
                messages.push(StatusMessage {
                    kind: MessageKind::IncorrectQuantity,
                    process: spec.name.clone(),
                    instance: None,
                    message: format!(
                        "{} has {live} instances running, should have {}",
                        spec.name, spec.quantity
                    ),
                });
            }
        }
        for (process, error) in &self.spawn_failures {
            messages.push(StatusMessage {
                kind: MessageKind::SpawnFailed,
                process: process.clone(),
                instance: None,
                message: error.clone(),
            });
        }
        messages
    }

    fn find(&self, generation: u64) -> Option<&Instance> {
        self.instances.iter().find(|i| i.generation == generation)
    }

    fn find_mut(&mut self, generation: u64) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.generation == generation)
    }

    fn index_taken(&self, process: &str, index: u32) -> bool {
        self.instances
            .iter()
            .any(|i| i.process == process && i.index == index)
    }

    fn free_index(&self, process: &str) -> u32 {
        (1..).find(|index| !self.index_taken(process, *index)).unwrap_or(1)
    }

    /// Removes an instance from service: live ones are terminated, crashed records dropped.
    fn retire(&mut self, generation: u64) -> Option<InstanceDescriptor> {
        let instance = self.find(generation)?;
        if instance.status == InstanceStatus::Crashed {
            let descriptor = instance.descriptor();
            self.instances.retain(|i| i.generation != generation);
            return Some(descriptor);
        }
        let descriptor = self.terminate(generation);
        self.reap_children();
        descriptor
    }

    /// Sends SIGTERM and marks the instance Stopping; the reap finishes it.
    fn terminate(&mut self, generation: u64) -> Option<InstanceDescriptor> {
        let instance = self.instances.iter_mut().find(|i| i.generation == generation)?;
        if let Some(pid) = instance.pid {
            match self.backend.signal(pid, Signal::SIGTERM) {
                Ok(()) => info!(pid, "Sent TERM to {}", instance.description()),
                Err(Errno::ESRCH) => debug!(pid, "{} already exited", instance.description()),
                Err(err) => warn!(?err, pid, "Failed to send TERM to {}", instance.description()),
            }
        }
        instance.status = InstanceStatus::Stopping;
        instance.stopping_since = Some(Instant::now());
        Some(instance.descriptor())
    }

    fn spawn_slot(
        &mut self,
        spec: &ProcessSpec,
        index: u32,
        tag: Option<String>,
        respawns: RespawnHistory,
        ready_at: Option<Instant>,
    ) -> Result<u64, SpawnFailure> {
        let description = format!("{}.{index}", spec.name);
        let tag = tag.filter(|_| spec.taggable);
        let pid = prepare(&self.config, spec, index, tag.as_deref())
            .and_then(|request| self.backend.spawn(&request).map_err(|err| err.to_string()));
        let pid = match pid {
            Ok(pid) => pid,
            Err(reason) => {
                let err = SupervisorError::Spawn {
                    description: description.clone(),
                    reason: reason.clone(),
                };
                error!(%err, "Spawn failed");
                self.spawn_failures.insert(spec.name.clone(), err.to_string());
                return Err(SpawnFailure {
                    description,
                    process: spec.name.clone(),
                    index,
                    error: reason,
                });
            }
        };

        let pid_file = self.config.instance_pid_path(&spec.name, index);
        if let Err(err) = pidfile::write(&pid_file, pid) {
            warn!(?err, "Failed to write pid file for {description}");
        }
        self.spawn_failures.remove(&spec.name);
        self.next_generation += 1;
        self.instances.push(Instance {
            process: spec.name.clone(),
            index,
            pid: Some(pid),
            tag,
            status: if ready_at.is_some() {
                InstanceStatus::Starting
            } else {
                InstanceStatus::Running
            },
            started_at: Utc::now(),
            generation: self.next_generation,
            respawns,
            exit_status: None,
            pid_file,
            ready_at,
            stopping_since: None,
            killed: false,
            failure: None,
        });
        info!(pid, "Started {description}");
        Ok(self.next_generation)
    }

    fn outcome(&self, spawned: Result<u64, SpawnFailure>) -> SpawnOutcome {
        match spawned {
            Ok(generation) => match self.find(generation) {
                Some(instance) => SpawnOutcome::Started(instance.descriptor()),
                None => SpawnOutcome::Failed(SpawnFailure {
                    description: String::new(),
                    process: String::new(),
                    index: 0,
                    error: "instance vanished after spawn".into(),
                }),
            },
            Err(failure) => SpawnOutcome::Failed(failure),
        }
    }
}

#[cfg(test)]
mod tests;
