use super::types::{ExitStatus, Instance, InstanceStatus, MessageKind};
use super::Supervisor;
use crate::error::SupervisorError;
use crate::pidfile;
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_TERM_TIMEOUT: Duration = Duration::from_secs(30);

impl Supervisor {
    /// Collects every terminated child the backend has for us.
    pub fn reap_children(&mut self) -> usize {
        let mut reaped = 0;
        while let Some((pid, status)) = self.backend.try_reap() {
            self.reap(pid, status);
            reaped += 1;
        }
        reaped
    }

    pub fn reap(&mut self, pid: i32, status: ExitStatus) {
        self.reap_at(pid, status, Instant::now())
    }

    pub(crate) fn reap_at(&mut self, pid: i32, status: ExitStatus, now: Instant) {
        let Some(position) = self.instances.iter().position(|i| i.pid == Some(pid)) else {
            debug!(pid, %status, "Reaped a child we do not track");
            return;
        };
        let mut instance = self.instances.remove(position);
        instance.pid = None;
        instance.exit_status = Some(status);
        pidfile::remove(&instance.pid_file);

        match instance.status {
            InstanceStatus::Stopping => {
                info!(pid, %status, "Stopped {}", instance.description());
                instance.status = InstanceStatus::Stopped;
            }
            InstanceStatus::Starting | InstanceStatus::Running => self.handle_crash(instance, now),
            InstanceStatus::Stopped | InstanceStatus::Crashed => {}
        }
    }

    fn handle_crash(&mut self, mut instance: Instance, now: Instant) {
        let description = instance.description();
        let status = instance.exit_status.unwrap_or(ExitStatus::Exited { code: 0 });
        if status.success() {
            info!("{description} exited cleanly but should still be running");
        } else {
            warn!(%status, "{description} exited unexpectedly");
        }

        if self.options.brittle {
            error!("{description} crashed in brittle mode, stopping all processes");
            instance.status = InstanceStatus::Crashed;
            instance.failure = Some((
                MessageKind::Crashed,
                format!("{description} crashed ({status}) in brittle mode"),
            ));
            self.instances.push(instance);
            self.shutdown();
            return;
        }
        if self.shutting_down {
            return;
        }
        let Some(spec) = self.config.process(&instance.process).cloned() else {
            info!("{description} is no longer configured, not respawning");
            return;
        };
        if !self.options.respawn {
            instance.status = InstanceStatus::Crashed;
            instance.failure = Some((
                MessageKind::Crashed,
                format!("{description} crashed ({status}) and respawning is disabled"),
            ));
            self.instances.push(instance);
            return;
        }
        if self.live_count(&spec.name) >= spec.quantity as usize {
            info!("{} already has {} instances, not respawning {description}", spec.name, spec.quantity);
            return;
        }
        if !instance
            .respawns
            .record_crash(now, spec.respawn_window, spec.max_respawns)
        {
            let err = SupervisorError::CrashLoopExceeded {
                description,
                crashes: instance.respawns.recent() as u32,
                window: humantime::format_duration(spec.respawn_window).to_string(),
            };
            error!(%err, "Crash loop detected");
            instance.status = InstanceStatus::Crashed;
            instance.failure = Some((MessageKind::CrashLoop, err.to_string()));
            self.instances.push(instance);
            return;
        }

        info!(respawns = instance.respawns.count(), "Respawning {description}");
        let respawned = self.spawn_slot(
            &spec,
            instance.index,
            instance.tag.clone(),
            instance.respawns.clone(),
            None,
        );
        if let Err(failure) = respawned {
            // Keep the slot visible so start or check_concurrency can revive it.
            instance.status = InstanceStatus::Crashed;
            instance.failure = Some((
                MessageKind::SpawnFailed,
                format!("{description} could not be respawned: {}", failure.error),
            ));
            self.instances.push(instance);
        }
    }

    /// Periodic housekeeping: readiness promotion and kill escalation.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now())
    }

    pub(crate) fn tick_at(&mut self, now: Instant) {
        self.reap_children();
        for instance in &mut self.instances {
            match instance.status {
                InstanceStatus::Starting if instance.ready_at.map_or(true, |t| t <= now) => {
                    debug!("{} is running", instance.description());
                    instance.status = InstanceStatus::Running;
                    instance.ready_at = None;
                }
                InstanceStatus::Stopping if !instance.killed => {
                    let term_timeout = self
                        .config
                        .process(&instance.process)
                        .map_or(DEFAULT_TERM_TIMEOUT, |s| s.term_timeout);
                    let (Some(since), Some(pid)) = (instance.stopping_since, instance.pid) else {
                        continue;
                    };
                    if now.saturating_duration_since(since) < term_timeout {
                        continue;
                    }
                    warn!("Term timeout reached for {}, killing", instance.description());
                    if let Err(err) = self.backend.signal(pid, Signal::SIGKILL) {
                        error!(?err, pid, "Failed to kill");
                    }
                    instance.killed = true;
                }
                _ => {}
            }
        }
        self.reap_children();
    }
}
