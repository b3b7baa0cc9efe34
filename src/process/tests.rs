use super::testing::{write_config, BackendEvent, FakeBackend};
use super::*;
use std::path::Path;

const PROCFILE: &str = "web: puma -p 3000\nworker: sidekiq\n";

fn supervisor(dir: &Path, options: Option<&str>, run: RunOptions) -> (Supervisor, FakeBackend) {
    let config = write_config(dir, PROCFILE, options);
    let backend = FakeBackend::new();
    let supervisor = Supervisor::new(config, run, Box::new(backend.clone()));
    (supervisor, backend)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn pid_of(supervisor: &Supervisor, process: &str, index: u32) -> i32 {
    supervisor
        .instances()
        .iter()
        .find(|i| i.process == process && i.index == index && i.pid.is_some())
        .and_then(|i| i.pid)
        .unwrap()
}

fn indices(supervisor: &Supervisor, process: &str) -> Vec<u32> {
    let mut indices: Vec<u32> = supervisor
        .instances()
        .iter()
        .filter(|i| i.process == process && i.status.is_live())
        .map(|i| i.index)
        .collect();
    indices.sort();
    indices
}

#[test]
fn check_concurrency_reaches_quantity() {
    let dir = tempfile::tempdir().unwrap();
    let options = "processes:\n  web:\n    quantity: 3\n  worker:\n    quantity: 0\n";
    let (mut sup, backend) = supervisor(dir.path(), Some(options), RunOptions::default());

    let change = sup.check_concurrency(false).unwrap();
    assert_eq!(change.started.len(), 3);
    assert!(change.stopped.is_empty());
    assert_eq!(indices(&sup, "web"), vec![1, 2, 3]);
    assert_eq!(sup.live_count("worker"), 0);
    assert!(sup.config().pid_root.join("web.2.pid").exists());

    assert!(sup.check_concurrency(false).unwrap().is_empty());
    assert_eq!(backend.spawn_count(), 3);
}

#[test]
fn surplus_instances_are_stopped_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(
        dir.path(),
        Some("processes:\n  web:\n    quantity: 3\n"),
        RunOptions::default(),
    );
    sup.start(Some(&names(&["web"]))).unwrap();
    backend.set_exit_on_term(false);

    write_config(dir.path(), PROCFILE, Some("processes:\n  web:\n    quantity: 1\n"));
    let change = sup.check_concurrency(true).unwrap();
    let stopped: Vec<&str> = change.stopped.iter().map(|d| d.description.as_str()).collect();
    assert_eq!(stopped, vec!["web.1", "web.2"]);
    assert_eq!(sup.live_count("web"), 1);
    assert!(change
        .stopped
        .iter()
        .all(|d| d.status == InstanceStatus::Stopping));

    for descriptor in &change.stopped {
        backend.exit(descriptor.pid.unwrap(), ExitStatus::Signaled { signal: 15 });
    }
    assert_eq!(sup.reap_children(), 2);
    assert_eq!(sup.instances().len(), 2);
    assert_eq!(indices(&sup, "web"), vec![3]);
    assert!(!sup.config().pid_root.join("web.1.pid").exists());
}

#[test]
fn crashed_instance_respawns_at_its_index() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(
        dir.path(),
        Some("processes:\n  web:\n    quantity: 2\n"),
        RunOptions::default(),
    );
    sup.start(Some(&names(&["web"]))).unwrap();
    let old = pid_of(&sup, "web", 1);

    backend.crash(old);
    assert_eq!(sup.reap_children(), 1);

    let new = pid_of(&sup, "web", 1);
    assert_ne!(old, new);
    assert_eq!(indices(&sup, "web"), vec![1, 2]);
    let respawned = sup.instances().iter().find(|i| i.pid == Some(new)).unwrap();
    assert_eq!(respawned.respawns.count(), 1);
    assert_eq!(backend.spawn_count(), 3);
}

#[test]
fn failed_respawn_keeps_a_crashed_record() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();
    let old = pid_of(&sup, "web", 1);

    backend.fail_next_spawns(1);
    backend.crash(old);
    assert_eq!(sup.reap_children(), 1);

    let web: Vec<&Instance> = sup.instances().iter().filter(|i| i.process == "web").collect();
    assert_eq!(web.len(), 1);
    assert_eq!(web[0].index, 1);
    assert_eq!(web[0].status, InstanceStatus::Crashed);
    assert_eq!(web[0].pid, None);
    assert_eq!(web[0].respawns.count(), 1);
    assert!(sup.messages().iter().any(|m| m.kind == MessageKind::SpawnFailed
        && m.instance.as_deref() == Some("web.1")
        && m.message.contains("No such file or directory")));

    let change = sup.check_concurrency(false).unwrap();
    assert!(change.started[0].started().is_some());
    assert_eq!(indices(&sup, "web"), vec![1]);
    assert_eq!(sup.instances().iter().filter(|i| i.process == "web").count(), 1);
}

#[test]
fn crash_loop_stops_respawning() {
    let dir = tempfile::tempdir().unwrap();
    let options = "processes:\n  web:\n    max_respawns: 3\n    respawn_window: 60s\n";
    let (mut sup, backend) = supervisor(dir.path(), Some(options), RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();

    let start = Instant::now();
    for second in 0..4 {
        let pid = pid_of(&sup, "web", 1);
        sup.reap_at(
            pid,
            ExitStatus::Exited { code: 1 },
            start + Duration::from_secs(second * 3),
        );
    }

    assert_eq!(backend.spawn_count(), 4);
    let crashed = &sup.instances()[0];
    assert_eq!(crashed.status, InstanceStatus::Crashed);
    assert_eq!(crashed.pid, None);
    assert_eq!(sup.live_count("web"), 0);
    assert!(!sup.should_exit());

    let messages = sup.messages();
    let crash_loop = messages
        .iter()
        .find(|m| m.kind == MessageKind::CrashLoop)
        .unwrap();
    assert_eq!(crash_loop.instance.as_deref(), Some("web.1"));
    assert!(crash_loop.message.contains("crashed 3 times within 1m"));

    // Explicit reconciliation gives the slot a fresh history.
    sup.check_concurrency(false).unwrap();
    let web: Vec<&Instance> = sup.instances().iter().filter(|i| i.process == "web").collect();
    assert_eq!(web.len(), 1);
    assert_eq!(web[0].status, InstanceStatus::Running);
    assert_eq!(web[0].respawns.count(), 0);
}

#[test]
fn crashes_outside_the_window_are_forgotten() {
    let dir = tempfile::tempdir().unwrap();
    let options = "processes:\n  web:\n    max_respawns: 3\n    respawn_window: 60s\n";
    let (mut sup, backend) = supervisor(dir.path(), Some(options), RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();

    let start = Instant::now();
    for second in [0, 1, 2, 62] {
        let pid = pid_of(&sup, "web", 1);
        sup.reap_at(pid, ExitStatus::Exited { code: 1 }, start + Duration::from_secs(second));
    }

    assert_eq!(backend.spawn_count(), 5);
    assert_eq!(sup.live_count("web"), 1);
    assert_eq!(sup.instances()[0].respawns.count(), 4);
}

#[test]
fn stopped_instance_is_removed_once_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    backend.set_exit_on_term(false);
    sup.start(None).unwrap();
    let pid = pid_of(&sup, "web", 1);

    let stopped = sup.stop(Some(&names(&["web"])), false).unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].status, InstanceStatus::Stopping);
    assert_eq!(sup.live_count("web"), 0);
    assert_eq!(sup.live_count("worker"), 1);
    assert!(backend.signals().contains(&(pid, Signal::SIGTERM)));

    backend.exit(pid, ExitStatus::Signaled { signal: 15 });
    sup.reap_children();
    assert!(sup.instances().iter().all(|i| i.process != "web"));
    assert_eq!(backend.spawn_count(), 2);
    assert!(!sup.should_exit());
}

#[test]
fn stop_selects_single_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, _backend) = supervisor(
        dir.path(),
        Some("processes:\n  web:\n    quantity: 3\n"),
        RunOptions::default(),
    );
    sup.start(Some(&names(&["web"]))).unwrap();

    let stopped = sup.stop(Some(&names(&["web.2"])), false).unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].description, "web.2");
    assert_eq!(indices(&sup, "web"), vec![1, 3]);
}

#[test]
fn unknown_names_change_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    sup.start(None).unwrap();

    for bad in [vec!["doesnotexist"], vec!["web", "nope"], vec!["web.x"]] {
        let err = sup.stop(Some(&names(&bad)), false).unwrap_err();
        assert_eq!(err.as_label(), "naming_error");
    }
    let err = sup.start(Some(&names(&["cron"]))).unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownProcess(name) if name == "cron"));

    assert!(backend.signals().is_empty());
    assert_eq!(backend.spawn_count(), 2);
    assert_eq!(sup.live_count("web"), 1);
}

#[test]
fn stop_supervisor_exits_when_everything_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    sup.start(None).unwrap();

    let stopped = sup.stop(None, true).unwrap();
    assert_eq!(stopped.len(), 2);
    assert!(sup.is_shutting_down());
    assert!(sup.instances().is_empty());
    assert!(sup.should_exit());

    assert!(sup.start(None).unwrap().is_empty());
    assert!(sup.check_concurrency(false).unwrap().is_empty());
    assert_eq!(backend.spawn_count(), 2);
}

#[test]
fn stop_when_none_exits_after_last_stop() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunOptions {
        stop_when_none: true,
        ..Default::default()
    };
    let (mut sup, _backend) = supervisor(dir.path(), None, run);
    sup.start(None).unwrap();
    assert!(!sup.should_exit());

    sup.stop(None, false).unwrap();
    assert!(!sup.is_shutting_down());
    assert!(sup.should_exit());
}

#[test]
fn brittle_crash_stops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunOptions {
        brittle: true,
        ..Default::default()
    };
    let (mut sup, backend) = supervisor(dir.path(), Some("processes:\n  web:\n    quantity: 2\n"), run);
    sup.start(None).unwrap();

    backend.crash(pid_of(&sup, "web", 1));
    sup.reap_children();

    assert!(sup.is_shutting_down());
    assert!(sup.should_exit());
    assert_eq!(backend.spawn_count(), 3);
    assert!(sup
        .messages()
        .iter()
        .any(|m| m.kind == MessageKind::Crashed && m.instance.as_deref() == Some("web.1")));
}

#[test]
fn respawn_disabled_leaves_crashed_record() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunOptions {
        respawn: false,
        ..Default::default()
    };
    let (mut sup, backend) = supervisor(dir.path(), None, run);
    sup.start(Some(&names(&["worker"]))).unwrap();

    backend.crash(pid_of(&sup, "worker", 1));
    sup.reap_children();
    assert_eq!(backend.spawn_count(), 1);
    assert_eq!(sup.instances()[0].status, InstanceStatus::Crashed);
}

#[test]
fn removed_process_is_stopped_and_not_respawned() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    sup.start(None).unwrap();
    backend.set_exit_on_term(false);
    let worker = pid_of(&sup, "worker", 1);

    write_config(dir.path(), "web: puma -p 3000\n", None);
    let summary = sup.reload_config().unwrap();
    assert_eq!(summary.removed, vec!["worker".to_string()]);
    assert!(summary.added.is_empty());

    // Reload alone neither starts nor stops anything.
    assert!(backend.signals().is_empty());

    let change = sup.check_concurrency(false).unwrap();
    assert_eq!(change.stopped.len(), 1);
    assert_eq!(change.stopped[0].process, "worker");

    backend.exit(worker, ExitStatus::Signaled { signal: 15 });
    sup.reap_children();
    assert_eq!(sup.live_count("worker"), 0);
    assert_eq!(backend.spawn_count(), 2);
}

#[test]
fn reload_reports_changed_processes() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, _backend) = supervisor(dir.path(), None, RunOptions::default());

    write_config(
        dir.path(),
        "web: puma -p 3000\nworker: sidekiq\nclock: clockwork\n",
        Some("processes:\n  web:\n    quantity: 2\n"),
    );
    let summary = sup.reload_config().unwrap();
    assert_eq!(summary.added, vec!["clock".to_string()]);
    assert_eq!(summary.changed, vec!["web".to_string()]);
    assert!(summary.removed.is_empty());
    assert_eq!(sup.config().process("web").unwrap().quantity, 2);
}

#[test]
fn broken_reload_keeps_previous_config() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, _backend) = supervisor(dir.path(), None, RunOptions::default());

    std::fs::write(dir.path().join(crate::configs::PROCFILE), "web: [broken\n").unwrap();
    let err = sup.reload_config().unwrap_err();
    assert_eq!(err.as_label(), "config_error");
    assert_eq!(sup.config().process("web").unwrap().command, "puma -p 3000");
}

#[test]
fn spawn_failure_is_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    backend.fail_next_spawns(1);

    let outcomes = sup.start(Some(&names(&["web"]))).unwrap();
    assert_eq!(outcomes.len(), 1);
    let SpawnOutcome::Failed(failure) = &outcomes[0] else {
        panic!("expected a failure, got {:?}", outcomes[0]);
    };
    assert_eq!(failure.description, "web.1");
    assert!(sup
        .messages()
        .iter()
        .any(|m| m.kind == MessageKind::SpawnFailed && m.process == "web"));

    let change = sup.check_concurrency(false).unwrap();
    assert!(change.started[0].started().is_some());
    assert!(sup.messages().iter().all(|m| m.kind != MessageKind::SpawnFailed));
}

#[test]
fn status_lists_every_type_and_quantity_mismatches() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(
        dir.path(),
        Some("processes:\n  web:\n    quantity: 2\n"),
        RunOptions::default(),
    );
    backend.set_exit_on_term(false);
    sup.start(Some(&names(&["web"]))).unwrap();
    sup.stop(Some(&names(&["web.2"])), false).unwrap();

    let report = sup.status();
    assert_eq!(report.processes.len(), 2);
    assert_eq!(report.instances["web"].len(), 2);
    assert!(report.instances["worker"].is_empty());
    assert_eq!(report.supervisor.pid, std::process::id());

    let messages: Vec<&str> = report
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::IncorrectQuantity)
        .map(|m| m.message.as_str())
        .collect();
    assert_eq!(
        messages,
        vec![
            "web has 1 instances running, should have 2",
            "worker has 0 instances running, should have 1",
        ]
    );
}

#[test]
fn term_timeout_escalates_to_kill_once() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(
        dir.path(),
        Some("processes:\n  web:\n    term_timeout: 5s\n"),
        RunOptions::default(),
    );
    backend.set_exit_on_term(false);
    sup.start(Some(&names(&["web"]))).unwrap();
    let pid = pid_of(&sup, "web", 1);
    sup.stop(None, false).unwrap();

    sup.tick_at(Instant::now() + Duration::from_secs(1));
    assert!(!backend.signals().contains(&(pid, Signal::SIGKILL)));

    sup.tick_at(Instant::now() + Duration::from_secs(6));
    sup.tick_at(Instant::now() + Duration::from_secs(7));
    let kills = backend
        .signals()
        .iter()
        .filter(|s| **s == (pid, Signal::SIGKILL))
        .count();
    assert_eq!(kills, 1);
}

#[tokio::test]
async fn start_before_stop_keeps_instances_running() {
    let dir = tempfile::tempdir().unwrap();
    let options = "processes:\n  web:\n    quantity: 2\n    readiness_grace: 0s\n";
    let (mut sup, backend) = supervisor(dir.path(), Some(options), RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();
    let old_pids = [pid_of(&sup, "web", 1), pid_of(&sup, "web", 2)];

    let pairs = sup
        .restart(Some(&names(&["web"])), Some("v2".into()))
        .await
        .unwrap();

    assert_eq!(pairs.len(), 2);
    let events = backend.events();
    let position = |event: BackendEvent| events.iter().position(|e| *e == event).unwrap();
    for (pair, old_pid) in pairs.iter().zip(old_pids) {
        let (old, new) = (pair.0.as_ref().unwrap(), pair.replacement().unwrap());
        assert_eq!(old.pid, Some(old_pid));
        assert_ne!(new.pid, old.pid);
        assert_eq!(new.tag.as_deref(), Some("v2"));
        // The replacement exists before the old instance is asked to stop.
        assert!(
            position(BackendEvent::Spawned(new.pid.unwrap()))
                < position(BackendEvent::Signalled(old_pid, Signal::SIGTERM))
        );
    }
    assert_eq!(sup.live_count("web"), 2);
    assert_eq!(sup.instances().len(), 2);

    let (_, request) = backend.spawned().pop().unwrap();
    assert!(request
        .env
        .contains(&("PROC_TAG".to_string(), "v2".to_string())));
}

#[tokio::test]
async fn stop_before_start_reuses_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let options = "processes:\n  web:\n    restart_mode: stop-before-start\n";
    let (mut sup, backend) = supervisor(dir.path(), Some(options), RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();
    let old_pid = pid_of(&sup, "web", 1);

    let pairs = sup.restart(Some(&names(&["web.1"])), None).await.unwrap();

    let (Some(old), Some(new)) = (&pairs[0].0, pairs[0].replacement()) else {
        panic!("expected a full pair, got {pairs:?}");
    };
    assert_eq!(old.pid, Some(old_pid));
    assert_eq!(new.index, 1);
    assert_eq!(backend.signals(), vec![(old_pid, Signal::SIGTERM)]);
    assert_eq!(backend.spawned().last().unwrap().0, new.pid.unwrap());
    assert_eq!(indices(&sup, "web"), vec![1]);
}

#[tokio::test]
async fn failed_replacement_is_reported_in_the_pair() {
    let dir = tempfile::tempdir().unwrap();
    let options = "processes:\n  web:\n    restart_mode: stop-before-start\n";
    let (mut sup, backend) = supervisor(dir.path(), Some(options), RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();
    let old_pid = pid_of(&sup, "web", 1);

    backend.fail_next_spawns(1);
    let pairs = sup.restart(Some(&names(&["web.1"])), None).await.unwrap();

    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].0.as_ref().unwrap().pid, Some(old_pid));
    assert!(pairs[0].replacement().is_none());
    let failure = pairs[0].failure().unwrap();
    assert_eq!(failure.description, "web.1");
    assert_eq!(failure.error, "No such file or directory");
    assert_eq!(sup.live_count("web"), 0);
}

#[tokio::test]
async fn failed_start_before_stop_spawn_keeps_the_old_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();
    let old_pid = pid_of(&sup, "web", 1);

    backend.fail_next_spawns(1);
    let pairs = sup.restart(Some(&names(&["web"])), None).await.unwrap();

    assert_eq!(pairs[0].failure().unwrap().process, "web");
    assert!(backend.signals().is_empty());
    assert_eq!(pid_of(&sup, "web", 1), old_pid);
}

#[tokio::test]
async fn failed_spawn_for_a_missing_instance_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    backend.fail_next_spawns(1);

    let pairs = sup.restart(Some(&names(&["web"])), None).await.unwrap();

    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].0.is_none());
    assert_eq!(pairs[0].failure().unwrap().description, "web.1");
}

#[tokio::test]
async fn stop_before_start_kills_a_stubborn_instance() {
    let dir = tempfile::tempdir().unwrap();
    let options = "processes:\n  web:\n    restart_mode: stop-before-start\n    term_timeout: 100ms\n    kill_timeout: 100ms\n";
    let (mut sup, backend) = supervisor(dir.path(), Some(options), RunOptions::default());
    backend.set_exit_on_term(false);
    sup.start(Some(&names(&["web"]))).unwrap();
    let old_pid = pid_of(&sup, "web", 1);

    let pairs = sup.restart(Some(&names(&["web"])), None).await.unwrap();

    assert_eq!(
        backend.signals(),
        vec![(old_pid, Signal::SIGTERM), (old_pid, Signal::SIGKILL)]
    );
    // The old instance still holds index 1 while it lingers.
    let new = pairs[0].replacement().unwrap();
    assert_eq!(new.index, 2);
}

#[tokio::test]
async fn replacement_dying_during_grace_keeps_the_old_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    sup.start(Some(&names(&["web"]))).unwrap();
    let old_pid = pid_of(&sup, "web", 1);
    // Fake pids are sequential, so the replacement gets the next one.
    backend.crash(old_pid + 1);

    let pairs = sup.restart(Some(&names(&["web"])), None).await.unwrap();

    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].0.as_ref().unwrap().pid, Some(old_pid));
    let failure = pairs[0].failure().unwrap();
    assert_eq!(failure.description, "web.1");
    assert!(failure.error.contains("readiness grace"));
    assert!(backend.signals().is_empty());
    assert_eq!(pid_of(&sup, "web", 1), old_pid);
    assert!(sup
        .messages()
        .iter()
        .any(|m| m.kind == MessageKind::SpawnFailed));
}

#[tokio::test]
async fn restart_follows_a_reduced_quantity() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, _backend) = supervisor(
        dir.path(),
        Some("processes:\n  web:\n    quantity: 3\n    readiness_grace: 0s\n"),
        RunOptions::default(),
    );
    sup.start(Some(&names(&["web"]))).unwrap();

    write_config(
        dir.path(),
        PROCFILE,
        Some("processes:\n  web:\n    quantity: 1\n    readiness_grace: 0s\n"),
    );
    sup.reload_config().unwrap();
    let pairs = sup.restart(Some(&names(&["web"])), None).await.unwrap();

    assert_eq!(pairs.len(), 3);
    assert!(pairs[0].0.is_some() && pairs[0].replacement().is_some());
    assert!(pairs[1..].iter().all(|p| p.0.is_some() && p.1.is_none()));
    assert_eq!(sup.live_count("web"), 1);
}

#[tokio::test]
async fn restart_follows_an_increased_quantity() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, _backend) = supervisor(
        dir.path(),
        Some("processes:\n  web:\n    readiness_grace: 0s\n"),
        RunOptions::default(),
    );
    sup.start(Some(&names(&["web"]))).unwrap();

    write_config(
        dir.path(),
        PROCFILE,
        Some("processes:\n  web:\n    quantity: 3\n    readiness_grace: 0s\n"),
    );
    sup.reload_config().unwrap();
    let pairs = sup.restart(Some(&names(&["web"])), None).await.unwrap();

    assert_eq!(pairs.len(), 3);
    assert!(pairs[0].0.is_some() && pairs[0].replacement().is_some());
    assert!(pairs[1..].iter().all(|p| p.0.is_none() && p.replacement().is_some()));
    assert_eq!(sup.live_count("web"), 3);
}

#[tokio::test]
async fn usr1_restarts_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(
        dir.path(),
        Some("processes:\n  worker:\n    restart_mode: usr1\n"),
        RunOptions::default(),
    );
    sup.start(Some(&names(&["worker"]))).unwrap();
    let pid = pid_of(&sup, "worker", 1);

    let pairs = sup.restart(Some(&names(&["worker"])), Some("v3".into())).await.unwrap();

    let (Some(before), Some(after)) = (&pairs[0].0, pairs[0].replacement()) else {
        panic!("expected a full pair, got {pairs:?}");
    };
    assert_eq!(before.pid, after.pid);
    assert_eq!(before.tag, None);
    assert_eq!(after.tag.as_deref(), Some("v3"));
    assert_eq!(backend.signals(), vec![(pid, Signal::SIGUSR1)]);
    assert_eq!(backend.spawn_count(), 1);
}

#[tokio::test]
async fn nothing_restarts_while_shutting_down() {
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, backend) = supervisor(dir.path(), None, RunOptions::default());
    sup.start(None).unwrap();
    sup.shutdown();

    assert!(sup.restart(None, None).await.unwrap().is_empty());
    assert_eq!(backend.spawn_count(), 2);
}
