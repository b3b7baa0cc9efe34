use super::types::ExitStatus;
use crate::configs::{Config, ProcessSpec};
use new_string_template::template::Template;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, error, instrument};

/// Everything needed to start one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
}

/// The OS boundary of the supervisor: spawning, signalling and reaping.
pub trait ProcessBackend: Send + Sync {
    /// Returns the pid of the started process.
    fn spawn(&self, request: &SpawnRequest) -> std::io::Result<i32>;

    fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()>;

    /// Collects one terminated child, if any, without blocking.
    fn try_reap(&self) -> Option<(i32, ExitStatus)>;
}

pub struct OsBackend;

impl ProcessBackend for OsBackend {
    #[instrument(skip(self), fields(command = ?request.argv))]
    fn spawn(&self, request: &SpawnRequest) -> std::io::Result<i32> {
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)?;
        let child = Command::new(&request.argv[0])
            .args(&request.argv[1..])
            .envs(request.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0)
            .spawn()?;
        // Dropping the handle neither kills nor reaps; exits are collected by `try_reap`.
        let pid = child.id() as i32;
        debug!(pid, "Child started");
        Ok(pid)
    }

    fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()> {
        kill(Pid::from_raw(pid), signal)
    }

    fn try_reap(&self) -> Option<(i32, ExitStatus)> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    return Some((pid.as_raw(), ExitStatus::Exited { code }))
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    return Some((
                        pid.as_raw(),
                        ExitStatus::Signaled {
                            signal: signal as i32,
                        },
                    ))
                }
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return None,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!(?err, "Wait error");
                    return None;
                }
                // Stop/continue notifications are not requested
                Ok(_) => continue,
            }
        }
    }
}

/// Renders the command template and environment for one instance.
pub fn prepare(
    config: &Config,
    spec: &ProcessSpec,
    index: u32,
    tag: Option<&str>,
) -> Result<SpawnRequest, String> {
    let root = config.root.to_string_lossy().into_owned();
    let index_str = index.to_string();
    let data: HashMap<&str, String> = HashMap::from([
        ("name", spec.name.clone()),
        ("index", index_str.clone()),
        ("tag", tag.unwrap_or_default().to_string()),
        ("root", root.clone()),
    ]);
    let mut command = Template::new(spec.command.clone())
        .render(&data)
        .map_err(|err| format!("invalid command template: {err}"))?;
    if let Some(prefix) = &config.exec_prefix {
        command = format!("{prefix} {command}");
    }
    let argv = shell_words::split(&command).map_err(|err| format!("invalid command: {err}"))?;
    if argv.is_empty() {
        return Err("command is empty".into());
    }

    let pid_file = config.instance_pid_path(&spec.name, index);
    let mut env: Vec<(String, String)> = config
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.extend([
        ("PID_FILE".to_string(), pid_file.to_string_lossy().into_owned()),
        ("APP_ROOT".to_string(), root.clone()),
        ("PROC_NAME".to_string(), spec.name.clone()),
        ("PROC_INDEX".to_string(), index_str.clone()),
    ]);
    if let Some(tag) = tag {
        env.push(("PROC_TAG".to_string(), tag.to_string()));
    }

    Ok(SpawnRequest {
        argv,
        env,
        cwd: config.root.clone(),
        log_path: spec.log_path.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(procfile: &str, options: Option<&str>) -> Config {
        Config::from_yaml(PathBuf::from("/srv/app"), procfile, options, None).unwrap()
    }

    fn env<'a>(request: &'a SpawnRequest, key: &str) -> Option<&'a str> {
        request
            .env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn renders_template_and_splits() {
        let config = config("web: ./server --name {name}-{index} --root '{root}'\n", None);
        let request = prepare(&config, config.process("web").unwrap(), 2, None).unwrap();
        assert_eq!(
            request.argv,
            vec!["./server", "--name", "web-2", "--root", "/srv/app"]
        );
        assert_eq!(request.cwd, PathBuf::from("/srv/app"));
        assert_eq!(request.log_path, PathBuf::from("/srv/app/log/web.log"));
    }

    #[test]
    fn applies_exec_prefix_and_env() {
        let config = config(
            "worker: sidekiq\n",
            Some("exec_prefix: bundle exec\nenv:\n  RAILS_ENV: production\n"),
        );
        let request = prepare(&config, config.process("worker").unwrap(), 1, Some("v42")).unwrap();
        assert_eq!(request.argv, vec!["bundle", "exec", "sidekiq"]);
        assert_eq!(env(&request, "RAILS_ENV"), Some("production"));
        assert_eq!(env(&request, "PROC_NAME"), Some("worker"));
        assert_eq!(env(&request, "PROC_INDEX"), Some("1"));
        assert_eq!(env(&request, "PROC_TAG"), Some("v42"));
        assert_eq!(env(&request, "PID_FILE"), Some("/srv/app/pids/worker.1.pid"));
        assert_eq!(env(&request, "APP_ROOT"), Some("/srv/app"));
    }

    #[test]
    fn untagged_instances_have_no_tag_variable() {
        let config = config("web: puma\n", None);
        let request = prepare(&config, config.process("web").unwrap(), 1, None).unwrap();
        assert_eq!(env(&request, "PROC_TAG"), None);
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let config = config("web: puma 'oops\n", None);
        let err = prepare(&config, config.process("web").unwrap(), 1, None).unwrap_err();
        assert!(err.starts_with("invalid command"));
    }

    #[test]
    fn os_backend_runs_and_reaps_a_real_child() {
        let dir = tempfile::tempdir().unwrap();
        let request = SpawnRequest {
            argv: vec!["sh".into(), "-c".into(), "echo hello; exit 3".into()],
            env: vec![],
            cwd: dir.path().to_path_buf(),
            log_path: dir.path().join("log/test.log"),
        };
        let backend = OsBackend;
        let pid = backend.spawn(&request).unwrap();
        let pid_path = Pid::from_raw(pid);
        let status = waitpid(pid_path, None).unwrap();
        assert_eq!(status, WaitStatus::Exited(pid_path, 3));
        let log = std::fs::read_to_string(dir.path().join("log/test.log")).unwrap();
        assert_eq!(log, "hello\n");
    }
}
