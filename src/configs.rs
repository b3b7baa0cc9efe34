use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const PROCFILE: &str = "Procfile";
pub const OPTIONS_FILE: &str = "Procfile.options";
pub const LOCAL_FILE: &str = "Procfile.local";

const LOG_COLORS: [u8; 6] = [35, 31, 36, 32, 33, 34];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {file}: {source}")]
    Parse {
        file: &'static str,
        source: serde_yaml::Error,
    },
    #[error("invalid process name '{0}'")]
    InvalidName(String),
    #[error("process '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("process '{0}' has a command that is not a string")]
    InvalidCommand(String),
    #[error("process '{name}' has a negative quantity ({quantity})")]
    NegativeQuantity { name: String, quantity: i64 },
    #[error("options are set for '{0}' which is not declared in the Procfile")]
    UndeclaredProcess(String),
}

/// Restart strategy of a process type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartMode {
    /// Spawn the replacement, wait for it, then terminate the old instance.
    #[serde(rename = "start-before-stop", alias = "start-term")]
    StartBeforeStop,
    /// Terminate the old instance, wait for it to exit, then spawn.
    #[serde(rename = "stop-before-start", alias = "term-start")]
    StopBeforeStart,
    /// Send SIGUSR1 and let the process restart itself in place.
    #[serde(rename = "usr1")]
    Usr1,
    /// Send SIGUSR2 and let the process restart itself in place.
    #[serde(rename = "usr2")]
    Usr2,
}

impl Default for RestartMode {
    fn default() -> Self {
        RestartMode::StartBeforeStop
    }
}

/// Immutable description of one process type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    pub quantity: u32,
    pub restart_mode: RestartMode,
    pub max_respawns: u32,
    #[serde(with = "humantime_serde")]
    pub respawn_window: Duration,
    pub log_path: PathBuf,
    pub log_color: u8,
    pub taggable: bool,
    #[serde(with = "humantime_serde")]
    pub term_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub readiness_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub app_name: String,
    pub pid_root: PathBuf,
    pub log_root: PathBuf,
    /// Where the supervisor's own output goes when daemonized.
    pub log_path: PathBuf,
    pub sock_path: PathBuf,
    pub env: BTreeMap<String, String>,
    pub exec_prefix: Option<String>,
    pub processes: BTreeMap<String, ProcessSpec>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct OptionsFile {
    app_name: Option<String>,
    pid_root: Option<PathBuf>,
    log_root: Option<PathBuf>,
    log_path: Option<PathBuf>,
    sock_path: Option<PathBuf>,
    env: BTreeMap<String, Value>,
    exec_prefix: Option<String>,
    processes: BTreeMap<String, ProcessOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ProcessOptions {
    quantity: i64,
    restart_mode: RestartMode,
    max_respawns: u32,
    #[serde(with = "humantime_serde")]
    respawn_window: Duration,
    log_path: Option<PathBuf>,
    taggable: bool,
    #[serde(with = "humantime_serde")]
    term_timeout: Duration,
    #[serde(with = "humantime_serde")]
    kill_timeout: Duration,
    #[serde(with = "humantime_serde")]
    readiness_grace: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            quantity: 1,
            restart_mode: Default::default(),
            max_respawns: 5,
            respawn_window: Duration::from_secs(3600),
            log_path: None,
            taggable: true,
            term_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(10),
            readiness_grace: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Reads `Procfile`, `Procfile.options` and `Procfile.local` from `root`.
    pub fn load(root: &Path) -> Result<Config, ConfigError> {
        let root = std::fs::canonicalize(root).map_err(|source| ConfigError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let procfile = read_file(&root.join(PROCFILE))?.ok_or_else(|| ConfigError::Io {
            path: root.join(PROCFILE),
            source: std::io::ErrorKind::NotFound.into(),
        })?;
        let options = read_file(&root.join(OPTIONS_FILE))?;
        let local = read_file(&root.join(LOCAL_FILE))?;
        Config::from_yaml(root, &procfile, options.as_deref(), local.as_deref())
    }

    pub fn from_yaml(
        root: PathBuf,
        procfile: &str,
        options: Option<&str>,
        local: Option<&str>,
    ) -> Result<Config, ConfigError> {
        let commands = parse_yaml(PROCFILE, procfile)?;
        let mut merged = Value::Null;
        for (file, contents) in [(OPTIONS_FILE, options), (LOCAL_FILE, local)] {
            if let Some(contents) = contents {
                merge(&mut merged, parse_yaml(file, contents)?);
            }
        }
        let options: OptionsFile = match merged {
            Value::Null => OptionsFile::default(),
            value => serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
                file: OPTIONS_FILE,
                source,
            })?,
        };
        Config::build(root, commands, options)
    }

    fn build(root: PathBuf, commands: Value, options: OptionsFile) -> Result<Config, ConfigError> {
        let app_name = options.app_name.unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "procfleet".into())
        });
        let pid_root = root.join(options.pid_root.unwrap_or_else(|| "pids".into()));
        let log_root = root.join(options.log_root.unwrap_or_else(|| "log".into()));
        let log_path = options
            .log_path
            .map(|p| root.join(p))
            .unwrap_or_else(|| log_root.join("procfleet.log"));
        let sock_path = options
            .sock_path
            .map(|p| root.join(p))
            .unwrap_or_else(|| pid_root.join("supervisor.sock"));

        let mut process_options = options.processes;
        let mut processes = BTreeMap::new();
        let entries = match commands {
            Value::Null => Default::default(),
            Value::Mapping(m) => m,
            _ => {
                return Err(ConfigError::Parse {
                    file: PROCFILE,
                    source: serde::de::Error::custom("expected a mapping of name: command"),
                })
            }
        };
        for (position, (name, command)) in entries.into_iter().enumerate() {
            let name = match name {
                Value::String(s) => s,
                other => return Err(ConfigError::InvalidName(scalar_to_string(&other))),
            };
            validate_name(&name)?;
            let command = match command {
                Value::String(s) => s,
                Value::Null => String::new(),
                _ => return Err(ConfigError::InvalidCommand(name)),
            };
            let opts = process_options.remove(&name).unwrap_or_default();
            let spec = ProcessSpec::build(name, command, opts, &log_root, position)?;
            processes.insert(spec.name.clone(), spec);
        }
        if let Some(name) = process_options.into_keys().next() {
            return Err(ConfigError::UndeclaredProcess(name));
        }

        let env = options
            .env
            .into_iter()
            .map(|(k, v)| (k, scalar_to_string(&v)))
            .collect();

        Ok(Config {
            root,
            app_name,
            pid_root,
            log_root,
            log_path,
            sock_path,
            env,
            exec_prefix: options.exec_prefix.filter(|p| !p.trim().is_empty()),
            processes,
        })
    }

    pub fn process(&self, name: &str) -> Option<&ProcessSpec> {
        self.processes.get(name)
    }

    pub fn supervisor_pid_path(&self) -> PathBuf {
        self.pid_root.join("supervisor.pid")
    }

    pub fn instance_pid_path(&self, process: &str, index: u32) -> PathBuf {
        self.pid_root.join(format!("{process}.{index}.pid"))
    }
}

impl ProcessSpec {
    fn build(
        name: String,
        command: String,
        opts: ProcessOptions,
        log_root: &Path,
        position: usize,
    ) -> Result<ProcessSpec, ConfigError> {
        if command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand(name));
        }
        let quantity = u32::try_from(opts.quantity).map_err(|_| ConfigError::NegativeQuantity {
            name: name.clone(),
            quantity: opts.quantity,
        })?;
        let log_path = opts
            .log_path
            .map(|p| log_root.join(p))
            .unwrap_or_else(|| log_root.join(format!("{name}.log")));
        Ok(ProcessSpec {
            command: command.trim().to_string(),
            quantity,
            restart_mode: opts.restart_mode,
            max_respawns: opts.max_respawns,
            respawn_window: opts.respawn_window,
            log_path,
            log_color: LOG_COLORS[position % LOG_COLORS.len()],
            taggable: opts.taggable,
            term_timeout: opts.term_timeout,
            kill_timeout: opts.kill_timeout,
            readiness_grace: opts.readiness_grace,
            name,
        })
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

fn read_file(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_yaml(file: &'static str, contents: &str) -> Result<Value, ConfigError> {
    serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse { file, source })
}

/// Deep-merges `overlay` into `base`; mappings merge key by key, anything else replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}
