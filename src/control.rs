//! Control protocol: one JSON request line in, one JSON response line out.
//!
//! ```text
//! <- READY
//! -> {"command":"stop","params":{"processes":["web.2"]}}
//! <- {"status":"ok","result":[{"description":"web.2","pid":1234,...}]}
//! ```

use crate::error::SupervisorError;
use crate::process::Supervisor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

pub const READY: &str = "READY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(operation: Operation, params: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            command: operation.name().to_string(),
            params: serde_json::to_value(params)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { result: Value },
    Error { error: ErrorDescriptor },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}

impl Response {
    pub fn error(err: &SupervisorError) -> Self {
        Response::Error {
            error: ErrorDescriptor {
                kind: err.as_label().to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Every command the supervisor answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartProcesses,
    Stop,
    Restart,
    CheckConcurrency,
    ReloadConfig,
    Status,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::StartProcesses,
        Operation::Stop,
        Operation::Restart,
        Operation::CheckConcurrency,
        Operation::ReloadConfig,
        Operation::Status,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::StartProcesses => "start_processes",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
            Operation::CheckConcurrency => "check_concurrency",
            Operation::ReloadConfig => "reload_config",
            Operation::Status => "status",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartParams {
    pub processes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopParams {
    pub processes: Option<Vec<String>>,
    pub stop_supervisor: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartParams {
    pub processes: Option<Vec<String>>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConcurrencyParams {
    pub reload: bool,
}

impl Default for CheckConcurrencyParams {
    fn default() -> Self {
        Self { reload: true }
    }
}

/// Runs one request against the supervisor. Errors become error responses.
pub async fn dispatch(supervisor: &Mutex<Supervisor>, request: Request) -> Response {
    match invoke(supervisor, request).await {
        Ok(result) => Response::Ok { result },
        Err(err) => {
            warn!(%err, "Request failed");
            Response::error(&err)
        }
    }
}

#[instrument(skip(supervisor, request), fields(command = %request.command))]
async fn invoke(supervisor: &Mutex<Supervisor>, request: Request) -> Result<Value, SupervisorError> {
    let operation = Operation::from_name(&request.command)
        .ok_or_else(|| SupervisorError::Protocol(format!("unknown command '{}'", request.command)))?;
    let params = request.params;
    let mut supervisor = supervisor.lock().await;
    debug!("Dispatching {}", operation.name());
    match operation {
        Operation::StartProcesses => {
            let params: StartParams = decode(params)?;
            encode(supervisor.start(params.processes.as_deref())?)
        }
        Operation::Stop => {
            let params: StopParams = decode(params)?;
            encode(supervisor.stop(params.processes.as_deref(), params.stop_supervisor)?)
        }
        Operation::Restart => {
            let params: RestartParams = decode(params)?;
            encode(
                supervisor
                    .restart(params.processes.as_deref(), params.tag)
                    .await?,
            )
        }
        Operation::CheckConcurrency => {
            let params: CheckConcurrencyParams = decode(params)?;
            encode(supervisor.check_concurrency(params.reload)?)
        }
        Operation::ReloadConfig => encode(supervisor.reload_config()?),
        Operation::Status => encode(supervisor.status()),
    }
}

fn decode<T: DeserializeOwned + Default>(params: Value) -> Result<T, SupervisorError> {
    match params {
        Value::Null => Ok(T::default()),
        params => serde_json::from_value(params)
            .map_err(|err| SupervisorError::Protocol(format!("invalid params: {err}"))),
    }
}

fn encode(result: impl Serialize) -> Result<Value, SupervisorError> {
    serde_json::to_value(result).map_err(|err| SupervisorError::Protocol(err.to_string()))
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("supervisor is not running (no socket at {})", .0.display())]
    NotRunning(PathBuf),
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected greeting from supervisor: {0:?}")]
    Handshake(String),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
}

/// Sends one request to the supervisor listening at `path` and returns its result.
pub async fn request(path: &Path, request: &Request) -> Result<Value, ClientError> {
    let stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) =>
        {
            return Err(ClientError::NotRunning(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut greeting = String::new();
    reader.read_line(&mut greeting).await?;
    if greeting.trim_end() != READY {
        return Err(ClientError::Handshake(greeting));
    }

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    writer.write_all(&line).await?;

    let mut reply = String::new();
    reader.read_line(&mut reply).await?;
    match serde_json::from_str(&reply)? {
        Response::Ok { result } => Ok(result),
        Response::Error { error } => Err(ClientError::Remote {
            kind: error.kind,
            message: error.message,
        }),
    }
}
