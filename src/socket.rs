use crate::control::{self, Request, Response, READY};
use crate::error::SupervisorError;
use crate::process::Supervisor;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Longest request line a client may send, newline included.
const MAX_REQUEST_SIZE: u64 = 64 * 1024;

/// Binds the control socket and serves requests until the returned task is aborted.
#[instrument(skip(supervisor))]
pub async fn setup(path: &Path, supervisor: Arc<Mutex<Supervisor>>) -> Result<JoinHandle<()>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).wrap_err("Failed to create socket directory")?;
    }
    let listener = UnixListener::bind(path).wrap_err("Failed to bind socket")?;
    info!("Opened socket at {}", path.to_string_lossy());

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let peer_cred = stream
                        .peer_cred()
                        .map(|c| format!("{c:?}"))
                        .unwrap_or_else(|_| "<unknown>".into());
                    let supervisor = supervisor.clone();
                    tokio::spawn(
                        async move {
                            if let Err(err) = handle_client(stream, &supervisor).await {
                                error!(?err, "Client connection failed");
                            }
                        }
                        .instrument(info_span!("handle_client", ?peer_cred)),
                    );
                }
                Err(err) => {
                    error!(?err, "Failed to accept connection");
                }
            }
        }
    }))
}

async fn handle_client(stream: UnixStream, supervisor: &Mutex<Supervisor>) -> Result<()> {
    debug!("Client connection opened");
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{READY}\n").as_bytes()).await?;

    let mut reader = BufReader::new(reader.take(MAX_REQUEST_SIZE));
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        debug!("Client closed the connection before sending a request");
        return Ok(());
    }

    let response = if line.len() as u64 >= MAX_REQUEST_SIZE && !line.ends_with(b"\n") {
        warn!(limit = MAX_REQUEST_SIZE, "Request too large");
        Response::error(&SupervisorError::Protocol(format!(
            "request exceeds {MAX_REQUEST_SIZE} bytes"
        )))
    } else {
        match serde_json::from_slice::<Request>(&line) {
            Ok(request) => {
                info!(command = %request.command, "Received request");
                control::dispatch(supervisor, request).await
            }
            Err(err) => Response::error(&SupervisorError::Protocol(format!("malformed request: {err}"))),
        }
    };

    let mut encoded = serde_json::to_vec(&response)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;
    debug!("Client connection closed");
    Ok(())
}
