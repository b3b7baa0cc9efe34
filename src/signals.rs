use crate::process::Supervisor;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, Instrument};

const QUEUE_SIZE: usize = 32;

/// What the main loop should do in response to a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// TERM or INT
    Terminate,
    /// HUP
    Reload,
    /// USR1
    CheckConcurrency,
    /// USR2, reserved
    User2,
    /// CHLD
    Child,
}

pub struct SignalRouter {
    receiver: mpsc::Receiver<SignalEvent>,
}

impl SignalRouter {
    /// Registers the handlers; each one only forwards its event into the queue.
    pub fn install() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel(QUEUE_SIZE);
        let routes = [
            (SignalKind::terminate(), SignalEvent::Terminate),
            (SignalKind::interrupt(), SignalEvent::Terminate),
            (SignalKind::hangup(), SignalEvent::Reload),
            (SignalKind::user_defined1(), SignalEvent::CheckConcurrency),
            (SignalKind::user_defined2(), SignalEvent::User2),
            (SignalKind::child(), SignalEvent::Child),
        ];
        for (kind, event) in routes {
            let mut stream = signal(kind)?;
            let sender = sender.clone();
            tokio::spawn(
                async move {
                    while stream.recv().await.is_some() {
                        if sender.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(info_span!("signal", ?event)),
            );
        }
        Ok(Self { receiver })
    }

    pub async fn recv(&mut self) -> Option<SignalEvent> {
        self.receiver.recv().await
    }
}

pub fn apply(event: SignalEvent, supervisor: &mut Supervisor) {
    match event {
        SignalEvent::Terminate => {
            info!(
                instances = supervisor.instances().len(),
                "Received termination signal, stopping all processes"
            );
            supervisor.shutdown();
        }
        SignalEvent::Reload => {
            info!(root = ?supervisor.config().root, "Received HUP, reloading config");
            match supervisor.reload_config() {
                Ok(_) => {
                    if let Err(err) = supervisor.check_concurrency(false) {
                        error!(%err, "Failed to check concurrency");
                    }
                }
                Err(err) => error!(%err, "Failed to reload config"),
            }
        }
        SignalEvent::CheckConcurrency => {
            info!("Received USR1, checking concurrency");
            if let Err(err) = supervisor.check_concurrency(true) {
                error!(%err, "Failed to check concurrency");
            }
        }
        SignalEvent::User2 => info!("Received USR2, nothing to do"),
        SignalEvent::Child => {
            let reaped = supervisor.reap_children();
            debug!(reaped, "Reaped children");
        }
    }
}
