//! Key event source
//!
//! Volume keys reach the daemon as `key up|down` IPC requests sent from the
//! desktop's key bindings. A shared [`KeyGate`] decides per event whether
//! the intent is consumed (queued for the aggregator) or handed back to the
//! client to apply on the local device.
//!
//! The listener only touches the gate and the channel; it never awaits
//! remote I/O.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::ipc::{self, IpcServer, Request, Response, StatusSnapshot};

/// Direction of a volume intent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// +1 for up, -1 for down
    #[must_use]
    pub fn sign(self) -> i32 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }

    /// Direction of a signed delta, `None` for zero
    #[must_use]
    pub fn of(delta: i32) -> Option<Self> {
        match delta.signum() {
            1 => Some(Self::Up),
            -1 => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// One key press accepted while the gate was active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIntent {
    pub direction: Direction,
    pub at: Instant,
}

// ============================================================================
// Gate
// ============================================================================

/// Whether key presses are consumed or passed through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Target active and remote reachable: keys are forwarded
    Active,
    /// Keys affect the local device
    Passthrough,
    /// Shutdown started: no new intents accepted
    Closed,
}

impl GateMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Passthrough => "passthrough",
            Self::Closed => "closed",
        }
    }
}

/// Mode shared between the controller and the key listener
#[derive(Debug, Clone)]
pub struct KeyGate(Arc<AtomicU8>);

impl KeyGate {
    #[must_use]
    pub fn new(mode: GateMode) -> Self {
        Self(Arc::new(AtomicU8::new(mode as u8)))
    }

    #[must_use]
    pub fn mode(&self) -> GateMode {
        match self.0.load(Ordering::Acquire) {
            0 => GateMode::Active,
            1 => GateMode::Passthrough,
            _ => GateMode::Closed,
        }
    }

    /// Set the mode; `Closed` is final
    pub fn set(&self, mode: GateMode) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != GateMode::Closed as u8).then_some(mode as u8)
            });
    }

    pub fn close(&self) {
        self.0.store(GateMode::Closed as u8, Ordering::Release);
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Running key listener
pub struct KeyListener {
    pub intents: mpsc::UnboundedReceiver<KeyIntent>,
    pub shutdown_requests: mpsc::UnboundedReceiver<()>,
    handle: JoinHandle<()>,
}

impl KeyListener {
    /// Stop accepting connections and wait until the socket is removed
    pub async fn stop(&mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for KeyListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve IPC requests, turning gated key presses into [`KeyIntent`]s
#[must_use]
pub fn spawn_key_listener(
    server: IpcServer,
    gate: KeyGate,
    status: watch::Receiver<StatusSnapshot>,
) -> KeyListener {
    let (intent_tx, intents) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_requests) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        loop {
            let Some(stream) = server.accept().await else {
                continue;
            };
            let gate = gate.clone();
            let intent_tx = intent_tx.clone();
            let shutdown_tx = shutdown_tx.clone();
            let snapshot = status.borrow().clone();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_client(stream, &gate, &intent_tx, &shutdown_tx, snapshot).await
                {
                    error!("IPC request handling error: {:#}", e);
                }
            });
        }
    });

    KeyListener {
        intents,
        shutdown_requests,
        handle,
    }
}

async fn handle_client(
    mut stream: UnixStream,
    gate: &KeyGate,
    intent_tx: &mpsc::UnboundedSender<KeyIntent>,
    shutdown_tx: &mpsc::UnboundedSender<()>,
    status: StatusSnapshot,
) -> color_eyre::eyre::Result<()> {
    // Liveness checks connect and hang up without a request
    let request = match ipc::read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            trace!("IPC client sent no request: {:#}", e);
            return Ok(());
        }
    };
    trace!("IPC request: {:?}", request);

    let response = match request {
        Request::Key { direction } => gate_key(gate, intent_tx, direction),
        Request::Status => Response::Status(status),
        Request::Shutdown => {
            if shutdown_tx.send(()).is_ok() {
                Response::Ok {
                    message: "Daemon shutting down".to_string(),
                }
            } else {
                Response::Error {
                    message: "Daemon is already stopping".to_string(),
                }
            }
        }
    };

    ipc::write_response(&mut stream, &response).await
}

/// Decide what happens to one key press
pub(crate) fn gate_key(
    gate: &KeyGate,
    intent_tx: &mpsc::UnboundedSender<KeyIntent>,
    direction: Direction,
) -> Response {
    match gate.mode() {
        GateMode::Active => {
            let intent = KeyIntent {
                direction,
                at: Instant::now(),
            };
            if intent_tx.send(intent).is_ok() {
                debug!("Key {} forwarded", direction);
                Response::Forwarded
            } else {
                Response::Passthrough {
                    reason: "daemon is stopping".to_string(),
                }
            }
        }
        GateMode::Passthrough => Response::Passthrough {
            reason: "target device inactive or speaker unreachable".to_string(),
        },
        GateMode::Closed => Response::Passthrough {
            reason: "daemon is stopping".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::send_request_to;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(5, Some(Direction::Up))]
    #[test_case(-1, Some(Direction::Down))]
    #[test_case(0, None)]
    fn test_direction_of(delta: i32, expected: Option<Direction>) {
        assert_eq!(Direction::of(delta), expected);
    }

    #[test]
    fn test_closed_gate_is_final() {
        let gate = KeyGate::new(GateMode::Active);
        gate.close();
        gate.set(GateMode::Active);
        assert_eq!(gate.mode(), GateMode::Closed);
    }

    #[test]
    fn test_passthrough_gate_queues_nothing() {
        let gate = KeyGate::new(GateMode::Passthrough);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let response = gate_key(&gate, &tx, Direction::Up);

        assert!(matches!(response, Response::Passthrough { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_active_gate_queues_intent() {
        let gate = KeyGate::new(GateMode::Active);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(gate_key(&gate, &tx, Direction::Down), Response::Forwarded);
        assert_eq!(rx.try_recv().unwrap().direction, Direction::Down);
    }

    #[tokio::test]
    async fn test_listener_serves_keys_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.sock");
        let server = IpcServer::bind_at(path.clone()).await.unwrap();
        let gate = KeyGate::new(GateMode::Active);
        let (_status_tx, status_rx) = watch::channel(StatusSnapshot {
            mode: "active".to_string(),
            ..StatusSnapshot::default()
        });
        let mut listener = spawn_key_listener(server, gate.clone(), status_rx);

        let response = send_request_to(
            &path,
            Request::Key {
                direction: Direction::Up,
            },
        )
        .await
        .unwrap();
        assert_eq!(response, Response::Forwarded);
        assert_eq!(listener.intents.recv().await.unwrap().direction, Direction::Up);

        gate.set(GateMode::Passthrough);
        let response = send_request_to(
            &path,
            Request::Key {
                direction: Direction::Up,
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, Response::Passthrough { .. }));

        let Response::Status(status) = send_request_to(&path, Request::Status).await.unwrap()
        else {
            panic!("expected status");
        };
        assert_eq!(status.mode, "active");

        send_request_to(&path, Request::Shutdown).await.unwrap();
        assert!(listener.shutdown_requests.recv().await.is_some());

        listener.stop().await;
        assert!(!path.exists());
    }
}
