use super::connection::{PeerLink, PeerRole, RelayConnection, RelayEvent};
use super::RelayError;
use crate::observability::DirectionMetrics;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_CAPACITY: usize = 64;

type ConnectionTable = Arc<Mutex<HashMap<PeerRole, RelayConnection>>>;
type OutboundSlot = Arc<watch::Sender<Option<Outbound>>>;

/// Inbound half of a newly attached peer, handed to the loop reading that role
struct Attachment {
    generation: u64,
    inbound: mpsc::Receiver<Vec<u8>>,
}

/// Where messages destined for a role currently go
#[derive(Clone)]
struct Outbound {
    generation: u64,
    tx: mpsc::Sender<RelayEvent>,
}

struct Endpoint {
    attach_tx: mpsc::Sender<Attachment>,
    outbound: OutboundSlot,
}

/// Relay between the controller and the detector host.
///
/// Each direction runs in its own task, so a stalled peer only stalls the
/// direction it receives from. Messages are forwarded byte-for-byte and in
/// arrival order; anything sent while the destination is absent is dropped.
/// Must be created inside a tokio runtime.
pub struct RelayChannel {
    controller: Endpoint,
    detector_host: Endpoint,
    connections: ConnectionTable,
    to_host_metrics: Arc<DirectionMetrics>,
    to_controller_metrics: Arc<DirectionMetrics>,
    next_generation: AtomicU64,
    capacity: usize,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayChannel {
    pub fn new(capacity: usize) -> Self {
        Self::start(capacity, None)
    }

    /// Like `new`, but every message the detector host sends is also offered
    /// to `tap` (without waiting; a full tap misses messages, the peer never does)
    pub fn with_status_tap(capacity: usize, tap: mpsc::Sender<Vec<u8>>) -> Self {
        Self::start(capacity, Some(tap))
    }

    fn start(capacity: usize, tap: Option<mpsc::Sender<Vec<u8>>>) -> Self {
        let capacity = capacity.max(1);
        let (shutdown_tx, _) = broadcast::channel(4);
        let connections: ConnectionTable = Arc::new(Mutex::new(HashMap::new()));

        let (controller_attach_tx, controller_attach_rx) = mpsc::channel(4);
        let (host_attach_tx, host_attach_rx) = mpsc::channel(4);
        let controller_out: OutboundSlot = Arc::new(watch::Sender::new(None));
        let host_out: OutboundSlot = Arc::new(watch::Sender::new(None));

        let to_host_metrics = Arc::new(DirectionMetrics::new("controller->detector_host"));
        let to_controller_metrics = Arc::new(DirectionMetrics::new("detector_host->controller"));

        let to_host = ForwardLoop {
            source: PeerRole::Controller,
            attach_rx: controller_attach_rx,
            source_out: controller_out.clone(),
            dest_out: host_out.clone(),
            connections: connections.clone(),
            metrics: to_host_metrics.clone(),
            tap: None,
            shutdown_rx: shutdown_tx.subscribe(),
        };
        let to_controller = ForwardLoop {
            source: PeerRole::DetectorHost,
            attach_rx: host_attach_rx,
            source_out: host_out.clone(),
            dest_out: controller_out.clone(),
            connections: connections.clone(),
            metrics: to_controller_metrics.clone(),
            tap,
            shutdown_rx: shutdown_tx.subscribe(),
        };

        let handles = vec![tokio::spawn(to_host.run()), tokio::spawn(to_controller.run())];

        Self {
            controller: Endpoint {
                attach_tx: controller_attach_tx,
                outbound: controller_out,
            },
            detector_host: Endpoint {
                attach_tx: host_attach_tx,
                outbound: host_out,
            },
            connections,
            to_host_metrics,
            to_controller_metrics,
            next_generation: AtomicU64::new(1),
            capacity,
            shutdown_tx,
            handles: Mutex::new(handles),
        }
    }

    fn endpoint(&self, role: PeerRole) -> &Endpoint {
        match role {
            PeerRole::Controller => &self.controller,
            PeerRole::DetectorHost => &self.detector_host,
        }
    }

    /// Register a new connection for `role`, replacing any previous one
    pub async fn attach(&self, role: PeerRole) -> Result<PeerLink, RelayError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (in_tx, in_rx) = mpsc::channel(self.capacity);
        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        let endpoint = self.endpoint(role);

        let previous = endpoint.outbound.send_replace(Some(Outbound {
            generation,
            tx: out_tx,
        }));
        if previous.is_some() {
            info!("New {} connection replaces the previous one", role.name());
        } else {
            info!("{} connected", role.name());
        }

        lock(&self.connections).insert(role, RelayConnection::new(role, generation));

        endpoint
            .attach_tx
            .send(Attachment {
                generation,
                inbound: in_rx,
            })
            .await
            .map_err(|_| RelayError::Closed)?;

        Ok(PeerLink {
            role,
            tx: in_tx,
            rx: out_rx,
        })
    }

    pub fn connection(&self, role: PeerRole) -> Option<RelayConnection> {
        lock(&self.connections).get(&role).cloned()
    }

    pub fn is_live(&self, role: PeerRole) -> bool {
        self.connection(role).map(|c| c.live).unwrap_or(false)
    }

    /// Counters for messages travelling towards `destination`
    pub fn metrics(&self, destination: PeerRole) -> Arc<DirectionMetrics> {
        match destination {
            PeerRole::DetectorHost => self.to_host_metrics.clone(),
            PeerRole::Controller => self.to_controller_metrics.clone(),
        }
    }

    /// Stop both forwarding loops and wait for them to exit
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Step {
    Attached(Attachment),
    Message(Vec<u8>),
    SourceClosed,
    Shutdown,
}

/// Moves messages from one role to the other
struct ForwardLoop {
    source: PeerRole,
    attach_rx: mpsc::Receiver<Attachment>,
    source_out: OutboundSlot,
    dest_out: OutboundSlot,
    connections: ConnectionTable,
    metrics: Arc<DirectionMetrics>,
    tap: Option<mpsc::Sender<Vec<u8>>>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ForwardLoop {
    async fn run(mut self) {
        let mut current: Option<Attachment> = None;

        loop {
            let step = match current.as_mut() {
                None => tokio::select! {
                    _ = self.shutdown_rx.recv() => Step::Shutdown,
                    attached = self.attach_rx.recv() => match attached {
                        Some(a) => Step::Attached(a),
                        None => Step::Shutdown,
                    },
                },
                Some(active) => tokio::select! {
                    biased;
                    _ = self.shutdown_rx.recv() => Step::Shutdown,
                    attached = self.attach_rx.recv() => match attached {
                        Some(a) => Step::Attached(a),
                        None => Step::Shutdown,
                    },
                    message = active.inbound.recv() => match message {
                        Some(m) => Step::Message(m),
                        None => Step::SourceClosed,
                    },
                },
            };

            match step {
                Step::Shutdown => break,
                Step::Attached(attachment) => {
                    if let Some(old) = current.replace(attachment) {
                        debug!(
                            "Dropped {} connection generation {}",
                            self.source.name(),
                            old.generation
                        );
                    }
                }
                Step::Message(message) => self.forward(message).await,
                Step::SourceClosed => {
                    if let Some(closed) = current.take() {
                        self.source_disconnected(closed.generation).await;
                    }
                }
            }
        }

        debug!("{} forwarding loop stopped", self.metrics.direction());
    }

    async fn forward(&self, message: Vec<u8>) {
        let dest_role = self.source.other();
        self.touch(self.source);

        if let Some(tap) = &self.tap {
            let _ = tap.try_send(message.clone());
        }

        let dest = self.dest_out.borrow().clone();
        let Some(dest) = dest else {
            self.metrics.record_dropped();
            debug!(
                "{} not connected, dropping {} bytes from {}",
                dest_role.name(),
                message.len(),
                self.source.name()
            );
            return;
        };

        let start = self.metrics.start_forwarding();
        let len = message.len();
        if dest.tx.send(RelayEvent::Message(message)).await.is_ok() {
            self.metrics.record_forwarded(start, len);
            self.touch(dest_role);
        } else {
            self.metrics.record_dropped();
            debug!("{} went away mid-delivery, dropping {} bytes", dest_role.name(), len);
        }
    }

    async fn source_disconnected(&self, generation: u64) {
        // a newer connection may already own the slot
        let cleared = self.source_out.send_if_modified(|slot| {
            if slot.as_ref().map(|out| out.generation) == Some(generation) {
                *slot = None;
                true
            } else {
                false
            }
        });

        if let Some(conn) = lock(&self.connections).get_mut(&self.source) {
            if conn.generation == generation {
                conn.live = false;
            }
        }

        if !cleared {
            return;
        }

        warn!("{} disconnected", self.source.name());
        let dest = self.dest_out.borrow().clone();
        if let Some(dest) = dest {
            let _ = dest
                .tx
                .send(RelayEvent::PeerDisconnected(self.source))
                .await;
        }
    }

    fn touch(&self, role: PeerRole) {
        if let Some(conn) = lock(&self.connections).get_mut(&role) {
            conn.last_activity = Instant::now();
        }
    }
}
