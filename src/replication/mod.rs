//! Replication bus: server-written cells and directed events fanned out to observers
//!
//! Everything the server publishes (cell writes, cell retirements, directed events) goes
//! through one ordered outbound stream, so observers apply state in exactly the order the
//! server committed it.

pub mod cell;
pub mod envelope;
pub mod mirror;

pub use cell::{CellSubscription, Change, ReplicatedCell};
pub use envelope::{Envelope, Targets};
pub use mirror::{IgnoreReason, MirrorUpdate, ReplicaMirror};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Which side of the replication boundary this process sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Sole writer of canonical state
    Server,
    /// Read-only observer
    Client,
}

/// Replication errors
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("only the server may write {target}")]
    AuthorityViolation { target: String },

    #[error("failed to encode {target}: {source}")]
    Encode {
        target: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outbound buffer per subscriber before it starts lagging
const OUTBOUND_CAPACITY: usize = 1024;

/// Handle to the replication bus (cheap to clone)
#[derive(Clone)]
pub struct ReplicationBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    role: Role,
    outbound: broadcast::Sender<Envelope>,
    /// Latest published value per live cell, for late-joining observers
    latest: DashMap<String, (u64, serde_json::Value)>,
    next_event_seq: AtomicU64,
    /// Serializes sequence assignment with the send so stream order matches seq order
    publish_lock: Mutex<()>,
}

impl ReplicationBus {
    pub fn new(role: Role) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                role,
                outbound,
                latest: DashMap::new(),
                next_event_seq: AtomicU64::new(1),
                publish_lock: Mutex::new(()),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether this process may mutate canonical state
    pub fn is_authoritative(&self) -> bool {
        self.inner.role == Role::Server
    }

    /// Create a named cell holding `initial`
    pub fn cell<T>(&self, name: impl Into<String>, initial: T) -> Result<ReplicatedCell<T>, ReplicationError>
    where
        T: Clone + PartialEq + Serialize + Send + Sync + 'static,
    {
        ReplicatedCell::new(self.clone(), name.into(), initial)
    }

    /// Send a one-shot event to `targets`, returning its sequence number
    pub fn send<E: Serialize>(&self, targets: Targets, event: &E) -> Result<u64, ReplicationError> {
        if !self.is_authoritative() {
            warn!("Rejected directed event from non-server role");
            return Err(ReplicationError::AuthorityViolation {
                target: "directed event".to_string(),
            });
        }

        let payload = serde_json::to_value(event).map_err(|source| ReplicationError::Encode {
            target: "directed event".to_string(),
            source,
        })?;

        let _guard = self.inner.publish_lock.lock();
        let seq = self.inner.next_event_seq.fetch_add(1, Ordering::Relaxed);
        self.emit(Envelope::Event {
            seq,
            targets,
            payload,
        });
        Ok(seq)
    }

    /// Subscribe to the ordered outbound stream
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.outbound.subscribe()
    }

    /// Latest value of every live cell, ordered by name
    pub fn snapshot(&self) -> Vec<Envelope> {
        let mut cells: Vec<Envelope> = self
            .inner
            .latest
            .iter()
            .map(|entry| {
                let (version, value) = entry.value();
                Envelope::CellUpdate {
                    cell: entry.key().clone(),
                    version: *version,
                    value: value.clone(),
                }
            })
            .collect();
        cells.sort_by(|a, b| a.cell_name().cmp(&b.cell_name()));
        cells
    }

    pub(crate) fn publish_cell(&self, cell: &str, version: u64, value: serde_json::Value) {
        let _guard = self.inner.publish_lock.lock();
        self.inner
            .latest
            .insert(cell.to_string(), (version, value.clone()));
        self.emit(Envelope::CellUpdate {
            cell: cell.to_string(),
            version,
            value,
        });
    }

    pub(crate) fn retire_cell(&self, cell: &str) {
        let _guard = self.inner.publish_lock.lock();
        if self.inner.latest.remove(cell).is_some() {
            self.emit(Envelope::CellRetired {
                cell: cell.to_string(),
            });
        }
    }

    fn emit(&self, envelope: Envelope) {
        // No subscribers is fine: the snapshot covers anyone who connects later.
        if self.inner.outbound.send(envelope).is_err() {
            debug!("Replication envelope dropped, no observers");
        }
    }
}
