//! Replicated cells: one writer (the server), many readers

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use super::{ReplicationBus, ReplicationError};

/// A value tagged with its write version
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// A value change observed by a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    /// Last value this subscriber saw (intermediate writes may have been coalesced)
    pub previous: T,
    pub current: T,
    pub version: u64,
}

/// A named, typed value written only by the server role
///
/// Writes publish a `CellUpdate` on the bus and wake local subscribers. Readers converge to
/// the latest value; they are not guaranteed to see every intermediate one.
pub struct ReplicatedCell<T> {
    name: Arc<str>,
    bus: ReplicationBus,
    tx: watch::Sender<Versioned<T>>,
}

impl<T> ReplicatedCell<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
    pub(crate) fn new(bus: ReplicationBus, name: String, initial: T) -> Result<Self, ReplicationError> {
        let encoded = encode(&name, &initial)?;
        if bus.is_authoritative() {
            bus.publish_cell(&name, 0, encoded);
        }
        let (tx, _) = watch::channel(Versioned {
            version: 0,
            value: initial,
        });
        Ok(Self {
            name: name.into(),
            bus,
            tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> T {
        self.tx.borrow().value.clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Write a new value. Returns whether it changed anything.
    pub fn set(&self, value: T) -> Result<bool, ReplicationError> {
        if !self.bus.is_authoritative() {
            warn!(cell = %self.name, "Rejected cell write from non-server role");
            return Err(ReplicationError::AuthorityViolation {
                target: self.name.to_string(),
            });
        }

        if self.tx.borrow().value == value {
            return Ok(false);
        }

        let encoded = encode(&self.name, &value)?;
        let version = self.tx.borrow().version + 1;
        self.tx.send_replace(Versioned { version, value });
        self.bus.publish_cell(&self.name, version, encoded);
        Ok(true)
    }

    /// Write a value derived from the current one
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<bool, ReplicationError> {
        let next = f(&self.tx.borrow().value);
        self.set(next)
    }

    pub fn subscribe(&self) -> CellSubscription<T> {
        let rx = self.tx.subscribe();
        let last = rx.borrow().clone();
        CellSubscription { rx, last }
    }

    /// Remove the cell from the bus; subscribers see the stream end
    pub fn retire(self) {
        if self.bus.is_authoritative() {
            self.bus.retire_cell(&self.name);
        }
    }
}

/// Subscription to a cell's changes. Dropping it cancels the subscription.
pub struct CellSubscription<T> {
    rx: watch::Receiver<Versioned<T>>,
    last: Versioned<T>,
}

impl<T: Clone> CellSubscription<T> {
    pub fn current(&self) -> T {
        self.rx.borrow().value.clone()
    }

    /// Wait for the next observed change. `None` once the cell is gone.
    pub async fn changed(&mut self) -> Option<Change<T>> {
        self.rx.changed().await.ok()?;
        let next = self.rx.borrow_and_update().clone();
        let previous = std::mem::replace(&mut self.last, next.clone());
        Some(Change {
            previous: previous.value,
            current: next.value,
            version: next.version,
        })
    }

    /// Wait until the value satisfies `pred`, returning it. `None` once the cell is gone.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        loop {
            let seen = self.rx.borrow_and_update().clone();
            self.last = seen.clone();
            if pred(&seen.value) {
                return Some(seen.value);
            }
            self.rx.changed().await.ok()?;
        }
    }

    pub fn unsubscribe(self) {}
}

fn encode<T: Serialize>(name: &str, value: &T) -> Result<serde_json::Value, ReplicationError> {
    serde_json::to_value(value).map_err(|source| ReplicationError::Encode {
        target: name.to_string(),
        source,
    })
}
