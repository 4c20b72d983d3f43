//! Wire units of the replication stream

use serde::{Deserialize, Serialize};

use crate::session::ParticipantId;

/// Recipients of a directed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum Targets {
    All,
    Only(Vec<ParticipantId>),
}

impl Targets {
    pub fn only(id: ParticipantId) -> Self {
        Self::Only(vec![id])
    }

    pub fn includes(&self, id: ParticipantId) -> bool {
        match self {
            Targets::All => true,
            Targets::Only(ids) => ids.contains(&id),
        }
    }
}

/// One ordered unit on the replication stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// A cell took a new value
    CellUpdate {
        cell: String,
        /// Per-cell version, strictly increasing per write
        version: u64,
        value: serde_json::Value,
    },

    /// A cell no longer exists (its entity was despawned)
    CellRetired { cell: String },

    /// A one-shot directed event
    Event {
        /// Bus-wide sequence number, used by observers to drop redeliveries
        seq: u64,
        targets: Targets,
        payload: serde_json::Value,
    },
}

impl Envelope {
    pub fn cell_name(&self) -> Option<&str> {
        match self {
            Envelope::CellUpdate { cell, .. } | Envelope::CellRetired { cell } => Some(cell),
            Envelope::Event { .. } => None,
        }
    }

    /// Whether `participant` should see this envelope
    pub fn addressed_to(&self, participant: ParticipantId) -> bool {
        match self {
            Envelope::Event { targets, .. } => targets.includes(participant),
            _ => true,
        }
    }
}
