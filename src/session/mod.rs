//! Connected-participant bookkeeping

pub mod registry;

pub use registry::{ready_cell_name, AuthorityRole, Participant, SessionError, SessionRegistry};

use serde::{Deserialize, Serialize};

/// Stable identifier of one transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
