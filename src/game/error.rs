//! Game-layer errors

use tracing::warn;

use super::orchestrator::MatchState;
use crate::config::ConfigError;
use crate::replication::{ReplicationError, Role};
use crate::session::{ParticipantId, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("{operation} requires the server role")]
    AuthorityViolation { operation: &'static str },

    #[error("participant {0} already owns a live entity")]
    DuplicateEntity(ParticipantId),

    #[error("all {capacity} spawn slots are occupied")]
    NoFreeSlot { capacity: usize },

    #[error("cannot {operation} while the match is {phase:?}")]
    InvalidPhaseTransition {
        operation: &'static str,
        phase: MatchState,
    },

    #[error("need {required} participants, {present} connected")]
    NotEnoughParticipants { required: usize, present: usize },

    #[error("{count} participants are not ready", count = .waiting.len())]
    NotReady { waiting: Vec<ParticipantId> },

    #[error("participant {0} has no entity")]
    UnknownParticipant(ParticipantId),

    #[error("participant {0} cannot act right now")]
    ControlDisabled(ParticipantId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reject a mutation attempted outside the server role
pub(crate) fn ensure_server(role: Role, operation: &'static str) -> Result<(), GameError> {
    if role == Role::Server {
        return Ok(());
    }
    warn!(operation, "Rejected mutation from non-server role");
    Err(GameError::AuthorityViolation { operation })
}
