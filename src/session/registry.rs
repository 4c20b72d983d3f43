//! Session registry - who is connected, in which order, with which role

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ParticipantId;
use crate::replication::{ReplicatedCell, ReplicationBus, ReplicationError, Role};
use crate::util::time::unix_millis;

/// Role of a participant in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityRole {
    /// The participant co-located with the server; always takes spawn slot 0
    Host,
    Remote,
}

/// A connected participant
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub label: String,
    pub role: AuthorityRole,
    /// Connection order, used for deterministic slot assignment
    pub joined_seq: u64,
    pub joined_at: u64,
}

impl Participant {
    pub fn is_host(&self) -> bool {
        self.role == AuthorityRole::Host
    }
}

/// Membership errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{operation} requires the server role")]
    AuthorityViolation { operation: &'static str },

    #[error("participant {0} is already connected")]
    DuplicateParticipant(ParticipantId),

    #[error("participant {existing} is already the host")]
    HostAlreadyPresent { existing: ParticipantId },

    #[error("participant {0} is not connected")]
    UnknownParticipant(ParticipantId),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

/// Name of the replicated ready flag of `id`
pub fn ready_cell_name(id: ParticipantId) -> String {
    format!("session.{}.ready", id)
}

struct Member {
    participant: Participant,
    ready: ReplicatedCell<bool>,
}

/// Set of connected participants with O(1) membership operations
pub struct SessionRegistry {
    bus: ReplicationBus,
    members: DashMap<ParticipantId, Member>,
    /// Guards the single-host invariant across concurrent joins
    host: Mutex<Option<ParticipantId>>,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new(bus: ReplicationBus) -> Self {
        Self {
            bus,
            members: DashMap::new(),
            host: Mutex::new(None),
            next_seq: AtomicU64::new(0),
        }
    }

    fn ensure_server(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.bus.role() == Role::Server {
            return Ok(());
        }
        warn!(operation, "Rejected membership change from non-server role");
        Err(SessionError::AuthorityViolation { operation })
    }

    /// Register a new connection
    pub fn on_join(
        &self,
        id: ParticipantId,
        label: impl Into<String>,
        role: AuthorityRole,
    ) -> Result<Participant, SessionError> {
        self.ensure_server("join")?;
        let mut host = self.host.lock();

        if self.members.contains_key(&id) {
            warn!(participant_id = %id, "Participant already connected");
            return Err(SessionError::DuplicateParticipant(id));
        }

        if role == AuthorityRole::Host {
            if let Some(existing) = *host {
                warn!(participant_id = %id, host_id = %existing, "Rejected second host");
                return Err(SessionError::HostAlreadyPresent { existing });
            }
        }

        let ready = self.bus.cell(ready_cell_name(id), false)?;
        if role == AuthorityRole::Host {
            *host = Some(id);
        }

        let participant = Participant {
            id,
            label: label.into(),
            role,
            joined_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            joined_at: unix_millis(),
        };
        self.members.insert(
            id,
            Member {
                participant: participant.clone(),
                ready,
            },
        );

        info!(
            participant_id = %id,
            role = ?role,
            participant_count = self.members.len(),
            "Participant joined"
        );
        Ok(participant)
    }

    /// Remove a connection and retire its ready flag
    pub fn on_leave(&self, id: ParticipantId) -> Result<Participant, SessionError> {
        self.ensure_server("leave")?;
        let mut host = self.host.lock();
        let Some((_, member)) = self.members.remove(&id) else {
            debug!(participant_id = %id, "Leave for unknown participant");
            return Err(SessionError::UnknownParticipant(id));
        };
        if *host == Some(id) {
            *host = None;
        }
        member.ready.retire();

        info!(
            participant_id = %id,
            participant_count = self.members.len(),
            "Participant left"
        );
        Ok(member.participant)
    }

    /// Mark a participant (un)ready for the next admission; true if the flag changed
    pub fn set_ready(&self, id: ParticipantId, ready: bool) -> Result<bool, SessionError> {
        self.ensure_server("set ready")?;
        let member = self
            .members
            .get(&id)
            .ok_or(SessionError::UnknownParticipant(id))?;
        let changed = member.ready.set(ready)?;
        if changed {
            info!(participant_id = %id, ready, "Readiness changed");
        }
        Ok(changed)
    }

    /// Clear every ready flag; admission consumes readiness
    pub fn clear_ready(&self) -> Result<(), SessionError> {
        self.ensure_server("clear ready")?;
        for member in self.members.iter() {
            member.ready.set(false)?;
        }
        Ok(())
    }

    pub fn is_ready(&self, id: ParticipantId) -> bool {
        self.members.get(&id).is_some_and(|m| m.ready.get())
    }

    /// Connected participants that have not readied up, in admission order
    pub fn not_ready(&self) -> Vec<ParticipantId> {
        self.ordered()
            .into_iter()
            .map(|p| p.id)
            .filter(|id| !self.is_ready(*id))
            .collect()
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn get(&self, id: ParticipantId) -> Option<Participant> {
        self.members.get(&id).map(|m| m.participant.clone())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn host(&self) -> Option<ParticipantId> {
        *self.host.lock()
    }

    /// Participants in admission order: host first, then remotes by connection order
    pub fn ordered(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self
            .members
            .iter()
            .map(|m| m.participant.clone())
            .collect();
        participants.sort_by_key(|p| (!p.is_host(), p.joined_seq));
        participants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    fn registry() -> SessionRegistry {
        SessionRegistry::new(ReplicationBus::new(Role::Server))
    }

    #[test]
    fn test_join_and_leave_track_membership() {
        let registry = registry();
        registry
            .on_join(ParticipantId(1), "Host", AuthorityRole::Host)
            .unwrap();
        registry
            .on_join(ParticipantId(2), "Player 2", AuthorityRole::Remote)
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(ParticipantId(2)));

        let left = registry.on_leave(ParticipantId(2)).unwrap();
        assert_eq!(left.label, "Player 2");
        assert!(!registry.contains(ParticipantId(2)));
        assert!(matches!(
            registry.on_leave(ParticipantId(2)),
            Err(SessionError::UnknownParticipant(ParticipantId(2)))
        ));
    }

    #[test]
    fn test_duplicate_join_is_rejected() {
        let registry = registry();
        assert_ok!(registry.on_join(ParticipantId(5), "A", AuthorityRole::Remote));
        let err = assert_err!(registry.on_join(ParticipantId(5), "A again", AuthorityRole::Remote));

        assert!(matches!(err, SessionError::DuplicateParticipant(ParticipantId(5))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(ParticipantId(5)).unwrap().label, "A");
    }

    #[test]
    fn test_only_one_host_at_a_time() {
        let registry = registry();
        registry
            .on_join(ParticipantId(1), "Host", AuthorityRole::Host)
            .unwrap();
        let err = registry
            .on_join(ParticipantId(2), "Other", AuthorityRole::Host)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::HostAlreadyPresent {
                existing: ParticipantId(1)
            }
        ));
        assert!(!registry.contains(ParticipantId(2)));

        registry.on_leave(ParticipantId(1)).unwrap();
        assert_eq!(registry.host(), None);
        registry
            .on_join(ParticipantId(2), "Other", AuthorityRole::Host)
            .unwrap();
        assert_eq!(registry.host(), Some(ParticipantId(2)));
    }

    #[test]
    fn test_ordered_puts_host_first_then_connection_order() {
        let registry = registry();
        registry
            .on_join(ParticipantId(30), "C", AuthorityRole::Remote)
            .unwrap();
        registry
            .on_join(ParticipantId(10), "A", AuthorityRole::Remote)
            .unwrap();
        registry
            .on_join(ParticipantId(20), "Host", AuthorityRole::Host)
            .unwrap();

        let ids: Vec<ParticipantId> = registry.ordered().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![ParticipantId(20), ParticipantId(30), ParticipantId(10)]);
    }

    #[test]
    fn test_client_role_cannot_change_membership() {
        let registry = SessionRegistry::new(ReplicationBus::new(Role::Client));

        let err = assert_err!(registry.on_join(ParticipantId(1), "A", AuthorityRole::Host));
        assert!(matches!(err, SessionError::AuthorityViolation { .. }));
        assert!(registry.is_empty());
        assert_eq!(registry.host(), None);

        assert!(matches!(
            registry.on_leave(ParticipantId(1)),
            Err(SessionError::AuthorityViolation { .. })
        ));
        assert!(matches!(
            registry.set_ready(ParticipantId(1), true),
            Err(SessionError::AuthorityViolation { .. })
        ));
    }

    #[test]
    fn test_ready_flags_are_replicated_and_cleared() {
        let bus = ReplicationBus::new(Role::Server);
        let registry = SessionRegistry::new(bus.clone());
        registry
            .on_join(ParticipantId(1), "Host", AuthorityRole::Host)
            .unwrap();
        registry
            .on_join(ParticipantId(2), "B", AuthorityRole::Remote)
            .unwrap();
        assert_eq!(registry.not_ready(), vec![ParticipantId(1), ParticipantId(2)]);

        assert!(registry.set_ready(ParticipantId(2), true).unwrap());
        assert!(!registry.set_ready(ParticipantId(2), true).unwrap());
        assert_eq!(registry.not_ready(), vec![ParticipantId(1)]);

        let cell = ready_cell_name(ParticipantId(2));
        let published = bus
            .snapshot()
            .into_iter()
            .find(|envelope| envelope.cell_name() == Some(cell.as_str()));
        assert!(published.is_some());

        registry.clear_ready().unwrap();
        assert!(!registry.is_ready(ParticipantId(2)));

        registry.on_leave(ParticipantId(2)).unwrap();
        assert!(bus
            .snapshot()
            .iter()
            .all(|envelope| envelope.cell_name() != Some(cell.as_str())));
        assert!(matches!(
            registry.set_ready(ParticipantId(2), true),
            Err(SessionError::UnknownParticipant(ParticipantId(2)))
        ));
    }

    #[test]
    fn test_membership_matches_connected_set_over_event_sequence() {
        let registry = registry();
        let mut connected = HashSet::new();

        // Scripted churn including duplicate joins and leaves of absent ids.
        let script: &[(bool, u64)] = &[
            (true, 1),
            (true, 2),
            (true, 2),
            (false, 3),
            (true, 3),
            (false, 1),
            (true, 4),
            (false, 1),
            (true, 1),
            (false, 2),
            (false, 4),
            (true, 5),
        ];

        for &(join, raw) in script {
            let id = ParticipantId(raw);
            if join {
                let accepted = registry.on_join(id, "p", AuthorityRole::Remote).is_ok();
                assert_eq!(accepted, connected.insert(id));
            } else {
                let removed = registry.on_leave(id).is_ok();
                assert_eq!(removed, connected.remove(&id));
            }

            let members: HashSet<ParticipantId> =
                registry.ordered().iter().map(|p| p.id).collect();
            assert_eq!(members, connected);
            assert_eq!(registry.len(), connected.len());
        }
    }
}
