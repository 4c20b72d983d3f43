//! Observer-side replica of the server's replicated state
//!
//! The mirror is what a presentation or UI layer holds. It tolerates redelivered and
//! reordered cell updates (older versions never roll a cell back) and drops events it has
//! already applied, so effect handlers run once per event.

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use tracing::debug;

use super::Envelope;
use crate::session::ParticipantId;

/// Why an envelope changed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Cell version at or below what is already applied
    StaleVersion,
    /// Update for a cell that has been retired
    RetiredCell,
    /// Event sequence already applied
    DuplicateEvent,
    /// Event addressed to other participants
    NotAddressed,
}

/// Result of applying one envelope
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorUpdate {
    CellChanged {
        cell: String,
        previous: Option<serde_json::Value>,
        current: serde_json::Value,
        version: u64,
    },
    CellRetired {
        cell: String,
    },
    Event {
        seq: u64,
        payload: serde_json::Value,
    },
    Ignored(IgnoreReason),
}

/// Read-only replica fed by the replication stream
#[derive(Debug, Default)]
pub struct ReplicaMirror {
    local: Option<ParticipantId>,
    cells: HashMap<String, (u64, serde_json::Value)>,
    /// Retired owner scopes such as `entity.7`; ids are never reused
    retired: HashSet<String>,
    last_event_seq: u64,
}

impl ReplicaMirror {
    /// Mirror for `participant`; events addressed elsewhere are skipped
    pub fn for_participant(participant: ParticipantId) -> Self {
        Self {
            local: Some(participant),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, envelope: Envelope) -> MirrorUpdate {
        match envelope {
            Envelope::CellUpdate {
                cell,
                version,
                value,
            } => self.apply_cell(cell, version, value),
            Envelope::CellRetired { cell } => {
                self.cells.remove(&cell);
                let scope = retirement_scope(&cell);
                if !self.retired.contains(scope) {
                    self.retired.insert(scope.to_string());
                }
                MirrorUpdate::CellRetired { cell }
            }
            Envelope::Event {
                seq,
                targets,
                payload,
            } => {
                if seq <= self.last_event_seq {
                    debug!(seq, "Dropping redelivered event");
                    return MirrorUpdate::Ignored(IgnoreReason::DuplicateEvent);
                }
                self.last_event_seq = seq;

                if let Some(local) = self.local {
                    if !targets.includes(local) {
                        return MirrorUpdate::Ignored(IgnoreReason::NotAddressed);
                    }
                }
                MirrorUpdate::Event { seq, payload }
            }
        }
    }

    fn apply_cell(&mut self, cell: String, version: u64, value: serde_json::Value) -> MirrorUpdate {
        if self.retired.contains(retirement_scope(&cell)) {
            return MirrorUpdate::Ignored(IgnoreReason::RetiredCell);
        }

        let previous = match self.cells.get(&cell) {
            Some((applied, _)) if *applied >= version => {
                debug!(cell = %cell, version, applied, "Dropping stale cell update");
                return MirrorUpdate::Ignored(IgnoreReason::StaleVersion);
            }
            Some((_, previous)) => Some(previous.clone()),
            None => None,
        };

        self.cells.insert(cell.clone(), (version, value.clone()));
        MirrorUpdate::CellChanged {
            cell,
            previous,
            current: value,
            version,
        }
    }

    /// Typed read of a cell's current value
    pub fn get<T: DeserializeOwned>(&self, cell: &str) -> Option<T> {
        self.cells
            .get(cell)
            .and_then(|(_, value)| serde_json::from_value(value.clone()).ok())
    }

    pub fn version(&self, cell: &str) -> Option<u64> {
        self.cells.get(cell).map(|(version, _)| *version)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Number of owners whose cells have been retired
    pub fn retired_scopes(&self) -> usize {
        self.retired.len()
    }
}

/// `entity.7.health` retires with the rest of `entity.7`; two-part names stand alone
fn retirement_scope(cell: &str) -> &str {
    match cell.match_indices('.').nth(1) {
        Some((end, _)) => &cell[..end],
        None => cell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{ReplicationBus, Role, Targets};
    use serde_json::json;

    fn update(cell: &str, version: u64, value: serde_json::Value) -> Envelope {
        Envelope::CellUpdate {
            cell: cell.to_string(),
            version,
            value,
        }
    }

    #[test]
    fn test_out_of_order_update_never_rolls_back() {
        let mut mirror = ReplicaMirror::default();

        mirror.apply(update("entity.1.health", 2, json!(40.0)));
        let result = mirror.apply(update("entity.1.health", 1, json!(70.0)));

        assert_eq!(result, MirrorUpdate::Ignored(IgnoreReason::StaleVersion));
        assert_eq!(mirror.get::<f32>("entity.1.health"), Some(40.0));
    }

    #[test]
    fn test_change_reports_previous_value() {
        let mut mirror = ReplicaMirror::default();
        mirror.apply(update("match.round", 0, json!(0)));

        match mirror.apply(update("match.round", 1, json!(1))) {
            MirrorUpdate::CellChanged {
                previous, current, ..
            } => {
                assert_eq!(previous, Some(json!(0)));
                assert_eq!(current, json!(1));
            }
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_event_applies_once() {
        let mut mirror = ReplicaMirror::for_participant(ParticipantId(1));
        let death = Envelope::Event {
            seq: 9,
            targets: Targets::All,
            payload: json!({"event": "death"}),
        };

        assert!(matches!(
            mirror.apply(death.clone()),
            MirrorUpdate::Event { seq: 9, .. }
        ));
        assert_eq!(
            mirror.apply(death),
            MirrorUpdate::Ignored(IgnoreReason::DuplicateEvent)
        );
    }

    #[test]
    fn test_event_for_other_participant_is_skipped() {
        let mut mirror = ReplicaMirror::for_participant(ParticipantId(1));
        let result = mirror.apply(Envelope::Event {
            seq: 1,
            targets: Targets::only(ParticipantId(2)),
            payload: json!("rejected"),
        });
        assert_eq!(result, MirrorUpdate::Ignored(IgnoreReason::NotAddressed));
    }

    #[test]
    fn test_retired_cell_is_not_resurrected_by_late_update() {
        let mut mirror = ReplicaMirror::default();
        mirror.apply(update("entity.3.health", 4, json!(10.0)));
        mirror.apply(Envelope::CellRetired {
            cell: "entity.3.health".to_string(),
        });

        let result = mirror.apply(update("entity.3.health", 5, json!(0.0)));
        assert_eq!(result, MirrorUpdate::Ignored(IgnoreReason::RetiredCell));
        assert_eq!(mirror.get::<f32>("entity.3.health"), None);
    }

    #[test]
    fn test_despawned_entity_leaves_one_tombstone() {
        let mut mirror = ReplicaMirror::default();
        let fields = ["owner", "transform", "health", "color", "wins", "active", "control"];
        for field in fields {
            mirror.apply(update(&format!("entity.3.{}", field), 1, json!(1)));
            mirror.apply(update(&format!("entity.4.{}", field), 1, json!(1)));
        }
        for field in fields {
            mirror.apply(Envelope::CellRetired {
                cell: format!("entity.3.{}", field),
            });
        }

        assert_eq!(mirror.retired_scopes(), 1);
        assert_eq!(
            mirror.apply(update("entity.3.wins", 2, json!(2))),
            MirrorUpdate::Ignored(IgnoreReason::RetiredCell)
        );
        assert!(matches!(
            mirror.apply(update("entity.4.wins", 2, json!(2))),
            MirrorUpdate::CellChanged { .. }
        ));
        assert_eq!(mirror.cell_count(), fields.len());
    }

    #[tokio::test]
    async fn test_mirror_converges_on_server_stream_with_redelivery() {
        let bus = ReplicationBus::new(Role::Server);
        let mut rx = bus.subscribe();
        let round = bus.cell("match.round", 0u32).unwrap();
        round.set(1).unwrap();
        round.set(2).unwrap();

        let mut delivered = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            // Simulate an unreliable channel delivering every envelope twice.
            delivered.push(envelope.clone());
            delivered.push(envelope);
        }

        let mut mirror = ReplicaMirror::default();
        for envelope in delivered {
            mirror.apply(envelope);
        }
        assert_eq!(mirror.get::<u32>("match.round"), Some(2));
        assert_eq!(mirror.version("match.round"), Some(2));
    }
}
