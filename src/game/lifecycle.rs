//! Entity lifecycle - spawn, despawn and reset of participant entities
//!
//! The manager owns the physical world and the spawn slot table. Every live entity has
//! exactly one owner, one slot and one body; slots are released on despawn so a later
//! participant can reuse them.

use std::collections::{HashMap, HashSet};

use glam::Vec3;
use tracing::{debug, info, warn};

use super::entity::{DriveInput, EntityCells, EntityHandle, EntityId, EntityView, PlayerEntity};
use super::error::{ensure_server, GameError};
use super::events::GameEvent;
use super::world::{BodyDesc, BodyHandle, LayerMask, PhysicsWorld, Transform, TANK_MOVE_SPEED, TANK_TURN_SPEED};
use crate::config::{GameConfig, SpawnSlot};
use crate::replication::{ReplicationBus, Targets};
use crate::session::{Participant, ParticipantId};

/// Outcome of an entity's health reaching zero
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeathRecord {
    pub entity: EntityId,
    pub death: u32,
    pub position: Vec3,
}

pub struct EntityLifecycleManager {
    bus: ReplicationBus,
    slots: Vec<SpawnSlot>,
    occupancy: Vec<Option<ParticipantId>>,
    entities: HashMap<ParticipantId, PlayerEntity>,
    world: Box<dyn PhysicsWorld>,
    starting_health: f32,
    next_entity_id: u64,
}

impl EntityLifecycleManager {
    pub fn new(bus: ReplicationBus, config: &GameConfig, world: Box<dyn PhysicsWorld>) -> Self {
        Self {
            bus,
            slots: config.spawn_slots.clone(),
            occupancy: vec![None; config.spawn_slots.len()],
            entities: HashMap::new(),
            world,
            starting_health: config.starting_health,
            next_entity_id: 1,
        }
    }

    /// Host takes slot 0; everyone else the lowest free slot, slot 0 last
    fn allocate_slot(&self, participant: &Participant) -> Option<usize> {
        let free = |slot: &usize| self.occupancy[*slot].is_none();
        if participant.is_host() && self.occupancy.first().is_some_and(Option::is_none) {
            return Some(0);
        }
        (1..self.occupancy.len())
            .find(free)
            .or_else(|| (0..self.occupancy.len().min(1)).find(free))
    }

    /// Create the entity for `participant` at its spawn slot
    pub fn spawn_for_participant(
        &mut self,
        participant: &Participant,
        active: bool,
    ) -> Result<EntityHandle, GameError> {
        ensure_server(self.bus.role(), "spawn entity")?;

        if self.entities.contains_key(&participant.id) {
            warn!(participant_id = %participant.id, "Participant already has an entity");
            return Err(GameError::DuplicateEntity(participant.id));
        }

        let slot = self.allocate_slot(participant).ok_or(GameError::NoFreeSlot {
            capacity: self.slots.len(),
        })?;
        let spawn = self.slots[slot];
        let transform = Transform::from(spawn);

        let id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;
        let cells = EntityCells::new(&self.bus, id, participant.id, transform, self.starting_health)?;
        cells.color.set(spawn.color)?;
        cells.active.set(active)?;

        let body = self.world.spawn_body(BodyDesc::tank(transform));
        self.world.set_active(body, active);

        self.occupancy[slot] = Some(participant.id);
        self.entities.insert(
            participant.id,
            PlayerEntity {
                id,
                owner: participant.id,
                label: participant.label.clone(),
                slot,
                body,
                cells,
                death_resolved: false,
                deaths: 0,
                drive: DriveInput::default(),
            },
        );

        self.bus.send(
            Targets::All,
            &GameEvent::EntitySpawned {
                entity: id,
                owner: participant.id,
                slot,
            },
        )?;

        info!(
            participant_id = %participant.id,
            entity_id = %id,
            slot,
            active,
            "Entity spawned"
        );
        Ok(EntityHandle {
            id,
            owner: participant.id,
            slot,
        })
    }

    /// Remove the participant's entity; a participant without one is a no-op
    pub fn despawn_for_participant(
        &mut self,
        participant: ParticipantId,
    ) -> Result<Option<EntityHandle>, GameError> {
        ensure_server(self.bus.role(), "despawn entity")?;

        let Some(entity) = self.entities.remove(&participant) else {
            debug!(participant_id = %participant, "No entity to despawn");
            return Ok(None);
        };

        let handle = entity.handle();
        self.occupancy[entity.slot] = None;
        self.world.despawn_body(entity.body);
        entity.cells.retire();

        self.bus.send(
            Targets::All,
            &GameEvent::EntityDespawned {
                entity: handle.id,
                owner: participant,
            },
        )?;

        info!(participant_id = %participant, entity_id = %handle.id, "Entity despawned");
        Ok(Some(handle))
    }

    pub fn despawn_all(&mut self) -> Result<usize, GameError> {
        let owners: Vec<ParticipantId> = self.entities.keys().copied().collect();
        let mut removed = 0;
        for owner in owners {
            if self.despawn_for_participant(owner)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Return every entity to full health at its slot, stationary and active
    pub fn reset_all(&mut self) -> Result<(), GameError> {
        ensure_server(self.bus.role(), "reset entities")?;

        for entity in self.entities.values_mut() {
            let transform = Transform::from(self.slots[entity.slot]);
            self.world.set_transform(entity.body, transform);
            self.world.clear_motion(entity.body);
            self.world.set_active(entity.body, true);

            entity.cells.health.set(self.starting_health)?;
            entity.cells.transform.set(transform)?;
            entity.cells.active.set(true)?;
            entity.death_resolved = false;
            entity.drive = DriveInput::default();
        }

        debug!(entities = self.entities.len(), "Entities reset");
        Ok(())
    }

    /// Despawn player bodies the manager does not track; returns how many
    pub fn destroy_all_unmanaged(&mut self) -> Result<usize, GameError> {
        ensure_server(self.bus.role(), "destroy unmanaged bodies")?;

        let tracked: HashSet<BodyHandle> = self.entities.values().map(|e| e.body).collect();
        let mut destroyed = 0;
        for body in self.world.bodies_in(LayerMask::PLAYERS) {
            if !tracked.contains(&body) {
                warn!(body = body.0, "Destroying unmanaged player body");
                self.world.despawn_body(body);
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    pub fn set_control_all(&mut self, enabled: bool) -> Result<(), GameError> {
        ensure_server(self.bus.role(), "toggle control")?;

        for entity in self.entities.values_mut() {
            entity.cells.control.set(enabled)?;
            if !enabled {
                entity.drive = DriveInput::default();
                self.world.set_velocity(entity.body, Vec3::ZERO);
            }
        }
        Ok(())
    }

    /// Record the participant's drive input; applied on the next tick
    pub fn set_drive(&mut self, participant: ParticipantId, throttle: f32, turn: f32) -> Result<(), GameError> {
        let entity = self
            .entities
            .get_mut(&participant)
            .ok_or(GameError::UnknownParticipant(participant))?;
        if !entity.is_active() || !entity.control_enabled() {
            return Err(GameError::ControlDisabled(participant));
        }
        entity.drive = DriveInput::clamped(throttle, turn);
        Ok(())
    }

    /// Turn input into body motion for every controllable entity
    pub fn apply_drive(&mut self, dt: f32) {
        for entity in self.entities.values() {
            if !entity.is_active() || !entity.control_enabled() {
                continue;
            }
            let Some(mut transform) = self.world.transform(entity.body) else {
                continue;
            };
            transform.yaw += entity.drive.turn * TANK_TURN_SPEED * dt;
            self.world.set_transform(entity.body, transform);
            self.world
                .set_velocity(entity.body, transform.forward() * entity.drive.throttle * TANK_MOVE_SPEED);
        }
    }

    /// Copy body transforms into the replicated cells
    pub fn sync_transforms(&mut self) -> Result<(), GameError> {
        for entity in self.entities.values() {
            if let Some(transform) = self.world.transform(entity.body) {
                entity.cells.transform.set(transform)?;
            }
        }
        Ok(())
    }

    /// Subtract damage, clamped to [0, starting health]; returns the new health
    pub(crate) fn apply_damage(&mut self, participant: ParticipantId, damage: f32) -> Result<f32, GameError> {
        let max = self.starting_health;
        let entity = self
            .entities
            .get(&participant)
            .ok_or(GameError::UnknownParticipant(participant))?;
        let health = (entity.health() - damage).clamp(0.0, max);
        entity.cells.health.set(health)?;
        Ok(health)
    }

    /// Deactivate a dead entity; `None` if this life's death was already resolved
    pub(crate) fn eliminate(&mut self, participant: ParticipantId) -> Result<Option<DeathRecord>, GameError> {
        let entity = self
            .entities
            .get_mut(&participant)
            .ok_or(GameError::UnknownParticipant(participant))?;
        if entity.death_resolved {
            return Ok(None);
        }
        entity.death_resolved = true;
        entity.deaths += 1;
        entity.drive = DriveInput::default();

        let position = self
            .world
            .transform(entity.body)
            .map(|t| t.position)
            .unwrap_or(Vec3::ZERO);
        self.world.clear_motion(entity.body);
        self.world.set_active(entity.body, false);
        entity.cells.active.set(false)?;
        entity.cells.control.set(false)?;

        info!(participant_id = %participant, entity_id = %entity.id, death = entity.deaths, "Entity eliminated");
        Ok(Some(DeathRecord {
            entity: entity.id,
            death: entity.deaths,
            position,
        }))
    }

    pub(crate) fn record_win(&mut self, participant: ParticipantId) -> Result<u32, GameError> {
        let entity = self
            .entities
            .get(&participant)
            .ok_or(GameError::UnknownParticipant(participant))?;
        let wins = entity.wins() + 1;
        entity.cells.wins.set(wins)?;
        Ok(wins)
    }

    pub fn get(&self, participant: ParticipantId) -> Option<&PlayerEntity> {
        self.entities.get(&participant)
    }

    pub fn owner_of_body(&self, body: BodyHandle) -> Option<ParticipantId> {
        self.entities.values().find(|e| e.body == body).map(|e| e.owner)
    }

    pub fn by_slot(&self, slot: usize) -> Option<&PlayerEntity> {
        self.occupancy
            .get(slot)
            .copied()
            .flatten()
            .and_then(|owner| self.entities.get(&owner))
    }

    /// Live entities in slot order
    pub fn iter_by_slot(&self) -> impl Iterator<Item = &PlayerEntity> + '_ {
        (0..self.occupancy.len()).filter_map(|slot| self.by_slot(slot))
    }

    pub fn active_entities(&self) -> Vec<EntityHandle> {
        self.iter_by_slot()
            .filter(|e| e.is_active())
            .map(PlayerEntity::handle)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_active()).count()
    }

    pub fn views(&self) -> Vec<EntityView> {
        self.iter_by_slot().map(PlayerEntity::view).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bus(&self) -> &ReplicationBus {
        &self.bus
    }

    pub fn world(&self) -> &dyn PhysicsWorld {
        self.world.as_ref()
    }

    pub fn world_mut(&mut self) -> &mut dyn PhysicsWorld {
        self.world.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::SimWorld;
    use crate::replication::{Envelope, Role};
    use crate::session::{AuthorityRole, SessionRegistry};
    use tokio_test::{assert_err, assert_ok};

    fn manager(bus: &ReplicationBus) -> EntityLifecycleManager {
        EntityLifecycleManager::new(bus.clone(), &GameConfig::default(), Box::new(SimWorld::new()))
    }

    fn participants(sessions: &SessionRegistry, count: u64) -> Vec<Participant> {
        (0..count)
            .map(|i| {
                let role = if i == 0 { AuthorityRole::Host } else { AuthorityRole::Remote };
                sessions
                    .on_join(ParticipantId(i + 1), format!("PLAYER {}", i + 1), role)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_spawn_assigns_slots_and_colors() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 3);

        // Remotes first: the host still ends up in slot 0.
        let b = entities.spawn_for_participant(&players[1], true).unwrap();
        let c = entities.spawn_for_participant(&players[2], true).unwrap();
        let host = entities.spawn_for_participant(&players[0], true).unwrap();

        assert_eq!((host.slot, b.slot, c.slot), (0, 1, 2));
        let config = GameConfig::default();
        assert_eq!(entities.by_slot(2).unwrap().color(), config.spawn_slots[2].color);
        assert_eq!(
            entities.by_slot(1).unwrap().transform().position,
            config.spawn_slots[1].position
        );
        assert_eq!(entities.len(), 3);
    }

    #[test]
    fn test_second_spawn_for_same_participant_is_rejected() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 1);

        assert_ok!(entities.spawn_for_participant(&players[0], true));
        let err = assert_err!(entities.spawn_for_participant(&players[0], true));
        assert!(matches!(err, GameError::DuplicateEntity(ParticipantId(1))));
        assert_eq!(entities.len(), 1);
    }

    #[test]
    fn test_full_table_rejects_spawn() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 5);

        for p in &players[..4] {
            entities.spawn_for_participant(p, true).unwrap();
        }
        let err = entities.spawn_for_participant(&players[4], true).unwrap_err();
        assert!(matches!(err, GameError::NoFreeSlot { capacity: 4 }));
    }

    #[test]
    fn test_despawn_releases_slot_and_retires_cells() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 3);
        entities.spawn_for_participant(&players[0], true).unwrap();
        let gone = entities.spawn_for_participant(&players[1], true).unwrap();

        let mut rx = bus.subscribe();
        assert_eq!(entities.despawn_for_participant(players[1].id).unwrap(), Some(gone));
        assert_eq!(entities.despawn_for_participant(players[1].id).unwrap(), None);

        let mut retired = 0;
        while let Ok(envelope) = rx.try_recv() {
            if matches!(envelope, Envelope::CellRetired { .. }) {
                retired += 1;
            }
        }
        assert_eq!(retired, 7);
        assert!(bus
            .snapshot()
            .iter()
            .all(|e| !e.cell_name().unwrap_or("").starts_with(&format!("entity.{}.", gone.id))));

        let reuse = entities.spawn_for_participant(&players[2], true).unwrap();
        assert_eq!(reuse.slot, gone.slot);
        assert_eq!(entities.world().bodies_in(LayerMask::PLAYERS).len(), 2);
    }

    #[test]
    fn test_reset_all_is_idempotent() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 2);
        entities.spawn_for_participant(&players[0], true).unwrap();
        entities.spawn_for_participant(&players[1], true).unwrap();

        let body = entities.get(players[1].id).unwrap().body;
        entities.apply_damage(players[1].id, 150.0).unwrap();
        entities.eliminate(players[1].id).unwrap();
        entities.world_mut().set_transform(body, Transform::new(Vec3::new(3.0, 0.0, 3.0), 1.0));
        entities.world_mut().apply_impulse(body, 1000.0, Vec3::new(3.0, 0.0, 2.0), 5.0);

        entities.reset_all().unwrap();
        let first: Vec<_> = entities.views().into_iter().map(|v| (v.health, v.active, v.transform)).collect();
        entities.reset_all().unwrap();
        let second: Vec<_> = entities.views().into_iter().map(|v| (v.health, v.active, v.transform)).collect();

        assert_eq!(first, second);
        let config = GameConfig::default();
        for (slot, (health, active, transform)) in second.into_iter().enumerate() {
            assert_eq!(health, 100.0);
            assert!(active);
            assert_eq!(transform, Transform::from(config.spawn_slots[slot]));
        }
        assert_eq!(entities.world().velocity(body), Some(Vec3::ZERO));
        assert!(entities.world().is_active(body));
    }

    #[test]
    fn test_damage_clamps_and_death_resolves_once() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 1);
        entities.spawn_for_participant(&players[0], true).unwrap();

        assert_eq!(entities.apply_damage(players[0].id, -50.0).unwrap(), 100.0);
        assert_eq!(entities.apply_damage(players[0].id, 250.0).unwrap(), 0.0);

        let first = entities.eliminate(players[0].id).unwrap();
        assert_eq!(first.map(|d| d.death), Some(1));
        assert_eq!(entities.eliminate(players[0].id).unwrap(), None);
        assert_eq!(entities.active_count(), 0);
    }

    #[test]
    fn test_unmanaged_bodies_are_destroyed() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 1);
        entities.spawn_for_participant(&players[0], true).unwrap();
        entities
            .world_mut()
            .spawn_body(BodyDesc::tank(Transform::default()));

        assert_eq!(entities.destroy_all_unmanaged().unwrap(), 1);
        assert_eq!(entities.destroy_all_unmanaged().unwrap(), 0);
        assert_eq!(entities.world().bodies_in(LayerMask::PLAYERS).len(), 1);
    }

    #[test]
    fn test_client_role_cannot_spawn() {
        let bus = ReplicationBus::new(Role::Client);
        let sessions = SessionRegistry::new(ReplicationBus::new(Role::Server));
        let mut entities = manager(&bus);
        let players = participants(&sessions, 1);

        let err = entities.spawn_for_participant(&players[0], true).unwrap_err();
        assert!(matches!(err, GameError::AuthorityViolation { .. }));
        assert!(entities.is_empty());
    }

    #[test]
    fn test_drive_requires_control() {
        let bus = ReplicationBus::new(Role::Server);
        let sessions = SessionRegistry::new(bus.clone());
        let mut entities = manager(&bus);
        let players = participants(&sessions, 1);
        entities.spawn_for_participant(&players[0], true).unwrap();

        let err = assert_err!(entities.set_drive(players[0].id, 1.0, 0.0));
        assert!(matches!(err, GameError::ControlDisabled(_)));

        assert_ok!(entities.set_control_all(true));
        assert_ok!(entities.set_drive(players[0].id, 1.0, 0.0));
        entities.apply_drive(0.1);
        let body = entities.get(players[0].id).unwrap().body;
        assert!(entities.world().velocity(body).unwrap().length() > 0.0);
    }
}
