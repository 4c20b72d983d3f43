//! The arena: entity lifecycle and damage resolution sharing one physical world

use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use super::damage::{DamageResolver, ProjectileReport};
use super::error::GameError;
use super::lifecycle::EntityLifecycleManager;
use super::world::PhysicsWorld;
use crate::config::GameConfig;
use crate::replication::ReplicationBus;
use crate::session::ParticipantId;

pub struct Arena {
    pub entities: EntityLifecycleManager,
    pub damage: DamageResolver,
}

impl Arena {
    /// `deaths` is notified whenever an entity is eliminated
    pub fn new(
        bus: ReplicationBus,
        config: &GameConfig,
        world: Box<dyn PhysicsWorld>,
        deaths: Arc<Notify>,
    ) -> Self {
        Self {
            entities: EntityLifecycleManager::new(bus.clone(), config, world),
            damage: DamageResolver::new(bus, config, deaths),
        }
    }

    /// One simulation step: drive, integrate, contacts, expiry, transform cells
    pub fn tick(&mut self, dt: f32) -> Result<ProjectileReport, GameError> {
        self.entities.apply_drive(dt);
        let contacts = self.entities.world_mut().step(dt);
        let report = self.damage.step(&mut self.entities, &contacts, dt)?;
        self.entities.sync_transforms()?;
        Ok(report)
    }

    pub fn fire(&mut self, participant: ParticipantId, launch_force: f32) -> Result<Uuid, GameError> {
        self.damage.fire(&mut self.entities, participant, launch_force)
    }

    pub fn drive(&mut self, participant: ParticipantId, throttle: f32, turn: f32) -> Result<(), GameError> {
        self.entities.set_drive(participant, throttle, turn)
    }

    /// Prepare for a new round: no shells in flight, everyone reset and frozen
    pub fn reset_round(&mut self) -> Result<(), GameError> {
        self.damage.clear(&mut self.entities);
        self.entities.reset_all()?;
        self.entities.set_control_all(false)
    }

    /// Clear shells in flight and despawn every entity
    pub fn clear(&mut self) -> Result<usize, GameError> {
        self.damage.clear(&mut self.entities);
        self.entities.despawn_all()
    }
}
