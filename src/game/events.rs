//! Directed events published on the replication bus

use glam::Vec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::EntityId;
use crate::session::ParticipantId;

/// How a scene load replaces what is currently loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Unload everything else
    Single,
    Additive,
}

/// One-shot notifications; observers run effects for each exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    EntitiesReady {
        count: usize,
    },
    EntitySpawned {
        entity: EntityId,
        owner: ParticipantId,
        slot: usize,
    },
    EntityDespawned {
        entity: EntityId,
        owner: ParticipantId,
    },
    RoundStarted {
        round: u32,
    },
    RoundSummary {
        round: u32,
        winner: Option<EntityId>,
        draw: bool,
        match_winner: Option<EntityId>,
        message: String,
    },
    Fired {
        entity: EntityId,
        projectile: Uuid,
        launch_force: f32,
    },
    Explosion {
        projectile: Option<Uuid>,
        center: Vec3,
        radius: f32,
    },
    /// `death` counts this entity's deaths, so (entity, death) is unique
    Death {
        entity: EntityId,
        death: u32,
        position: Vec3,
    },
    MatchConcluded {
        winner: EntityId,
        round: u32,
    },
    LoadScene {
        name: String,
        mode: LoadMode,
    },
    Rejected {
        code: String,
        message: String,
    },
}
