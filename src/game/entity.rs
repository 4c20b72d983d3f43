//! Player entity and its replicated cells

use serde::{Deserialize, Serialize};

use super::world::{BodyHandle, Transform};
use crate::config::Color;
use crate::replication::{ReplicatedCell, ReplicationBus, ReplicationError};
use crate::session::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an entity cell on the bus, e.g. `entity.4.health`
pub fn cell_name(entity: EntityId, field: &str) -> String {
    format!("entity.{}.{}", entity, field)
}

/// Drive input, both axes in -1..=1
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriveInput {
    pub throttle: f32,
    pub turn: f32,
}

impl DriveInput {
    pub fn clamped(throttle: f32, turn: f32) -> Self {
        let axis = |v: f32| if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
        Self {
            throttle: axis(throttle),
            turn: axis(turn),
        }
    }
}

/// Server-written state of one entity
pub(crate) struct EntityCells {
    pub owner: ReplicatedCell<ParticipantId>,
    pub transform: ReplicatedCell<Transform>,
    pub health: ReplicatedCell<f32>,
    pub color: ReplicatedCell<Color>,
    pub wins: ReplicatedCell<u32>,
    pub active: ReplicatedCell<bool>,
    pub control: ReplicatedCell<bool>,
}

impl EntityCells {
    pub fn new(
        bus: &ReplicationBus,
        id: EntityId,
        owner: ParticipantId,
        transform: Transform,
        health: f32,
    ) -> Result<Self, ReplicationError> {
        Ok(Self {
            owner: bus.cell(cell_name(id, "owner"), owner)?,
            transform: bus.cell(cell_name(id, "transform"), transform)?,
            health: bus.cell(cell_name(id, "health"), health)?,
            color: bus.cell(cell_name(id, "color"), Color::WHITE)?,
            wins: bus.cell(cell_name(id, "wins"), 0u32)?,
            active: bus.cell(cell_name(id, "active"), true)?,
            control: bus.cell(cell_name(id, "control"), false)?,
        })
    }

    pub fn retire(self) {
        self.owner.retire();
        self.transform.retire();
        self.health.retire();
        self.color.retire();
        self.wins.retire();
        self.active.retire();
        self.control.retire();
    }
}

/// A participant's controllable avatar
pub struct PlayerEntity {
    pub id: EntityId,
    pub owner: ParticipantId,
    pub label: String,
    pub slot: usize,
    pub body: BodyHandle,
    pub(crate) cells: EntityCells,
    /// Set once this life's death has been resolved; cleared by a reset
    pub(crate) death_resolved: bool,
    pub(crate) deaths: u32,
    pub(crate) drive: DriveInput,
}

impl PlayerEntity {
    pub fn health(&self) -> f32 {
        self.cells.health.get()
    }

    pub fn wins(&self) -> u32 {
        self.cells.wins.get()
    }

    pub fn is_active(&self) -> bool {
        self.cells.active.get()
    }

    pub fn control_enabled(&self) -> bool {
        self.cells.control.get()
    }

    pub fn color(&self) -> Color {
        self.cells.color.get()
    }

    pub fn transform(&self) -> Transform {
        self.cells.transform.get()
    }

    pub fn handle(&self) -> EntityHandle {
        EntityHandle {
            id: self.id,
            owner: self.owner,
            slot: self.slot,
        }
    }

    pub fn view(&self) -> EntityView {
        EntityView {
            id: self.id,
            owner: self.owner,
            label: self.label.clone(),
            slot: self.slot,
            health: self.health(),
            wins: self.wins(),
            active: self.is_active(),
            control_enabled: self.control_enabled(),
            color: self.color(),
            transform: self.transform(),
        }
    }
}

/// Lightweight reference to a live entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntityHandle {
    pub id: EntityId,
    pub owner: ParticipantId,
    pub slot: usize,
}

/// Read-only snapshot of an entity, for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct EntityView {
    pub id: EntityId,
    pub owner: ParticipantId,
    pub label: String,
    pub slot: usize,
    pub health: f32,
    pub wins: u32,
    pub active: bool,
    pub control_enabled: bool,
    pub color: Color,
    pub transform: Transform,
}
