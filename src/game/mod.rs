//! Match core: arena entities, damage and the round state machine

pub mod arena;
pub mod damage;
pub mod entity;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod orchestrator;
pub mod scene;
pub mod tick;
pub mod world;

pub use arena::Arena;
pub use damage::{falloff_damage, AreaEffect, DamageResolver};
pub use entity::{EntityHandle, EntityId, EntityView, PlayerEntity};
pub use error::GameError;
pub use events::{GameEvent, LoadMode};
pub use lifecycle::EntityLifecycleManager;
pub use orchestrator::{MatchOrchestrator, MatchState, MatchStatus};
pub use scene::{ReplicatedSceneLoader, SceneLoader};
pub use tick::run_simulation;
pub use world::{LayerMask, PhysicsWorld, SimWorld, Transform};

pub use crate::replication::Role;
