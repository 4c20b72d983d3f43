//! Scene loading boundary

use tracing::info;

use super::error::GameError;
use super::events::{GameEvent, LoadMode};
use crate::replication::{ReplicationBus, Targets};

/// Loads a named scene on every participant
pub trait SceneLoader: Send + Sync {
    fn load_scene(&self, name: &str, mode: LoadMode) -> Result<(), GameError>;
}

/// Tells every observer to load the scene via a directed event
pub struct ReplicatedSceneLoader {
    bus: ReplicationBus,
}

impl ReplicatedSceneLoader {
    pub fn new(bus: ReplicationBus) -> Self {
        Self { bus }
    }
}

impl SceneLoader for ReplicatedSceneLoader {
    fn load_scene(&self, name: &str, mode: LoadMode) -> Result<(), GameError> {
        self.bus.send(
            Targets::All,
            &GameEvent::LoadScene {
                name: name.to_string(),
                mode,
            },
        )?;
        info!(scene = name, mode = ?mode, "Scene load requested");
        Ok(())
    }
}
