//! Application state shared across routes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::Config;
use crate::game::{Arena, GameError, MatchOrchestrator, ReplicatedSceneLoader, Role, SimWorld};
use crate::replication::ReplicationBus;
use crate::session::{ParticipantId, SessionRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: ReplicationBus,
    pub sessions: Arc<SessionRegistry>,
    pub arena: Arc<Mutex<Arena>>,
    pub orchestrator: Arc<MatchOrchestrator>,
    next_participant: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, GameError> {
        let config = Arc::new(config);
        let game = Arc::new(config.game.clone());

        // This process is the authority for everything it replicates
        let bus = ReplicationBus::new(Role::Server);
        let sessions = Arc::new(SessionRegistry::new(bus.clone()));

        // Deaths and membership changes wake the round poll early
        let wake = Arc::new(Notify::new());
        let arena = Arc::new(Mutex::new(Arena::new(
            bus.clone(),
            &game,
            Box::new(SimWorld::new()),
            wake.clone(),
        )));

        let orchestrator = Arc::new(MatchOrchestrator::new(
            game,
            bus.clone(),
            sessions.clone(),
            arena.clone(),
            Arc::new(ReplicatedSceneLoader::new(bus.clone())),
            wake,
        )?);

        Ok(Self {
            config,
            bus,
            sessions,
            arena,
            orchestrator,
            next_participant: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Fresh id for a new connection
    pub fn next_participant_id(&self) -> ParticipantId {
        ParticipantId(self.next_participant.fetch_add(1, Ordering::Relaxed))
    }
}
