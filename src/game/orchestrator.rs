//! Match orchestration - the round state machine
//!
//! Idle -> RoundStarting -> RoundActive -> RoundEnding -> (RoundStarting | Idle).
//!
//! Every transition happens under the control lock, and every delayed continuation
//! carries the epoch it was scheduled in. Forcing the match back to Idle bumps the epoch
//! and cancels pending holds, so a continuation that wakes up late finds a mismatched
//! (epoch, phase) pair and is dropped instead of resurrecting the old round.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::arena::Arena;
use super::entity::{EntityHandle, EntityView, PlayerEntity};
use super::error::{ensure_server, GameError};
use super::events::{GameEvent, LoadMode};
use super::scene::SceneLoader;
use crate::config::GameConfig;
use crate::replication::{CellSubscription, ReplicatedCell, ReplicationBus, Targets};
use crate::session::{AuthorityRole, Participant, ParticipantId, SessionError, SessionRegistry};

/// Shown while Idle without enough participants
pub const WAITING_MESSAGE: &str = "Waiting for players...";

/// Shown while Idle with enough participants, some of them not ready
pub const READY_MESSAGE: &str = "Waiting for everyone to be ready...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    Idle,
    RoundStarting,
    RoundActive,
    RoundEnding,
}

/// Result of a delayed step: either it ran, or the match moved on without it
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation<T> {
    Proceed(T),
    Stale,
}

/// Handed out on admission; drives one match through its rounds
#[derive(Debug)]
pub struct MatchTicket {
    pub epoch: u64,
    cancel: watch::Receiver<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub round: u32,
    pub winner: Option<EntityHandle>,
    pub match_winner: Option<EntityHandle>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Concluded { winner: EntityHandle, rounds: u32 },
    Abandoned,
}

/// Public view of the match, for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct MatchStatus {
    pub state: MatchState,
    pub round: u32,
    pub message: String,
    pub participants: usize,
    pub host: Option<ParticipantId>,
    /// Connected participants that still have to ready up
    pub not_ready: Vec<ParticipantId>,
    pub entities: Vec<EntityView>,
}

struct MatchControl {
    epoch: u64,
    /// Signals the running match's holds to stop
    cancel: Option<watch::Sender<bool>>,
}

pub struct MatchOrchestrator {
    config: Arc<GameConfig>,
    bus: ReplicationBus,
    sessions: Arc<SessionRegistry>,
    arena: Arc<Mutex<Arena>>,
    scene: Arc<dyn SceneLoader>,
    /// Wakes the round poll early on deaths and membership changes
    wake: Arc<Notify>,
    /// Lock order: control, then arena
    control: Mutex<MatchControl>,
    state: ReplicatedCell<MatchState>,
    round: ReplicatedCell<u32>,
    message: ReplicatedCell<String>,
}

impl MatchOrchestrator {
    pub fn new(
        config: Arc<GameConfig>,
        bus: ReplicationBus,
        sessions: Arc<SessionRegistry>,
        arena: Arc<Mutex<Arena>>,
        scene: Arc<dyn SceneLoader>,
        wake: Arc<Notify>,
    ) -> Result<Self, GameError> {
        config.validate()?;

        Ok(Self {
            state: bus.cell("match.state", MatchState::Idle)?,
            round: bus.cell("match.round", 0u32)?,
            message: bus.cell("match.message", String::new())?,
            config,
            bus,
            sessions,
            arena,
            scene,
            wake,
            control: Mutex::new(MatchControl {
                epoch: 0,
                cancel: None,
            }),
        })
    }

    pub fn state(&self) -> MatchState {
        self.state.get()
    }

    pub fn round(&self) -> u32 {
        self.round.get()
    }

    pub fn message(&self) -> String {
        self.message.get()
    }

    pub fn subscribe_state(&self) -> CellSubscription<MatchState> {
        self.state.subscribe()
    }

    pub fn subscribe_round(&self) -> CellSubscription<u32> {
        self.round.subscribe()
    }

    pub fn arena(&self) -> &Arc<Mutex<Arena>> {
        &self.arena
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn status(&self) -> MatchStatus {
        MatchStatus {
            state: self.state(),
            round: self.round(),
            message: self.message(),
            participants: self.sessions.len(),
            host: self.sessions.host(),
            not_ready: self.sessions.not_ready(),
            entities: self.arena.lock().entities.views(),
        }
    }

    fn is_current(&self, control: &MatchControl, epoch: u64, expected: MatchState) -> bool {
        let phase = self.state.get();
        if control.epoch == epoch && phase == expected {
            return true;
        }
        debug!(
            epoch,
            current_epoch = control.epoch,
            expected = ?expected,
            phase = ?phase,
            "Dropping stale continuation"
        );
        false
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Register a connection; mid-match joiners get an entity right away
    ///
    /// Runs under the control lock so it cannot interleave with admission.
    pub fn on_participant_joined(
        &self,
        id: ParticipantId,
        label: impl Into<String>,
        role: AuthorityRole,
    ) -> Result<Participant, GameError> {
        let participant = {
            let _control = self.control.lock();
            let participant = self.sessions.on_join(id, label, role)?;
            if let Err(e) = self.spawn_late_joiner(&participant) {
                // Leave nothing registered for a join that did not complete
                if let Err(undo) = self.sessions.on_leave(id) {
                    warn!(participant_id = %id, error = %undo, "Failed to undo join");
                }
                return Err(e);
            }
            participant
        };

        self.wake.notify_one();
        Ok(participant)
    }

    /// Caller holds the control lock
    fn spawn_late_joiner(&self, participant: &Participant) -> Result<(), GameError> {
        let phase = self.state.get();
        if phase == MatchState::Idle {
            return Ok(());
        }

        // Joining mid-round means sitting it out until the next reset.
        let active = phase == MatchState::RoundStarting;
        let spawned = self
            .arena
            .lock()
            .entities
            .spawn_for_participant(participant, active);
        match spawned {
            Ok(handle) => {
                info!(participant_id = %participant.id, slot = handle.slot, phase = ?phase, "Late joiner spawned")
            }
            Err(GameError::DuplicateEntity(_)) => {
                debug!(participant_id = %participant.id, "Late joiner already has an entity")
            }
            Err(GameError::NoFreeSlot { capacity }) => self.reject_no_slot(participant.id, capacity)?,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Forget a connection and its entity; drops to Idle below the minimum
    pub fn on_participant_left(&self, id: ParticipantId) -> Result<bool, GameError> {
        {
            let mut control = self.control.lock();
            match self.sessions.on_leave(id) {
                Ok(_) => {}
                Err(SessionError::UnknownParticipant(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            }

            self.arena.lock().entities.despawn_for_participant(id)?;

            if self.sessions.len() < self.config.min_participants {
                self.force_idle_locked(&mut control, "not enough participants")?;
            }
        }

        self.wake.notify_one();
        Ok(true)
    }

    fn reject_no_slot(&self, participant: ParticipantId, capacity: usize) -> Result<(), GameError> {
        warn!(participant_id = %participant, capacity, "No free spawn slot");
        self.bus.send(
            Targets::only(participant),
            &GameEvent::Rejected {
                code: "no_free_slot".to_string(),
                message: format!("All {} spawn slots are taken", capacity),
            },
        )?;
        Ok(())
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Spawn everyone connected and enter the first round
    pub fn admit_participants(&self) -> Result<MatchTicket, GameError> {
        ensure_server(self.bus.role(), "admit participants")?;

        let mut control = self.control.lock();
        let phase = self.state.get();
        if phase != MatchState::Idle {
            warn!(phase = ?phase, "Admission requested while a match is running");
            return Err(GameError::InvalidPhaseTransition {
                operation: "admit participants",
                phase,
            });
        }

        let participants = self.sessions.ordered();
        if participants.len() < self.config.min_participants {
            return Err(GameError::NotEnoughParticipants {
                required: self.config.min_participants,
                present: participants.len(),
            });
        }

        let waiting = self.sessions.not_ready();
        if !waiting.is_empty() {
            debug!(waiting = waiting.len(), "Admission held for readiness");
            return Err(GameError::NotReady { waiting });
        }

        let spawned = {
            let mut arena = self.arena.lock();
            arena.clear()?;
            arena.entities.destroy_all_unmanaged()?;

            let mut spawned = 0;
            for participant in &participants {
                match arena.entities.spawn_for_participant(participant, true) {
                    Ok(_) => spawned += 1,
                    Err(GameError::NoFreeSlot { capacity }) => {
                        self.reject_no_slot(participant.id, capacity)?
                    }
                    Err(e) => return Err(e),
                }
            }
            spawned
        };
        self.bus
            .send(Targets::All, &GameEvent::EntitiesReady { count: spawned })?;
        // Readiness is spent on this match; the next one needs a fresh ready-up
        self.sessions.clear_ready()?;

        control.epoch += 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        control.cancel = Some(cancel_tx);

        self.enter_round_starting()?;
        info!(epoch = control.epoch, entities = spawned, "Match admitted");

        Ok(MatchTicket {
            epoch: control.epoch,
            cancel: cancel_rx,
        })
    }

    /// Caller holds the control lock
    fn enter_round_starting(&self) -> Result<u32, GameError> {
        self.arena.lock().reset_round()?;

        let round = self.round.get() + 1;
        self.round.set(round)?;
        self.state.set(MatchState::RoundStarting)?;
        self.message.set(format!("ROUND {}", round))?;
        self.bus.send(Targets::All, &GameEvent::RoundStarted { round })?;

        info!(round, "Round starting");
        Ok(round)
    }

    pub fn activate_round(&self, epoch: u64) -> Result<Continuation<()>, GameError> {
        let control = self.control.lock();
        if !self.is_current(&control, epoch, MatchState::RoundStarting) {
            return Ok(Continuation::Stale);
        }

        self.arena.lock().entities.set_control_all(true)?;
        self.message.set(String::new())?;
        self.state.set(MatchState::RoundActive)?;

        info!(round = self.round.get(), "Round active");
        Ok(Continuation::Proceed(()))
    }

    /// Whether at most one entity is still standing
    pub fn round_decided(&self, epoch: u64) -> Continuation<bool> {
        let control = self.control.lock();
        if !self.is_current(&control, epoch, MatchState::RoundActive) {
            return Continuation::Stale;
        }
        Continuation::Proceed(self.arena.lock().entities.active_count() <= 1)
    }

    /// Score the round and announce the result
    pub fn end_round(&self, epoch: u64) -> Result<Continuation<RoundOutcome>, GameError> {
        let control = self.control.lock();
        if !self.is_current(&control, epoch, MatchState::RoundActive) {
            return Ok(Continuation::Stale);
        }

        let round = self.round.get();
        let (winner, match_winner, message) = {
            let mut arena = self.arena.lock();
            arena.entities.set_control_all(false)?;

            let survivors = arena.entities.active_entities();
            let winner = match survivors.as_slice() {
                [only] => Some(*only),
                [] => None,
                _ => {
                    warn!(survivors = survivors.len(), "Round ended with several survivors, scoring a draw");
                    None
                }
            };
            if let Some(winner) = winner {
                arena.entities.record_win(winner.owner)?;
            }

            let match_winner = arena
                .entities
                .iter_by_slot()
                .find(|e| e.wins() >= self.config.rounds_to_win)
                .map(PlayerEntity::handle);

            let label = |handle: Option<EntityHandle>| {
                handle
                    .and_then(|h| arena.entities.get(h.owner))
                    .map(|e| e.label.clone())
            };
            let standings: Vec<(String, u32)> = arena
                .entities
                .iter_by_slot()
                .map(|e| (e.label.clone(), e.wins()))
                .collect();
            let message = summary_message(
                label(winner).as_deref(),
                label(match_winner).as_deref(),
                &standings,
            );
            (winner, match_winner, message)
        };

        self.state.set(MatchState::RoundEnding)?;
        self.message.set(message.clone())?;
        self.bus.send(
            Targets::All,
            &GameEvent::RoundSummary {
                round,
                winner: winner.map(|w| w.id),
                draw: winner.is_none(),
                match_winner: match_winner.map(|w| w.id),
                message: message.clone(),
            },
        )?;

        info!(
            round,
            winner = ?winner.map(|w| w.owner),
            match_winner = ?match_winner.map(|w| w.owner),
            "Round ended"
        );
        Ok(Continuation::Proceed(RoundOutcome {
            round,
            winner,
            match_winner,
            message,
        }))
    }

    pub fn next_round(&self, epoch: u64) -> Result<Continuation<u32>, GameError> {
        let control = self.control.lock();
        if !self.is_current(&control, epoch, MatchState::RoundEnding) {
            return Ok(Continuation::Stale);
        }
        Ok(Continuation::Proceed(self.enter_round_starting()?))
    }

    /// Send everyone back to the lobby and return to Idle
    pub fn conclude_match(&self, epoch: u64, winner: EntityHandle) -> Result<Continuation<()>, GameError> {
        let mut control = self.control.lock();
        if !self.is_current(&control, epoch, MatchState::RoundEnding) {
            return Ok(Continuation::Stale);
        }

        let round = self.round.get();
        self.bus.send(
            Targets::All,
            &GameEvent::MatchConcluded {
                winner: winner.id,
                round,
            },
        )?;
        self.scene
            .load_scene(&self.config.lobby_scene, LoadMode::Single)?;
        let removed = self.arena.lock().clear()?;

        control.epoch += 1;
        control.cancel = None;
        self.state.set(MatchState::Idle)?;
        self.message.set(String::new())?;

        info!(winner = %winner.owner, rounds = round, entities_removed = removed, "Match concluded");
        Ok(Continuation::Proceed(()))
    }

    /// Abandon whatever is running; false if already Idle
    pub fn force_idle(&self, reason: &str) -> Result<bool, GameError> {
        ensure_server(self.bus.role(), "force idle")?;
        let mut control = self.control.lock();
        self.force_idle_locked(&mut control, reason)
    }

    fn force_idle_locked(&self, control: &mut MatchControl, reason: &str) -> Result<bool, GameError> {
        let phase = self.state.get();
        if phase == MatchState::Idle {
            return Ok(false);
        }

        control.epoch += 1;
        if let Some(cancel) = control.cancel.take() {
            let _ = cancel.send(true);
        }

        self.arena.lock().entities.set_control_all(false)?;
        self.state.set(MatchState::Idle)?;
        self.message.set(WAITING_MESSAGE.to_string())?;

        warn!(reason, abandoned = ?phase, round = self.round.get(), "Match forced to idle");
        Ok(true)
    }

    // ========================================================================
    // Driving loops
    // ========================================================================

    fn proceed<T>(&self, step: Result<Continuation<T>, GameError>) -> Option<T> {
        match step {
            Ok(Continuation::Proceed(value)) => Some(value),
            Ok(Continuation::Stale) => None,
            Err(e) => {
                error!(error = %e, "Match step failed");
                if let Err(e) = self.force_idle("match step failed") {
                    error!(error = %e, "Failed to return to idle");
                }
                None
            }
        }
    }

    /// Sleep unless the match is cancelled first
    async fn hold(&self, duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(duration) => true,
            _ = cancel.changed() => false,
        }
    }

    async fn await_round_decided(&self, epoch: u64, cancel: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.round_decided(epoch) {
                Continuation::Stale => return false,
                Continuation::Proceed(true) => return true,
                Continuation::Proceed(false) => {}
            }

            tokio::select! {
                _ = cancel.changed() => return false,
                _ = sleep(self.config.round_poll) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Play rounds until someone wins the match or it is abandoned
    pub async fn run_match(&self, ticket: MatchTicket) -> MatchOutcome {
        let MatchTicket { epoch, mut cancel } = ticket;

        loop {
            if !self.hold(self.config.round_start_delay, &mut cancel).await {
                return MatchOutcome::Abandoned;
            }
            let Some(()) = self.proceed(self.activate_round(epoch)) else {
                return MatchOutcome::Abandoned;
            };

            if !self.await_round_decided(epoch, &mut cancel).await {
                return MatchOutcome::Abandoned;
            }
            let Some(outcome) = self.proceed(self.end_round(epoch)) else {
                return MatchOutcome::Abandoned;
            };

            if !self.hold(self.config.round_end_delay, &mut cancel).await {
                return MatchOutcome::Abandoned;
            }

            if let Some(winner) = outcome.match_winner {
                if !self.hold(self.config.match_end_delay, &mut cancel).await {
                    return MatchOutcome::Abandoned;
                }
                return match self.proceed(self.conclude_match(epoch, winner)) {
                    Some(()) => MatchOutcome::Concluded {
                        winner,
                        rounds: outcome.round,
                    },
                    None => MatchOutcome::Abandoned,
                };
            }

            if self.proceed(self.next_round(epoch)).is_none() {
                return MatchOutcome::Abandoned;
            }
        }
    }

    /// Admit now and play the match in the background
    pub fn start_match(self: &Arc<Self>) -> Result<u64, GameError> {
        let ticket = self.admit_participants()?;
        let epoch = ticket.epoch;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = orchestrator.run_match(ticket).await;
            info!(epoch, outcome = ?outcome, "Match finished");
        });
        Ok(epoch)
    }

    /// Wait in Idle until enough participants are present, then admit them
    async fn await_admission(&self, shutdown: &mut watch::Receiver<bool>) -> Option<MatchTicket> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            if self.state.get() == MatchState::Idle {
                let waiting = if self.sessions.len() < self.config.min_participants {
                    Some(WAITING_MESSAGE)
                } else if !self.sessions.not_ready().is_empty() {
                    Some(READY_MESSAGE)
                } else {
                    None
                };

                let Some(waiting) = waiting else {
                    tokio::select! {
                        _ = sleep(self.config.admission_settle) => {}
                        _ = shutdown.changed() => return None,
                    }
                    match self.admit_participants() {
                        Ok(ticket) => return Some(ticket),
                        Err(GameError::NotEnoughParticipants { present, .. }) => {
                            debug!(present, "Participants left before admission")
                        }
                        Err(GameError::NotReady { waiting }) => {
                            debug!(waiting = waiting.len(), "Participants unreadied before admission")
                        }
                        Err(GameError::InvalidPhaseTransition { .. }) => {
                            debug!("Match already started elsewhere")
                        }
                        Err(e) => warn!(error = %e, "Admission failed"),
                    }
                    continue;
                };

                if let Err(e) = self.message.set(waiting.to_string()) {
                    warn!(error = %e, "Failed to publish waiting message");
                }
            }

            tokio::select! {
                _ = sleep(self.config.admission_poll) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }

    /// Admission loop: runs matches back to back until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            min_participants = self.config.min_participants,
            rounds_to_win = self.config.rounds_to_win,
            "Match orchestrator started"
        );

        while let Some(ticket) = self.await_admission(&mut shutdown).await {
            let epoch = ticket.epoch;
            let outcome = tokio::select! {
                outcome = self.run_match(ticket) => Some(outcome),
                _ = shutdown.changed() => None,
            };
            let Some(outcome) = outcome else {
                break;
            };
            info!(epoch, outcome = ?outcome, "Match finished");
        }

        info!("Match orchestrator stopped");
    }
}

fn summary_message(
    round_winner: Option<&str>,
    match_winner: Option<&str>,
    standings: &[(String, u32)],
) -> String {
    let mut message = match (match_winner, round_winner) {
        (Some(label), _) => format!("{} WINS THE GAME!", label),
        (None, Some(label)) => format!("{} WINS THE ROUND!", label),
        (None, None) => "DRAW!".to_string(),
    };
    message.push_str("\n\n\n\n");
    for (label, wins) in standings {
        message.push_str(&format!("{}: {} WINS\n", label, wins));
    }
    message
}
