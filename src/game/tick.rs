//! Fixed-rate simulation loop

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::arena::Arena;
use crate::util::time::{tick_delta, TICK_DURATION_MICROS};

/// Step the arena at `SIMULATION_TPS` until shutdown
pub async fn run_simulation(arena: Arc<Mutex<Arena>>, mut shutdown: watch::Receiver<bool>) {
    info!("Simulation loop started");

    let mut tick_interval = interval(Duration::from_micros(TICK_DURATION_MICROS));
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let dt = tick_delta();
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        tick += 1;

        let result = arena.lock().tick(dt);
        match result {
            Ok(report) if report.explosions > 0 || report.expired > 0 => {
                debug!(
                    tick,
                    explosions = report.explosions,
                    expired = report.expired,
                    deaths = report.deaths.len(),
                    "Projectiles resolved"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(tick, error = %e, "Simulation tick failed"),
        }
    }

    info!(ticks = tick, "Simulation loop stopped");
}
