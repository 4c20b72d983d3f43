//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma separated)
    pub client_origin: String,
    /// Gameplay tuning
    pub game: GameConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let game = GameConfig::from_env()?;
        game.validate()?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            client_origin: env::var("CLIENT_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            game,
        })
    }
}

/// RGBA color, components in 0..=1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub const WHITE: Color = Color::rgb(1.0, 1.0, 1.0);
}

/// Player colors, assigned by slot index
pub const SLOT_PALETTE: [Color; 8] = [
    Color::rgb(0.16, 0.42, 0.87),
    Color::rgb(0.90, 0.18, 0.15),
    Color::rgb(0.20, 0.70, 0.25),
    Color::rgb(0.95, 0.80, 0.15),
    Color::rgb(0.55, 0.25, 0.75),
    Color::rgb(0.95, 0.55, 0.10),
    Color::rgb(0.10, 0.80, 0.85),
    Color::WHITE,
];

/// Fixed spawn assignment for one participant's entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnSlot {
    pub position: Vec3,
    /// Facing, radians around the up axis
    pub yaw: f32,
    pub color: Color,
}

impl SpawnSlot {
    /// `count` slots evenly spaced on a ring, each facing the arena centre
    pub fn ring(count: usize, radius: f32) -> Vec<SpawnSlot> {
        (0..count)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::TAU / count as f32;
                let position = Vec3::new(angle.cos() * radius, 0.0, angle.sin() * radius);
                // Forward is +Z rotated by yaw; face back towards the origin.
                let yaw = (-position.x).atan2(-position.z);
                SpawnSlot {
                    position,
                    yaw,
                    color: SLOT_PALETTE[i % SLOT_PALETTE.len()],
                }
            })
            .collect()
    }
}

/// Explosion tuning for shells
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExplosionConfig {
    /// Damage at the centre of the blast
    pub max_damage: f32,
    /// Blast radius; nothing beyond it is affected
    pub radius: f32,
    /// Impulse at the centre of the blast
    pub force: f32,
}

/// Gameplay tuning. Every field is always present; defaults match the classic ruleset.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub rounds_to_win: u32,
    pub round_start_delay: Duration,
    pub round_end_delay: Duration,
    /// Hold between the final round summary and returning everyone to the lobby
    pub match_end_delay: Duration,
    /// How often Idle re-checks whether enough participants are present
    pub admission_poll: Duration,
    /// Grace period after enough participants show up, before admitting
    pub admission_settle: Duration,
    /// How often RoundActive re-evaluates the elimination predicate
    pub round_poll: Duration,
    pub min_participants: usize,
    pub spawn_slots: Vec<SpawnSlot>,
    pub starting_health: f32,
    pub explosion: ExplosionConfig,
    pub projectile_lifetime: Duration,
    pub min_launch_force: f32,
    pub max_launch_force: f32,
    pub lobby_scene: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            rounds_to_win: 5,
            round_start_delay: Duration::from_secs(3),
            round_end_delay: Duration::from_secs(3),
            match_end_delay: Duration::from_secs(5),
            admission_poll: Duration::from_millis(500),
            admission_settle: Duration::from_secs(1),
            round_poll: Duration::from_millis(100),
            min_participants: 2,
            spawn_slots: SpawnSlot::ring(4, 20.0),
            starting_health: 100.0,
            explosion: ExplosionConfig {
                max_damage: 100.0,
                radius: 5.0,
                force: 1000.0,
            },
            projectile_lifetime: Duration::from_secs(2),
            min_launch_force: 15.0,
            max_launch_force: 30.0,
            lobby_scene: "MainMenu".to_string(),
        }
    }
}

impl GameConfig {
    /// Defaults overridden by any gameplay variables present in the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let slot_count = env_parse("MAX_ENTITIES", defaults.spawn_slots.len())?;
        let ring_radius = env_parse("SPAWN_RING_RADIUS", 20.0f32)?;
        if slot_count > SLOT_PALETTE.len() {
            return Err(ConfigError::Invalid {
                key: "MAX_ENTITIES",
                reason: format!("at most {} spawn slots are supported", SLOT_PALETTE.len()),
            });
        }

        Ok(Self {
            rounds_to_win: env_parse("ROUNDS_TO_WIN", defaults.rounds_to_win)?,
            round_start_delay: env_secs("ROUND_START_DELAY_SECS", defaults.round_start_delay)?,
            round_end_delay: env_secs("ROUND_END_DELAY_SECS", defaults.round_end_delay)?,
            match_end_delay: env_secs("MATCH_END_DELAY_SECS", defaults.match_end_delay)?,
            admission_poll: env_secs("ADMISSION_POLL_SECS", defaults.admission_poll)?,
            admission_settle: env_secs("ADMISSION_SETTLE_SECS", defaults.admission_settle)?,
            round_poll: env_parse("ROUND_POLL_MILLIS", defaults.round_poll.as_millis() as u64)
                .map(Duration::from_millis)?,
            min_participants: env_parse("MIN_PARTICIPANTS", defaults.min_participants)?,
            spawn_slots: SpawnSlot::ring(slot_count, ring_radius),
            starting_health: env_parse("STARTING_HEALTH", defaults.starting_health)?,
            explosion: ExplosionConfig {
                max_damage: env_parse("EXPLOSION_MAX_DAMAGE", defaults.explosion.max_damage)?,
                radius: env_parse("EXPLOSION_RADIUS", defaults.explosion.radius)?,
                force: env_parse("EXPLOSION_FORCE", defaults.explosion.force)?,
            },
            projectile_lifetime: env_secs(
                "PROJECTILE_LIFETIME_SECS",
                defaults.projectile_lifetime,
            )?,
            min_launch_force: env_parse("MIN_LAUNCH_FORCE", defaults.min_launch_force)?,
            max_launch_force: env_parse("MAX_LAUNCH_FORCE", defaults.max_launch_force)?,
            lobby_scene: env::var("LOBBY_SCENE").unwrap_or(defaults.lobby_scene),
        })
    }

    /// Reject configurations that could never admit or finish a match
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rounds_to_win == 0 {
            return Err(invalid("ROUNDS_TO_WIN", "must be positive"));
        }
        if self.min_participants < 2 {
            return Err(invalid("MIN_PARTICIPANTS", "a match needs at least two participants"));
        }
        if self.spawn_slots.len() < self.min_participants {
            return Err(invalid(
                "MAX_ENTITIES",
                "fewer spawn slots than the minimum participant count",
            ));
        }
        if !(self.starting_health > 0.0) {
            return Err(invalid("STARTING_HEALTH", "must be positive"));
        }
        if !(self.explosion.radius > 0.0) {
            return Err(invalid("EXPLOSION_RADIUS", "must be positive"));
        }
        if self.explosion.max_damage < 0.0 || self.explosion.force < 0.0 {
            return Err(invalid("EXPLOSION_MAX_DAMAGE", "damage and force must not be negative"));
        }
        if self.min_launch_force > self.max_launch_force {
            return Err(invalid("MIN_LAUNCH_FORCE", "exceeds MAX_LAUNCH_FORCE"));
        }
        if self.round_poll.is_zero() || self.admission_poll.is_zero() {
            return Err(invalid("ROUND_POLL_MILLIS", "poll intervals must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("cannot parse {:?}", raw),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = env_parse(key, default.as_secs_f64())?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("{} is not a valid duration in seconds", secs),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GameConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rounds_to_win, 5);
        assert_eq!(config.round_start_delay, Duration::from_secs(3));
        assert_eq!(config.spawn_slots.len(), 4);
        assert_eq!(config.starting_health, 100.0);
    }

    #[test]
    fn test_ring_slots_face_the_centre() {
        let slots = SpawnSlot::ring(4, 10.0);
        for slot in &slots {
            assert!((slot.position.length() - 10.0).abs() < 1e-4);
            let forward = Vec3::new(slot.yaw.sin(), 0.0, slot.yaw.cos());
            let to_centre = (-slot.position).normalize();
            assert!(forward.dot(to_centre) > 0.999);
        }
        assert_eq!(slots[0].color, SLOT_PALETTE[0]);
        assert_eq!(slots[3].color, SLOT_PALETTE[3]);
    }

    #[test]
    fn test_validation_rejects_unplayable_configs() {
        let mut config = GameConfig::default();
        config.spawn_slots.truncate(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "MAX_ENTITIES", .. })
        ));

        let mut config = GameConfig::default();
        config.rounds_to_win = 0;
        assert!(config.validate().is_err());

        let mut config = GameConfig::default();
        config.min_launch_force = 40.0;
        assert!(config.validate().is_err());
    }
}
