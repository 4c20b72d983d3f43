//! Damage resolution - area-effect falloff and projectile bookkeeping

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use super::entity::EntityId;
use super::error::{ensure_server, GameError};
use super::events::GameEvent;
use super::lifecycle::EntityLifecycleManager;
use super::world::{BodyDesc, BodyHandle, Contact, LayerMask, Transform};
use crate::config::{ExplosionConfig, GameConfig};
use crate::replication::{ReplicationBus, Targets};
use crate::session::ParticipantId;

/// Launch point relative to the tank, along its facing
const MUZZLE_OFFSET: f32 = 1.5;
const MUZZLE_HEIGHT: f32 = 1.7;
/// Launch elevation, radians above horizontal
const LAUNCH_PITCH: f32 = 0.15;

/// Linear falloff: full damage at the centre, nothing at or beyond `radius`
pub fn falloff_damage(distance: f32, radius: f32, max_damage: f32) -> f32 {
    if radius <= 0.0 || !distance.is_finite() {
        return 0.0;
    }
    let relative = (radius - distance) / radius;
    (relative * max_damage).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub entity: EntityId,
    pub damage: f32,
    pub health: f32,
}

/// Everything one area effect did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AreaEffect {
    pub hits: Vec<Hit>,
    pub deaths: Vec<EntityId>,
}

/// A shell in flight
#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: Uuid,
    pub owner: ParticipantId,
    pub body: BodyHandle,
    pub lifetime_remaining: f32,
    resolved: bool,
}

/// What a simulation step did to projectiles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectileReport {
    pub explosions: usize,
    pub expired: usize,
    pub deaths: Vec<EntityId>,
}

pub struct DamageResolver {
    bus: ReplicationBus,
    explosion: ExplosionConfig,
    projectile_lifetime: f32,
    min_launch_force: f32,
    max_launch_force: f32,
    projectiles: HashMap<Uuid, Projectile>,
    by_body: HashMap<BodyHandle, Uuid>,
    /// Resolved projectiles awaiting destruction
    pending_destroy: Vec<Uuid>,
    deaths: Arc<Notify>,
}

impl DamageResolver {
    /// `deaths` is notified whenever an area effect eliminates someone
    pub fn new(bus: ReplicationBus, config: &GameConfig, deaths: Arc<Notify>) -> Self {
        Self {
            bus,
            explosion: config.explosion,
            projectile_lifetime: config.projectile_lifetime.as_secs_f32(),
            min_launch_force: config.min_launch_force,
            max_launch_force: config.max_launch_force,
            projectiles: HashMap::new(),
            by_body: HashMap::new(),
            pending_destroy: Vec::new(),
            deaths,
        }
    }

    /// Damage and push every active entity on `mask` within `radius` of `center`
    pub fn resolve_area_effect(
        &mut self,
        entities: &mut EntityLifecycleManager,
        center: Vec3,
        radius: f32,
        max_damage: f32,
        force: f32,
        mask: LayerMask,
    ) -> Result<AreaEffect, GameError> {
        ensure_server(self.bus.role(), "resolve area effect")?;

        let mut effect = AreaEffect::default();
        for body in entities.world().spatial_query(center, radius, mask) {
            entities.world_mut().apply_impulse(body, force, center, radius);

            let Some(owner) = entities.owner_of_body(body) else {
                continue;
            };
            let Some(entity) = entities.get(owner) else {
                continue;
            };
            if !entity.is_active() {
                continue;
            }
            let entity_id = entity.id;
            let position = entities
                .world()
                .transform(body)
                .map(|t| t.position)
                .unwrap_or(center);

            let damage = falloff_damage(center.distance(position), radius, max_damage);
            let health = entities.apply_damage(owner, damage)?;
            effect.hits.push(Hit {
                entity: entity_id,
                damage,
                health,
            });

            if health <= 0.0 {
                if let Some(death) = entities.eliminate(owner)? {
                    self.bus.send(
                        Targets::All,
                        &GameEvent::Death {
                            entity: death.entity,
                            death: death.death,
                            position: death.position,
                        },
                    )?;
                    effect.deaths.push(death.entity);
                }
            }
        }

        if !effect.deaths.is_empty() {
            self.deaths.notify_one();
        }
        debug!(hits = effect.hits.len(), deaths = effect.deaths.len(), "Area effect resolved");
        Ok(effect)
    }

    /// Launch a shell from the participant's tank
    pub fn fire(
        &mut self,
        entities: &mut EntityLifecycleManager,
        participant: ParticipantId,
        launch_force: f32,
    ) -> Result<Uuid, GameError> {
        ensure_server(self.bus.role(), "fire")?;

        let entity = entities
            .get(participant)
            .ok_or(GameError::UnknownParticipant(participant))?;
        if !entity.is_active() || !entity.control_enabled() {
            return Err(GameError::ControlDisabled(participant));
        }
        let entity_id = entity.id;
        let tank = entities
            .world()
            .transform(entity.body)
            .ok_or(GameError::UnknownParticipant(participant))?;

        let launch_force = if launch_force.is_finite() {
            launch_force.clamp(self.min_launch_force, self.max_launch_force)
        } else {
            self.min_launch_force
        };
        let forward = tank.forward();
        let origin = tank.position + forward * MUZZLE_OFFSET + Vec3::Y * MUZZLE_HEIGHT;
        let velocity = (forward * LAUNCH_PITCH.cos() + Vec3::Y * LAUNCH_PITCH.sin()) * launch_force;

        let body = entities
            .world_mut()
            .spawn_body(BodyDesc::projectile(Transform::new(origin, tank.yaw), velocity));
        let id = Uuid::new_v4();
        self.projectiles.insert(
            id,
            Projectile {
                id,
                owner: participant,
                body,
                lifetime_remaining: self.projectile_lifetime,
                resolved: false,
            },
        );
        self.by_body.insert(body, id);

        self.bus.send(
            Targets::All,
            &GameEvent::Fired {
                entity: entity_id,
                projectile: id,
                launch_force,
            },
        )?;
        debug!(participant_id = %participant, projectile_id = %id, launch_force, "Shell fired");
        Ok(id)
    }

    /// Explode a projectile on first contact; later contacts return `None`
    pub fn resolve_projectile_contact(
        &mut self,
        entities: &mut EntityLifecycleManager,
        projectile: Uuid,
        mask: LayerMask,
    ) -> Result<Option<AreaEffect>, GameError> {
        ensure_server(self.bus.role(), "resolve projectile contact")?;

        let Some(shell) = self.projectiles.get_mut(&projectile) else {
            return Ok(None);
        };
        if shell.resolved {
            debug!(projectile_id = %projectile, "Ignoring repeat contact");
            return Ok(None);
        }
        shell.resolved = true;
        let body = shell.body;
        self.pending_destroy.push(projectile);

        let center = entities
            .world()
            .transform(body)
            .map(|t| t.position)
            .unwrap_or(Vec3::ZERO);
        // The shell itself must not block or absorb its own blast.
        entities.world_mut().set_active(body, false);

        let ExplosionConfig {
            max_damage,
            radius,
            force,
        } = self.explosion;
        let effect = self.resolve_area_effect(entities, center, radius, max_damage, force, mask)?;

        self.bus.send(
            Targets::All,
            &GameEvent::Explosion {
                projectile: Some(projectile),
                center,
                radius,
            },
        )?;
        Ok(Some(effect))
    }

    /// Resolve contacts, age shells, destroy resolved or expired ones
    pub fn step(
        &mut self,
        entities: &mut EntityLifecycleManager,
        contacts: &[Contact],
        dt: f32,
    ) -> Result<ProjectileReport, GameError> {
        let mut report = ProjectileReport::default();

        for contact in contacts {
            let Some(id) = self.by_body.get(&contact.projectile).copied() else {
                continue;
            };
            if let Some(effect) = self.resolve_projectile_contact(entities, id, LayerMask::PLAYERS)? {
                report.explosions += 1;
                report.deaths.extend(effect.deaths);
            }
        }

        for shell in self.projectiles.values_mut().filter(|p| !p.resolved) {
            shell.lifetime_remaining -= dt;
            if shell.lifetime_remaining <= 0.0 {
                shell.resolved = true;
                self.pending_destroy.push(shell.id);
                report.expired += 1;
            }
        }

        self.flush_destroyed(entities);
        Ok(report)
    }

    fn flush_destroyed(&mut self, entities: &mut EntityLifecycleManager) {
        for id in self.pending_destroy.drain(..) {
            if let Some(shell) = self.projectiles.remove(&id) {
                self.by_body.remove(&shell.body);
                entities.world_mut().despawn_body(shell.body);
                debug!(projectile_id = %id, owner = %shell.owner, "Shell destroyed");
            }
        }
    }

    /// Remove every shell, e.g. when the match ends
    pub fn clear(&mut self, entities: &mut EntityLifecycleManager) {
        let count = self.projectiles.len();
        self.pending_destroy.extend(self.projectiles.keys().copied());
        self.flush_destroyed(entities);
        if count > 0 {
            info!(count, "Cleared shells in flight");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.projectiles.values().filter(|p| !p.resolved).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::{PhysicsWorld, SimWorld};
    use crate::replication::{Envelope, Role};
    use crate::session::{AuthorityRole, Participant, SessionRegistry};

    struct Fixture {
        bus: ReplicationBus,
        entities: EntityLifecycleManager,
        damage: DamageResolver,
        players: Vec<Participant>,
        deaths: Arc<Notify>,
    }

    fn fixture(count: u64) -> Fixture {
        let bus = ReplicationBus::new(Role::Server);
        let config = GameConfig::default();
        let sessions = SessionRegistry::new(bus.clone());
        let deaths = Arc::new(Notify::new());
        let mut entities =
            EntityLifecycleManager::new(bus.clone(), &config, Box::new(SimWorld::new()));
        let players: Vec<Participant> = (0..count)
            .map(|i| {
                let role = if i == 0 { AuthorityRole::Host } else { AuthorityRole::Remote };
                sessions.on_join(ParticipantId(i + 1), "p", role).unwrap()
            })
            .collect();
        for p in &players {
            entities.spawn_for_participant(p, true).unwrap();
        }
        Fixture {
            damage: DamageResolver::new(bus.clone(), &config, deaths.clone()),
            bus,
            entities,
            players,
            deaths,
        }
    }

    fn place(f: &mut Fixture, player: usize, position: Vec3) {
        let body = f.entities.get(f.players[player].id).unwrap().body;
        f.entities
            .world_mut()
            .set_transform(body, Transform::new(position, 0.0));
    }

    #[test]
    fn test_falloff_is_linear_and_clamped() {
        assert_eq!(falloff_damage(0.0, 5.0, 100.0), 100.0);
        assert!((falloff_damage(2.5, 5.0, 100.0) - 50.0).abs() < 1e-4);
        assert_eq!(falloff_damage(5.0, 5.0, 100.0), 0.0);
        assert_eq!(falloff_damage(9.0, 5.0, 100.0), 0.0);

        let mut last = f32::MAX;
        for step in 0..=60 {
            let damage = falloff_damage(step as f32 * 0.1, 5.0, 100.0);
            assert!(damage <= last);
            assert!((0.0..=100.0).contains(&damage));
            last = damage;
        }
    }

    #[test]
    fn test_area_effect_damages_by_distance() {
        let mut f = fixture(3);
        place(&mut f, 0, Vec3::new(1.0, 0.0, 0.0));
        place(&mut f, 1, Vec3::new(0.0, 0.0, 4.0));
        place(&mut f, 2, Vec3::new(30.0, 0.0, 0.0));

        let effect = f
            .damage
            .resolve_area_effect(&mut f.entities, Vec3::ZERO, 5.0, 100.0, 1000.0, LayerMask::PLAYERS)
            .unwrap();

        assert_eq!(effect.hits.len(), 2);
        assert!((f.entities.get(f.players[0].id).unwrap().health() - 20.0).abs() < 1e-3);
        assert!((f.entities.get(f.players[1].id).unwrap().health() - 80.0).abs() < 1e-3);
        assert_eq!(f.entities.get(f.players[2].id).unwrap().health(), 100.0);
        assert!(effect.deaths.is_empty());
    }

    #[test]
    fn test_repeated_effects_kill_once() {
        let mut f = fixture(2);
        place(&mut f, 0, Vec3::ZERO);
        place(&mut f, 1, Vec3::new(40.0, 0.0, 0.0));
        let mut rx = f.bus.subscribe();

        let mut deaths = Vec::new();
        for _ in 0..3 {
            let effect = f
                .damage
                .resolve_area_effect(&mut f.entities, Vec3::ZERO, 5.0, 100.0, 0.0, LayerMask::PLAYERS)
                .unwrap();
            deaths.extend(effect.deaths);
        }

        let victim = f.entities.get(f.players[0].id).unwrap();
        assert_eq!(deaths, vec![victim.id]);
        assert_eq!(victim.health(), 0.0);
        assert!(!victim.is_active());

        let mut death_events = 0;
        while let Ok(envelope) = rx.try_recv() {
            if let Envelope::Event { payload, .. } = envelope {
                if payload["event"] == "death" {
                    death_events += 1;
                }
            }
        }
        assert_eq!(death_events, 1);
    }

    #[tokio::test]
    async fn test_death_wakes_waiter() {
        let mut f = fixture(2);
        place(&mut f, 0, Vec3::ZERO);
        f.damage
            .resolve_area_effect(&mut f.entities, Vec3::ZERO, 5.0, 100.0, 0.0, LayerMask::PLAYERS)
            .unwrap();

        // The stored permit completes immediately.
        tokio::time::timeout(std::time::Duration::from_millis(10), f.deaths.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_projectile_resolves_at_most_once() {
        let mut f = fixture(2);
        f.entities.set_control_all(true).unwrap();
        place(&mut f, 1, Vec3::new(100.0, 0.0, 0.0));
        let shell = f.damage.fire(&mut f.entities, f.players[0].id, 20.0).unwrap();

        let first = f
            .damage
            .resolve_projectile_contact(&mut f.entities, shell, LayerMask::PLAYERS)
            .unwrap();
        let second = f
            .damage
            .resolve_projectile_contact(&mut f.entities, shell, LayerMask::PLAYERS)
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let report = f.damage.step(&mut f.entities, &[], 0.01).unwrap();
        assert_eq!(report.explosions, 0);
        assert_eq!(f.damage.in_flight(), 0);
        assert!(f.entities.world().bodies_in(LayerMask::PROJECTILES).is_empty());
    }

    #[test]
    fn test_simultaneous_contacts_explode_once() {
        let mut f = fixture(2);
        f.entities.set_control_all(true).unwrap();
        let shell = f.damage.fire(&mut f.entities, f.players[0].id, 20.0).unwrap();
        let body = f.damage.projectiles[&shell].body;
        let other = f.entities.get(f.players[1].id).unwrap().body;

        let contacts = [
            Contact {
                projectile: body,
                target: crate::game::world::ContactTarget::Body(other),
            },
            Contact {
                projectile: body,
                target: crate::game::world::ContactTarget::Ground,
            },
        ];
        let report = f.damage.step(&mut f.entities, &contacts, 0.01).unwrap();
        assert_eq!(report.explosions, 1);
    }

    #[test]
    fn test_unresolved_projectile_expires_once() {
        let mut f = fixture(1);
        f.entities.set_control_all(true).unwrap();
        f.damage.fire(&mut f.entities, f.players[0].id, 20.0).unwrap();

        let first = f.damage.step(&mut f.entities, &[], 2.5).unwrap();
        let second = f.damage.step(&mut f.entities, &[], 2.5).unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(second.expired, 0);
        assert!(f.entities.world().bodies_in(LayerMask::PROJECTILES).is_empty());
    }

    #[test]
    fn test_fire_requires_control_and_clamps_force() {
        let mut f = fixture(1);
        let err = f.damage.fire(&mut f.entities, f.players[0].id, 20.0).unwrap_err();
        assert!(matches!(err, GameError::ControlDisabled(_)));

        f.entities.set_control_all(true).unwrap();
        let mut rx = f.bus.subscribe();
        f.damage.fire(&mut f.entities, f.players[0].id, 500.0).unwrap();
        let Ok(Envelope::Event { payload, .. }) = rx.try_recv() else {
            panic!("expected fired event");
        };
        assert_eq!(payload["launch_force"], 30.0);
    }
}
