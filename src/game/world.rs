//! Physical-world boundary and the in-process simulation behind it
//!
//! Game logic only reads and writes physical state (transforms, velocities, activation,
//! impulses) through [`PhysicsWorld`]; everything else about the physics lives here.

use std::collections::BTreeMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::config::SpawnSlot;

/// Downward acceleration applied to projectiles
pub const GRAVITY: f32 = 9.81;
/// Tank collision sphere radius
pub const TANK_RADIUS: f32 = 0.9;
pub const TANK_MASS: f32 = 100.0;
/// Tank forward speed at full throttle (units/s)
pub const TANK_MOVE_SPEED: f32 = 12.0;
/// Tank turn rate at full input (radians/s)
pub const TANK_TURN_SPEED: f32 = std::f32::consts::PI;
pub const PROJECTILE_RADIUS: f32 = 0.2;
pub const PROJECTILE_MASS: f32 = 1.0;
/// Fraction of knockback velocity kept per step
pub const KNOCKBACK_DRAG: f32 = 0.9;

/// Position plus facing around the up axis
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub yaw: f32,
}

impl Transform {
    pub fn new(position: Vec3, yaw: f32) -> Self {
        Self { position, yaw }
    }

    /// Unit vector the transform faces (+Z at yaw 0)
    pub fn forward(&self) -> Vec3 {
        Vec3::new(self.yaw.sin(), 0.0, self.yaw.cos())
    }
}

impl From<SpawnSlot> for Transform {
    fn from(slot: SpawnSlot) -> Self {
        Self::new(slot.position, slot.yaw)
    }
}

/// Opaque handle to a body in the world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyHandle(pub u64);

/// Collision layers, combined as a bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMask(pub u32);

impl LayerMask {
    pub const PLAYERS: LayerMask = LayerMask(1 << 0);
    pub const PROJECTILES: LayerMask = LayerMask(1 << 1);
    pub const ALL: LayerMask = LayerMask(u32::MAX);

    pub fn intersects(self, other: LayerMask) -> bool {
        self.0 & other.0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Ground-bound, driven kinematically
    Tank,
    /// Ballistic, reports contacts
    Projectile,
}

/// Everything needed to create a body
#[derive(Debug, Clone, Copy)]
pub struct BodyDesc {
    pub kind: BodyKind,
    pub layer: LayerMask,
    pub transform: Transform,
    pub velocity: Vec3,
    pub radius: f32,
    pub mass: f32,
}

impl BodyDesc {
    pub fn tank(transform: Transform) -> Self {
        Self {
            kind: BodyKind::Tank,
            layer: LayerMask::PLAYERS,
            transform,
            velocity: Vec3::ZERO,
            radius: TANK_RADIUS,
            mass: TANK_MASS,
        }
    }

    pub fn projectile(transform: Transform, velocity: Vec3) -> Self {
        Self {
            kind: BodyKind::Projectile,
            layer: LayerMask::PROJECTILES,
            transform,
            velocity,
            radius: PROJECTILE_RADIUS,
            mass: PROJECTILE_MASS,
        }
    }
}

/// What a projectile touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactTarget {
    Ground,
    Body(BodyHandle),
}

/// A projectile contact reported by a simulation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub projectile: BodyHandle,
    pub target: ContactTarget,
}

/// Physical-world adapter consumed by game logic
pub trait PhysicsWorld: Send {
    fn spawn_body(&mut self, desc: BodyDesc) -> BodyHandle;

    /// Remove a body; false if it did not exist
    fn despawn_body(&mut self, handle: BodyHandle) -> bool;

    /// Every body (active or not) on the given layers
    fn bodies_in(&self, mask: LayerMask) -> Vec<BodyHandle>;

    /// Active bodies on `mask` whose collision sphere overlaps the query sphere
    fn spatial_query(&self, center: Vec3, radius: f32, mask: LayerMask) -> Vec<BodyHandle>;

    /// Push a body away from `center`, scaled down linearly to zero at `radius`
    fn apply_impulse(&mut self, handle: BodyHandle, force: f32, center: Vec3, radius: f32);

    fn transform(&self, handle: BodyHandle) -> Option<Transform>;
    fn set_transform(&mut self, handle: BodyHandle, transform: Transform);

    /// Total velocity, including knockback
    fn velocity(&self, handle: BodyHandle) -> Option<Vec3>;
    /// Set the driven velocity; knockback is left alone
    fn set_velocity(&mut self, handle: BodyHandle, velocity: Vec3);
    /// Zero all motion, knockback included
    fn clear_motion(&mut self, handle: BodyHandle);

    fn set_active(&mut self, handle: BodyHandle, active: bool);
    fn is_active(&self, handle: BodyHandle) -> bool;

    /// Advance the simulation, returning projectile contacts
    fn step(&mut self, dt: f32) -> Vec<Contact>;
}

#[derive(Debug, Clone)]
struct Body {
    kind: BodyKind,
    layer: LayerMask,
    transform: Transform,
    velocity: Vec3,
    knockback: Vec3,
    radius: f32,
    mass: f32,
    active: bool,
}

/// In-process world: kinematic tanks on a ground plane, ballistic projectiles
#[derive(Debug, Default)]
pub struct SimWorld {
    bodies: BTreeMap<BodyHandle, Body>,
    next_handle: u64,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Check collision between two spheres
    fn spheres_overlap(a: Vec3, radius_a: f32, b: Vec3, radius_b: f32) -> bool {
        let combined = radius_a + radius_b;
        a.distance_squared(b) <= combined * combined
    }

    /// Push two overlapping tanks apart on the ground plane
    fn separate(a: Vec3, radius_a: f32, b: Vec3, radius_b: f32) -> (Vec3, Vec3) {
        let delta = Vec3::new(b.x - a.x, 0.0, b.z - a.z);
        let dist = delta.length();

        if dist < 0.001 {
            // Same position, push apart arbitrarily
            return (a - Vec3::X * radius_a, b + Vec3::X * radius_b);
        }

        let overlap = radius_a + radius_b - dist;
        if overlap <= 0.0 {
            return (a, b);
        }

        let normal = delta / dist;
        // Half the overlap each, plus a small buffer
        let push = overlap / 2.0 + 0.01;
        (a - normal * push, b + normal * push)
    }

    fn integrate(&mut self, dt: f32) {
        for body in self.bodies.values_mut().filter(|b| b.active) {
            if body.kind == BodyKind::Projectile {
                body.velocity.y -= GRAVITY * dt;
            }

            body.transform.position += (body.velocity + body.knockback) * dt;
            body.knockback *= KNOCKBACK_DRAG;
            if body.knockback.length_squared() < 1e-6 {
                body.knockback = Vec3::ZERO;
            }

            if body.kind == BodyKind::Tank {
                body.transform.position.y = 0.0;
            }
        }
    }

    fn resolve_tank_overlaps(&mut self) {
        let tanks: Vec<(BodyHandle, Vec3, f32)> = self
            .bodies
            .iter()
            .filter(|(_, b)| b.active && b.kind == BodyKind::Tank)
            .map(|(h, b)| (*h, b.transform.position, b.radius))
            .collect();

        for i in 0..tanks.len() {
            for j in (i + 1)..tanks.len() {
                let (h1, p1, r1) = tanks[i];
                let (h2, p2, r2) = tanks[j];
                if !Self::spheres_overlap(p1, r1, p2, r2) {
                    continue;
                }

                let (new_p1, new_p2) = Self::separate(p1, r1, p2, r2);
                if let Some(b) = self.bodies.get_mut(&h1) {
                    b.transform.position = new_p1;
                }
                if let Some(b) = self.bodies.get_mut(&h2) {
                    b.transform.position = new_p2;
                }
            }
        }
    }

    fn collect_contacts(&self) -> Vec<Contact> {
        let mut contacts = Vec::new();

        for (handle, projectile) in self
            .bodies
            .iter()
            .filter(|(_, b)| b.active && b.kind == BodyKind::Projectile)
        {
            for (other, body) in self
                .bodies
                .iter()
                .filter(|(_, b)| b.active && b.kind == BodyKind::Tank)
            {
                if Self::spheres_overlap(
                    projectile.transform.position,
                    projectile.radius,
                    body.transform.position,
                    body.radius,
                ) {
                    contacts.push(Contact {
                        projectile: *handle,
                        target: ContactTarget::Body(*other),
                    });
                }
            }

            if projectile.transform.position.y <= 0.0 {
                contacts.push(Contact {
                    projectile: *handle,
                    target: ContactTarget::Ground,
                });
            }
        }

        contacts
    }
}

impl PhysicsWorld for SimWorld {
    fn spawn_body(&mut self, desc: BodyDesc) -> BodyHandle {
        self.next_handle += 1;
        let handle = BodyHandle(self.next_handle);
        self.bodies.insert(
            handle,
            Body {
                kind: desc.kind,
                layer: desc.layer,
                transform: desc.transform,
                velocity: desc.velocity,
                knockback: Vec3::ZERO,
                radius: desc.radius,
                mass: desc.mass.max(f32::EPSILON),
                active: true,
            },
        );
        handle
    }

    fn despawn_body(&mut self, handle: BodyHandle) -> bool {
        self.bodies.remove(&handle).is_some()
    }

    fn bodies_in(&self, mask: LayerMask) -> Vec<BodyHandle> {
        self.bodies
            .iter()
            .filter(|(_, b)| b.layer.intersects(mask))
            .map(|(h, _)| *h)
            .collect()
    }

    fn spatial_query(&self, center: Vec3, radius: f32, mask: LayerMask) -> Vec<BodyHandle> {
        self.bodies
            .iter()
            .filter(|(_, b)| b.active && b.layer.intersects(mask))
            .filter(|(_, b)| Self::spheres_overlap(center, radius, b.transform.position, b.radius))
            .map(|(h, _)| *h)
            .collect()
    }

    fn apply_impulse(&mut self, handle: BodyHandle, force: f32, center: Vec3, radius: f32) {
        let Some(body) = self.bodies.get_mut(&handle) else {
            return;
        };
        if !body.active || radius <= 0.0 {
            return;
        }

        let offset = body.transform.position - center;
        let distance = offset.length();
        let falloff = (1.0 - distance / radius).max(0.0);
        if falloff <= 0.0 {
            return;
        }

        let direction = if distance < 0.001 {
            Vec3::Y
        } else {
            offset / distance
        };
        body.knockback += direction * (force * falloff / body.mass);
    }

    fn transform(&self, handle: BodyHandle) -> Option<Transform> {
        self.bodies.get(&handle).map(|b| b.transform)
    }

    fn set_transform(&mut self, handle: BodyHandle, transform: Transform) {
        if let Some(body) = self.bodies.get_mut(&handle) {
            body.transform = transform;
        }
    }

    fn velocity(&self, handle: BodyHandle) -> Option<Vec3> {
        self.bodies.get(&handle).map(|b| b.velocity + b.knockback)
    }

    fn set_velocity(&mut self, handle: BodyHandle, velocity: Vec3) {
        if let Some(body) = self.bodies.get_mut(&handle) {
            body.velocity = velocity;
        }
    }

    fn clear_motion(&mut self, handle: BodyHandle) {
        if let Some(body) = self.bodies.get_mut(&handle) {
            body.velocity = Vec3::ZERO;
            body.knockback = Vec3::ZERO;
        }
    }

    fn set_active(&mut self, handle: BodyHandle, active: bool) {
        if let Some(body) = self.bodies.get_mut(&handle) {
            body.active = active;
        }
    }

    fn is_active(&self, handle: BodyHandle) -> bool {
        self.bodies.get(&handle).map(|b| b.active).unwrap_or(false)
    }

    fn step(&mut self, dt: f32) -> Vec<Contact> {
        self.integrate(dt);
        self.resolve_tank_overlaps();
        self.collect_contacts()
    }
}
