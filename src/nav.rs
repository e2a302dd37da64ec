use deps::*;

use bevy::{ecs as bevy_ecs, prelude::*};

use crate::math::*;

/// Velocity magnitudes (squared) below this count as standing still.
pub const STOP_SPEED_SQUARED: TReal = 0.1;

/// The navigation collaborator, as plain state.
///
/// The crate never plans paths. It writes `speed` and destinations and reads
/// back whatever pose/path state the embedding nav layer last reported.
#[derive(Debug, Clone, Component)]
pub struct NavAgent {
    /// World-space position as last reported by the nav layer.
    pub position: TVec3,
    pub heading: TQuat,
    /// World-space velocity as last reported by the nav layer. In m/s.
    pub velocity: TVec3,
    /// Desired travel speed. In m/s.
    pub speed: TReal,
    pub path_pending: bool,
    pub has_path: bool,
    /// Path distance left to the destination. In meters.
    pub remaining_distance: TReal,
    /// How close to the destination the agent brakes to a stand still.
    pub stopping_distance: TReal,
    /// Avoidance pecking order. Larger numbers yield to smaller ones.
    pub avoidance_priority: i32,
    destination: Option<TVec3>,
    halted: bool,
}

impl Default for NavAgent {
    fn default() -> Self {
        Self {
            position: TVec3::ZERO,
            heading: TQuat::IDENTITY,
            velocity: TVec3::ZERO,
            speed: 0.,
            path_pending: false,
            has_path: false,
            remaining_distance: 0.,
            stopping_distance: 0.5,
            avoidance_priority: 50,
            destination: None,
            halted: false,
        }
    }
}

impl NavAgent {
    /// Hands the agent a new destination.
    ///
    /// `remaining_distance` is refreshed with the straight line distance
    /// until the nav layer reports back the real path length.
    pub fn set_destination(&mut self, pos: TVec3) {
        self.destination = Some(pos);
        self.path_pending = false;
        self.has_path = true;
        self.remaining_distance = self.position.distance(pos);
    }

    #[inline]
    pub fn destination(&self) -> Option<TVec3> {
        self.destination
    }

    /// Explicitly park the agent. The path is kept around.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn resume(&mut self) {
        self.halted = false;
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    #[inline]
    pub fn forward(&self) -> TVec3 {
        self.heading * -TVec3::Z
    }

    #[inline]
    pub fn lateral(&self) -> TVec3 {
        self.heading * TVec3::X
    }

    /// Stopped means: explicitly halted, or no path to follow, or barely
    /// moving within braking range of the destination.
    pub fn is_stopped(&self) -> bool {
        self.is_stopped_following(true)
    }

    /// Stop predicate for agents that answer to a leader: the crawl-near-the
    /// -destination clause only counts once the leader itself has stopped.
    pub fn is_stopped_following(&self, leader_stopped: bool) -> bool {
        if self.halted {
            return true;
        }
        if !self.path_pending && !self.has_path {
            return true;
        }
        leader_stopped
            && self.velocity.length_squared() < STOP_SPEED_SQUARED
            && self
                .destination
                .map_or(true, |dest| dest.distance(self.position) < self.stopping_distance)
    }
}

#[test]
fn pathless_agent_is_stopped() {
    let agent = NavAgent::default();
    assert!(agent.is_stopped());
}

#[test]
fn halted_agent_is_stopped_even_with_a_path() {
    let mut agent = NavAgent::default();
    agent.set_destination(TVec3::new(0., 0., -100.));
    agent.velocity = TVec3::new(0., 0., -5.);
    assert!(!agent.is_stopped());
    agent.halt();
    assert!(agent.is_stopped());
    agent.resume();
    assert!(!agent.is_stopped());
}

#[test]
fn crawling_near_destination_is_stopped() {
    let mut agent = NavAgent::default();
    agent.set_destination(TVec3::new(0., 0., -0.2));
    agent.velocity = TVec3::new(0., 0., -0.1);
    assert!(agent.is_stopped());
    // but not while the leader's still going
    assert!(!agent.is_stopped_following(false));
}
