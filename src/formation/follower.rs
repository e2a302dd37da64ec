use deps::*;

use bevy::{ecs as bevy_ecs, prelude::*, utils::HashMap};

use super::{slot_world_position, FormationLeader, FormationShape};
use crate::math::*;
use crate::nav::NavAgent;

/// An agent that keeps station on a formation slot.
#[derive(Debug, Clone, Component)]
pub struct FormationFollower {
    /// The unmodified speed of the nav agent when not compensating.
    pub base_speed: TReal,
    /// How many seconds ahead to extrapolate the leader's motion when
    /// predicting the slot position.
    pub look_ahead: TReal,
    /// How far this agent can drift from its slot before compensating.
    pub max_drift: TReal,
    /// Cap on the speed scale applied while compensating.
    pub max_speed_compensation: TReal,
    pub(super) leader: Option<Entity>,
    pub(super) slot: Option<usize>,
    pub(super) stop_latched: bool,
}

impl Default for FormationFollower {
    fn default() -> Self {
        Self {
            base_speed: 7.0,
            look_ahead: 10.0,
            max_drift: 1.0,
            max_speed_compensation: 1.5,
            leader: None,
            slot: None,
            stop_latched: false,
        }
    }
}

impl FormationFollower {
    #[inline]
    pub fn leader(&self) -> Option<Entity> {
        self.leader
    }

    #[inline]
    pub fn slot_index(&self) -> Option<usize> {
        self.slot
    }

    #[inline]
    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }
}

#[derive(Bundle, Default)]
pub struct FormationFollowerBundle {
    pub config: FormationFollower,
    pub nav: NavAgent,
}

/// Speed scale that closes (or widens) forward drift.
///
/// Lateral correction is the nav layer's job: an agent that's badly off to
/// the side holds base speed and lets the steering catch up.
pub(crate) fn drift_speed_scale(
    dist_forward: TReal,
    dist_lateral: TReal,
    remaining_distance: TReal,
    max_drift: TReal,
    max_speed_compensation: TReal,
) -> TReal {
    let mut scale = 1.0;
    if dist_forward > max_drift {
        // falling behind, catch up
        scale = dist_forward / max_drift;
    } else if dist_forward < -max_drift && remaining_distance < max_drift * 4.0 {
        // overshooting on the final leg, ease off
        scale = max_drift / dist_forward.abs();
    }
    if dist_lateral.abs() > max_drift {
        scale = 1.0;
    }
    scale.min(max_speed_compensation)
}

pub(crate) struct LeaderSample {
    position: TVec3,
    heading: TQuat,
    velocity: TVec3,
    stopped: bool,
    offsets: SVec<[TVec2; 8]>,
}

impl LeaderSample {
    fn slot_position(&self, slot: usize, horizon: TReal) -> TVec3 {
        slot_world_position(
            self.position,
            self.heading,
            self.velocity,
            self.offsets[slot],
            horizon,
        )
    }
}

#[derive(Default)]
pub struct FollowerUpdateCache {
    leaders: HashMap<Entity, LeaderSample>,
}

/// Phase two of the tick: point each follower's nav agent at the predicted
/// slot position and trade speed against drift. Must observe the leaders'
/// state for this very tick, hence the hard ordering after
/// [`super::leader::update`].
pub fn update(
    time: Res<Time>,
    mut crafts: ParamSet<(
        Query<(Entity, &mut FormationFollower, &mut NavAgent)>,
        Query<(&FormationShape, &NavAgent), With<FormationLeader>>,
    )>,
    mut cache: Local<FollowerUpdateCache>,
) {
    cache.leaders.clear();
    let mut wanted: SVec<[Entity; 8]> = crafts
        .p0()
        .iter()
        .filter_map(|(_, fol, _)| fol.leader)
        .collect();
    wanted.sort_unstable();
    wanted.dedup();
    {
        let leaders = crafts.p1();
        for entt in wanted {
            match leaders.get(entt) {
                Ok((shape, nav)) => {
                    cache.leaders.insert(
                        entt,
                        LeaderSample {
                            position: nav.position,
                            heading: nav.heading,
                            velocity: nav.velocity,
                            stopped: nav.is_stopped(),
                            offsets: shape.iter().copied().collect(),
                        },
                    );
                }
                Err(_) => {
                    tracing::error!(leader = ?entt, "leader components not found for follower's leader")
                }
            }
        }
    }

    let delta = time.delta_seconds();
    for (entt, mut fol, mut nav) in crafts.p0().iter_mut() {
        let (leader, slot) = match (fol.leader, fol.slot) {
            (Some(leader), Some(slot)) => (leader, slot),
            _ => continue,
        };
        let sample = match cache.leaders.get(&leader) {
            Some(sample) => sample,
            None => continue,
        };
        if slot >= sample.offsets.len() {
            tracing::error!(follower = ?entt, slot, "slot out of range for the leader's shape");
            continue;
        }
        if !sample.stopped {
            fol.stop_latched = false;
            let target = sample.slot_position(slot, delta * fol.look_ahead);
            nav.set_destination(target);
            let rel = target - nav.position;
            let scale = drift_speed_scale(
                rel.dot(nav.forward()),
                rel.dot(nav.lateral()),
                nav.remaining_distance,
                fol.max_drift,
                fol.max_speed_compensation,
            );
            nav.speed = fol.base_speed * scale;
        } else if !fol.stop_latched {
            // one last destination, without extrapolation, then hold until
            // the leader moves again
            fol.stop_latched = true;
            let target = sample.slot_position(slot, 0.);
            nav.set_destination(target);
        }
    }
}

#[test]
fn scale_catches_up_proportionally_to_forward_drift() {
    assert!((drift_speed_scale(3., 0., 10., 1., 10.) - 3.).abs() < TReal::EPSILON);
    assert!((drift_speed_scale(0.5, 0., 10., 1., 10.) - 1.).abs() < TReal::EPSILON);
}

#[test]
fn scale_eases_off_only_on_the_final_leg() {
    // ahead and close to the destination
    assert!((drift_speed_scale(-2., 0., 3., 1., 10.) - 0.5).abs() < TReal::EPSILON);
    // ahead but still far out
    assert!((drift_speed_scale(-2., 0., 10., 1., 10.) - 1.).abs() < TReal::EPSILON);
}

#[test]
fn lateral_drift_overrides_speed_tuning() {
    assert!((drift_speed_scale(3., 2., 10., 1., 10.) - 1.).abs() < TReal::EPSILON);
    assert!((drift_speed_scale(3., -2., 10., 1., 10.) - 1.).abs() < TReal::EPSILON);
}

#[test]
fn scale_never_exceeds_the_compensation_cap() {
    for dist in [-50., -5., 0., 2., 7., 30., 1000.] {
        let scale = drift_speed_scale(dist, 0., 1., 1., 1.5);
        assert!(scale <= 1.5, "scale {scale} for drift {dist}");
    }
}
