use deps::*;

use bevy::{prelude::*, utils::HashMap};

use super::{
    roster, slot_world_position, FormationFollower, FormationLeader, FormationShape,
    FormationSlots, LeaderState,
};
use crate::math::*;
use crate::nav::NavAgent;

/// Fired once when a leader comes to a stop.
#[derive(Debug, Clone, Copy)]
pub struct LeaderInPosition {
    pub leader: Entity,
}

/// Fired once when a leader and its whole group have come to a stop.
#[derive(Debug, Clone, Copy)]
pub struct AllAgentsInPosition {
    pub leader: Entity,
}

/// Scale for a leader that waits on a scattered group.
///
/// Stalls at zero rather than reversing once the center of mass falls
/// outside `max_drift`.
pub(crate) fn group_speed_scale(
    dist_from_com: TReal,
    max_drift: TReal,
    max_speed_compensation: TReal,
) -> TReal {
    ((max_drift - dist_from_com) / max_drift).clamp(0., max_speed_compensation)
}

#[derive(Clone, Copy)]
pub(crate) struct GroupSample {
    com_sum: TVec3,
    count: usize,
    all_would_stop: bool,
}

impl Default for GroupSample {
    fn default() -> Self {
        Self {
            com_sum: TVec3::ZERO,
            count: 0,
            all_would_stop: true,
        }
    }
}

#[derive(Default)]
pub struct LeaderUpdateCache {
    rosters: Vec<(Entity, SVec<[Entity; 8]>)>,
    groups: HashMap<Entity, GroupSample>,
}

/// Phase one of the tick: every leader picks its own speed off the group
/// state before any follower gets to read leader state.
pub fn update(
    mut crafts: ParamSet<(
        Query<(
            Entity,
            &FormationLeader,
            &mut LeaderState,
            &FormationSlots,
            &mut NavAgent,
        )>,
        Query<&NavAgent, With<FormationFollower>>,
    )>,
    mut leader_events: EventWriter<LeaderInPosition>,
    mut group_events: EventWriter<AllAgentsInPosition>,
    mut cache: Local<LeaderUpdateCache>,
) {
    let LeaderUpdateCache { rosters, groups } = &mut *cache;
    rosters.clear();
    groups.clear();
    for (entt, _, _, slots, _) in crafts.p0().iter() {
        rosters.push((entt, slots.members()));
    }
    // can't hold both halves of the param set at once, so sample the
    // followers before touching the leaders
    {
        let followers = crafts.p1();
        for (leader, members) in rosters.iter() {
            let mut sample = GroupSample::default();
            for follower in members.iter() {
                match followers.get(*follower) {
                    Ok(nav) => {
                        sample.com_sum += nav.position;
                        sample.count += 1;
                        sample.all_would_stop &= nav.is_stopped_following(true);
                    }
                    Err(_) => {
                        tracing::error!(follower = ?follower, "nav agent not found for follower")
                    }
                }
            }
            groups.insert(*leader, sample);
        }
    }

    for (entt, config, mut state, _, mut nav) in crafts.p0().iter_mut() {
        let sample = groups.get(&entt).copied().unwrap_or_default();
        let stopped = nav.is_stopped();
        if sample.count > 0 && !stopped {
            let scale = if config.wait_for_group {
                let com = sample.com_sum / sample.count as TReal;
                group_speed_scale(
                    (com - nav.position).length(),
                    config.max_drift,
                    config.max_speed_compensation,
                )
            } else {
                1.0
            };
            nav.speed = config.base_speed * scale;
        }

        let formation_stopped = stopped && sample.all_would_stop;
        if stopped && !state.was_stopped {
            leader_events.send(LeaderInPosition { leader: entt });
        }
        if formation_stopped && !state.was_formation_stopped {
            group_events.send(AllAgentsInPosition { leader: entt });
        }
        state.was_stopped = stopped;
        state.was_formation_stopped = formation_stopped;
    }
}

/// Worldspace rendezvous point for `slot`, extrapolated `look_ahead` ticks
/// of `delta` seconds along the leader's current velocity. A zero
/// `look_ahead` yields the raw slot position.
pub fn formation_position(
    world: &World,
    leader: Entity,
    slot: usize,
    look_ahead: TReal,
    delta: TReal,
) -> TVec3 {
    let shape = world
        .get::<FormationShape>(leader)
        .expect_or_log("FormationShape not found for leader");
    let nav = world
        .get::<NavAgent>(leader)
        .expect_or_log("NavAgent not found for leader");
    slot_world_position(
        nav.position,
        nav.heading,
        nav.velocity,
        shape.offset_at(slot),
        delta * look_ahead,
    )
}

/// Points every follower at its raw (un-extrapolated) slot position. Useful
/// for gathering the group while the leader holds still.
pub fn assume_formation(world: &mut World, leader: Entity) {
    let slots = world
        .get::<FormationSlots>(leader)
        .expect_or_log("FormationSlots not found for leader")
        .clone();
    for (slot, follower) in slots.iter() {
        let target = formation_position(world, leader, slot, 0., 0.);
        let mut nav = world
            .get_mut::<NavAgent>(follower)
            .expect_or_log("NavAgent not found for follower");
        nav.set_destination(target);
    }
}

/// Swaps the leader's shape at runtime.
///
/// Followers whose slot doesn't exist in the new shape are evicted through
/// the normal protocol; everyone left is told to assume the new formation
/// immediately.
pub fn set_formation(world: &mut World, leader: Entity, shape: FormationShape) {
    let new_count = shape.slot_count();
    let evicted: SVec<[Entity; 4]> = world
        .get::<FormationSlots>(leader)
        .expect_or_log("FormationSlots not found for leader")
        .iter()
        .filter(|(slot, _)| *slot >= new_count)
        .map(|(_, entt)| entt)
        .collect();
    for follower in evicted {
        tracing::warn!(?follower, ?leader, "evicting follower: new shape has fewer slots");
        roster::remove_leader(world, follower, leader);
    }
    {
        let mut slots = world
            .get_mut::<FormationSlots>(leader)
            .unwrap_or_log();
        slots.resize(new_count);
    }
    world.entity_mut(leader).insert(shape);
    assume_formation(world, leader);
}

#[test]
fn waiting_leader_slows_with_group_spread() {
    assert!((group_speed_scale(0., 3., 10.) - 1.).abs() < TReal::EPSILON);
    assert!((group_speed_scale(1.5, 3., 10.) - 0.5).abs() < TReal::EPSILON);
}

#[test]
fn waiting_leader_stalls_instead_of_reversing() {
    assert!(group_speed_scale(3., 3., 10.).abs() < TReal::EPSILON);
    assert!(group_speed_scale(30., 3., 10.).abs() < TReal::EPSILON);
}
