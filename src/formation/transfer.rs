use deps::*;

use bevy::{ecs as bevy_ecs, prelude::*};

use super::{roster, FormationFollower, FormationLeader, FormationShape, FormationSlots};

/// One-shot directive on a leader: hand the whole group over to `to`.
///
/// Consumed by [`butler`].
#[derive(Debug, Clone, Copy, Component)]
pub struct PassLeadership {
    pub to: Entity,
    /// Enlist this (old) leader's own follower role under the new leader.
    pub include_me: bool,
}

/// Reassigns every follower of `old_leader` to `new_leader` in slot order,
/// with fresh slot assignments.
///
/// The candidate may be one of the group's own followers or an outside
/// leader; either way it must already carry the leader components. Returns
/// false, touching nothing, when it can't act as a leader. Runs drain first
/// and then refill off a snapshot, so the old roster is never iterated while
/// being emptied.
pub fn transfer_leadership(
    world: &mut World,
    old_leader: Entity,
    new_leader: Entity,
    include_old_leader: bool,
) -> bool {
    if world.get::<FormationLeader>(new_leader).is_none()
        || world.get::<FormationSlots>(new_leader).is_none()
        || world.get::<FormationShape>(new_leader).is_none()
    {
        return false;
    }

    let snapshot = world
        .get::<FormationSlots>(old_leader)
        .expect_or_log("FormationSlots not found for old leader")
        .members();
    for member in snapshot.iter() {
        roster::remove_leader(world, *member, old_leader);
    }
    for member in snapshot.iter().filter(|member| **member != new_leader) {
        if !roster::assign_leader(world, *member, new_leader) {
            tracing::warn!(
                follower = ?member,
                leader = ?new_leader,
                "new leader rejected follower during transfer"
            );
        }
    }
    if include_old_leader {
        if world.get::<FormationFollower>(old_leader).is_some() {
            if !roster::assign_leader(world, old_leader, new_leader) {
                tracing::warn!(
                    leader = ?old_leader,
                    "new leader rejected the old leader during transfer"
                );
            }
        } else {
            tracing::warn!(leader = ?old_leader, "old leader has no follower role to enlist");
        }
    }
    true
}

pub fn butler(world: &mut World) {
    let mut directives = world.query::<(Entity, &PassLeadership)>();
    let directives: SVec<[(Entity, PassLeadership); 2]> = directives
        .iter(world)
        .map(|(entt, directive)| (entt, *directive))
        .collect();
    for (old_leader, directive) in directives {
        world.entity_mut(old_leader).remove::<PassLeadership>();
        if !transfer_leadership(world, old_leader, directive.to, directive.include_me) {
            tracing::error!(
                ?old_leader,
                candidate = ?directive.to,
                "leadership transfer refused: candidate can't lead"
            );
        }
    }
}
