use deps::*;

use bevy::{ecs as bevy_ecs, prelude::*};

use super::{FormationFollower, FormationSlots};
use crate::nav::NavAgent;

/// Registration refused: every slot in the leader's shape is taken.
///
/// Recoverable. Retry once someone leaves, or pick another leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no formation positions available")
    }
}

impl std::error::Error for Rejected {}

/// Claims a slot on `leader` for `follower`.
///
/// Idempotent for an already registered pair. The follower's back-reference
/// must already point at `leader`; [`assign_leader`] owns that step and is
/// the entry point everything else should use. A mismatched pair is a
/// protocol breach and panics.
pub fn register_follower(
    world: &mut World,
    leader: Entity,
    follower: Entity,
) -> Result<usize, Rejected> {
    {
        let fol = world
            .get::<FormationFollower>(follower)
            .expect_or_log("FormationFollower not found");
        if fol.leader != Some(leader) {
            panic!(
                "register_follower called before the leader back-reference was set, use assign_leader"
            );
        }
    }
    let leader_priority = world
        .get::<NavAgent>(leader)
        .expect_or_log("NavAgent not found for leader")
        .avoidance_priority;
    {
        let slots = world
            .get::<FormationSlots>(leader)
            .expect_or_log("FormationSlots not found for leader");
        if let Some(slot) = slots.slot_of(follower) {
            return Ok(slot);
        }
        if !slots.has_positions_available() {
            return Err(Rejected);
        }
    }
    {
        // the leader must never end up yielding to its own followers in the
        // avoidance layer
        let mut nav = world
            .get_mut::<NavAgent>(follower)
            .expect_or_log("NavAgent not found for follower");
        if nav.avoidance_priority < leader_priority {
            nav.avoidance_priority = leader_priority + 1;
        }
    }
    let mut slots = world
        .get_mut::<FormationSlots>(leader)
        .unwrap_or_log();
    let slot = slots
        .insert_first_free(follower)
        .expect_or_log("slot vanished mid registration");
    Ok(slot)
}

/// Drops `follower` from the leader's slots. Panics when the pair is
/// mismatched; that's a protocol breach, not a recoverable state.
pub fn unregister_follower(world: &mut World, leader: Entity, follower: Entity) -> bool {
    {
        let fol = world
            .get::<FormationFollower>(follower)
            .expect_or_log("FormationFollower not found");
        match fol.leader {
            None => panic!("{follower:?} has no leader"),
            Some(current) if current != leader => {
                panic!("{follower:?} is not a follower of {leader:?}")
            }
            Some(_) => {}
        }
    }
    let mut slots = world
        .get_mut::<FormationSlots>(leader)
        .expect_or_log("FormationSlots not found for leader");
    slots.clear_of(follower)
}

/// The only sanctioned way into a formation: points the follower's
/// back-reference at `leader`, claims a slot, and rolls the back-reference
/// back if the leader is full.
///
/// Panics if the follower is still attached to a different leader; call
/// [`remove_leader`] first.
pub fn assign_leader(world: &mut World, follower: Entity, leader: Entity) -> bool {
    {
        let mut fol = world
            .get_mut::<FormationFollower>(follower)
            .expect_or_log("FormationFollower not found");
        if let Some(current) = fol.leader {
            if current != leader {
                panic!("{follower:?} already answers to {current:?}, remove_leader first");
            }
        }
        fol.leader = Some(leader);
    }
    match register_follower(world, leader, follower) {
        Ok(slot) => {
            let mut fol = world
                .get_mut::<FormationFollower>(follower)
                .unwrap_or_log();
            fol.slot = Some(slot);
            true
        }
        Err(Rejected) => {
            let mut fol = world
                .get_mut::<FormationFollower>(follower)
                .unwrap_or_log();
            fol.leader = None;
            false
        }
    }
}

/// Detaches `follower` from `leader`, restoring the unattached state.
pub fn remove_leader(world: &mut World, follower: Entity, leader: Entity) {
    {
        let fol = world
            .get::<FormationFollower>(follower)
            .expect_or_log("FormationFollower not found");
        if fol.leader != Some(leader) {
            panic!("{leader:?} is not the current leader of {follower:?}");
        }
    }
    if unregister_follower(world, leader, follower) {
        let mut fol = world
            .get_mut::<FormationFollower>(follower)
            .unwrap_or_log();
        fol.leader = None;
        fol.slot = None;
    } else {
        // the back-reference check above said otherwise
        panic!("{follower:?} was missing from the slots of {leader:?}");
    }
}

/// One-shot directive: enlist this entity under `leader` on the next tick.
///
/// Consumed by [`butler`]. A rejection is logged and dropped, never retried.
#[derive(Debug, Clone, Copy, Component)]
pub struct AssignToLeader {
    pub leader: Entity,
}

pub fn butler(world: &mut World) {
    let mut directives = world.query::<(Entity, &AssignToLeader)>();
    let directives: SVec<[(Entity, Entity); 4]> = directives
        .iter(world)
        .map(|(entt, directive)| (entt, directive.leader))
        .collect();
    for (follower, leader) in directives {
        world.entity_mut(follower).remove::<AssignToLeader>();
        if !assign_leader(world, follower, leader) {
            tracing::warn!(
                ?follower,
                ?leader,
                "leader rejected follower: no positions available"
            );
        }
    }
}
