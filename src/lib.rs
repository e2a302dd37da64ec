//! Predictive formation keeping for groups of nav-agent driven mobiles.
//!
//! A [`FormationLeader`] owns a capacity-bounded roster of slot assignments
//! cut from a [`FormationShape`]; each [`FormationFollower`] chases a
//! velocity-extrapolated prediction of its slot every tick, trading speed
//! against drift. Path planning itself is somebody else's problem: the crate
//! only talks to [`NavAgent`], a dumb contract component an embedding nav
//! layer is expected to drive.

use deps::*;

use bevy::{ecs as bevy_ecs, prelude::*};

pub mod formation;
pub mod math;
pub mod nav;

pub use formation::{
    center_of_mass,
    follower::FormationFollowerBundle,
    is_follower_stopped, is_formation_stopped, is_stopped,
    leader::{assume_formation, formation_position, set_formation},
    roster::{assign_leader, register_follower, remove_leader, unregister_follower, Rejected},
    slot_world_position,
    transfer::transfer_leadership,
    AllAgentsInPosition, AssignToLeader, FormationFollower, FormationLeader,
    FormationLeaderBundle, FormationShape, FormationSlots, LeaderState, LeaderInPosition,
    PassLeadership,
};
pub use nav::NavAgent;

/// The two-phase tick contract: all leaders settle their state before any
/// follower reads it. Hard ordering, not an optimization.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, SystemLabel)]
pub enum FormationSystems {
    LeaderUpdate,
    FollowerUpdate,
}

pub struct FormationPlugin;

impl Plugin for FormationPlugin {
    fn build(&self, app: &mut App) {
        use FormationSystems::*;
        app.add_event::<LeaderInPosition>()
            .add_event::<AllAgentsInPosition>()
            .add_system_to_stage(
                CoreStage::PreUpdate,
                formation::roster::butler.exclusive_system(),
            )
            .add_system_to_stage(
                CoreStage::PreUpdate,
                formation::transfer::butler.exclusive_system(),
            )
            .add_system(formation::leader::update.label(LeaderUpdate))
            .add_system(formation::follower::update.label(FollowerUpdate).after(LeaderUpdate));
    }
}
