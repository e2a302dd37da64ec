use deps::*;

use bevy::{ecs as bevy_ecs, prelude::*};
use educe::Educe;

use crate::math::*;
use crate::nav::NavAgent;

pub mod follower;
pub mod leader;
pub mod roster;
pub mod transfer;

pub use follower::FormationFollower;
pub use leader::{AllAgentsInPosition, LeaderInPosition};
pub use roster::AssignToLeader;
pub use transfer::PassLeadership;

/// An ordered set of local-space slot offsets, relative to a leader.
///
/// `x` runs along the leader's lateral axis, `y` along its forward axis.
/// Immutable once attached; swap the whole component through
/// [`leader::set_formation`] to change shape at runtime.
#[derive(Debug, Clone, Component, Educe)]
#[educe(Deref)]
pub struct FormationShape {
    offsets: SVec<[TVec2; 8]>,
}

impl FormationShape {
    pub fn new(offsets: impl IntoIterator<Item = TVec2>) -> Self {
        Self {
            offsets: offsets.into_iter().collect(),
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.offsets.len()
    }

    /// Panics if `slot` is out of range for this shape.
    #[inline]
    pub fn offset_at(&self, slot: usize) -> TVec2 {
        self.offsets[slot]
    }
}

/// Tuning for an agent that leads a formation.
#[derive(Debug, Clone, Component)]
pub struct FormationLeader {
    /// The unmodified speed of the nav agent when not compensating.
    pub base_speed: TReal,
    /// If set, the leader slows down until the group is closer to formation.
    /// Can stall the leader outright when the group is badly scattered.
    pub wait_for_group: bool,
    /// How far the group's center of mass may drift before the leader
    /// starts waiting.
    pub max_drift: TReal,
    /// Cap on the speed scale applied while compensating.
    pub max_speed_compensation: TReal,
}

impl Default for FormationLeader {
    fn default() -> Self {
        Self {
            base_speed: 7.0,
            wait_for_group: false,
            max_drift: 3.0,
            max_speed_compensation: 10.0,
        }
    }
}

/// Edge-trigger latches for the in-position notifications.
#[derive(Debug, Default, Clone, Component)]
pub struct LeaderState {
    pub(crate) was_stopped: bool,
    pub(crate) was_formation_stopped: bool,
}

/// Slot to follower assignments for one leader.
///
/// Slot indices are stable: removing a follower clears its slot without
/// shifting anyone else, and the freed slot is handed to the next
/// registration. Mutated exclusively through the [`roster`] protocol.
#[derive(Debug, Default, Clone, Component)]
pub struct FormationSlots {
    slots: SVec<[Option<Entity>; 8]>,
}

impl FormationSlots {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: smallvec::smallvec![None; slot_count],
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_positions_available(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_none())
    }

    pub fn slot_of(&self, entt: Entity) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(entt))
    }

    pub fn contains(&self, entt: Entity) -> bool {
        self.slot_of(entt).is_some()
    }

    /// Occupied slots, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Entity)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(ii, slot)| slot.map(|entt| (ii, entt)))
    }

    /// Follower entities, in slot order.
    pub fn members(&self) -> SVec<[Entity; 8]> {
        self.iter().map(|(_, entt)| entt).collect()
    }

    pub(crate) fn insert_first_free(&mut self, entt: Entity) -> Option<usize> {
        let free = self.slots.iter().position(|slot| slot.is_none())?;
        self.slots[free] = Some(entt);
        Some(free)
    }

    pub(crate) fn clear_of(&mut self, entt: Entity) -> bool {
        match self.slot_of(entt) {
            Some(ii) => {
                self.slots[ii] = None;
                true
            }
            None => false,
        }
    }

    /// Caller must have emptied any slot past `slot_count` first.
    pub(crate) fn resize(&mut self, slot_count: usize) {
        debug_assert!(self.slots.iter().skip(slot_count).all(|slot| slot.is_none()));
        self.slots.resize(slot_count, None);
    }
}

/// Everything an entity needs to lead: tuning, shape, an empty roster and a
/// nav agent.
#[derive(Bundle)]
pub struct FormationLeaderBundle {
    pub config: FormationLeader,
    pub shape: FormationShape,
    pub slots: FormationSlots,
    pub state: LeaderState,
    pub nav: NavAgent,
}

impl FormationLeaderBundle {
    pub fn new(shape: FormationShape) -> Self {
        let slots = FormationSlots::new(shape.slot_count());
        Self {
            config: Default::default(),
            shape,
            slots,
            state: Default::default(),
            nav: Default::default(),
        }
    }
}

/// Transforms a shape offset into a world-space rendezvous point.
///
/// The offset rides the leader's horizontal frame (elevation is preserved)
/// and the point is pushed along the leader's velocity by `horizon` seconds.
pub fn slot_world_position(
    position: TVec3,
    heading: TQuat,
    velocity: TVec3,
    offset: TVec2,
    horizon: TReal,
) -> TVec3 {
    let lateral = heading * TVec3::X;
    let forward = heading * -TVec3::Z;
    let mut pos = position + lateral * offset.x + forward * offset.y;
    pos.y = position.y;
    pos + velocity * horizon
}

/// Mean position of the leader's followers. [`None`] when it has none.
pub fn center_of_mass(world: &World, leader: Entity) -> Option<TVec3> {
    let slots = world.get::<FormationSlots>(leader)?;
    let mut sum = TVec3::ZERO;
    let mut count = 0usize;
    for (_, follower) in slots.iter() {
        if let Some(nav) = world.get::<NavAgent>(follower) {
            sum += nav.position;
            count += 1;
        }
    }
    (count > 0).then(|| sum / count as TReal)
}

pub fn is_stopped(world: &World, entt: Entity) -> bool {
    world
        .get::<NavAgent>(entt)
        .expect_or_log("NavAgent not found")
        .is_stopped()
}

/// A follower only counts as stopped once its leader is. Unattached
/// followers answer for themselves.
pub fn is_follower_stopped(world: &World, follower: Entity) -> bool {
    let leader_stopped = world
        .get::<FormationFollower>(follower)
        .and_then(|fol| fol.leader())
        .map_or(true, |leader| is_stopped(world, leader));
    world
        .get::<NavAgent>(follower)
        .expect_or_log("NavAgent not found for follower")
        .is_stopped_following(leader_stopped)
}

/// The leader and every registered follower have stopped.
pub fn is_formation_stopped(world: &World, leader: Entity) -> bool {
    if !is_stopped(world, leader) {
        return false;
    }
    let slots = world
        .get::<FormationSlots>(leader)
        .expect_or_log("FormationSlots not found for leader");
    slots.iter().all(|(_, follower)| {
        world
            .get::<NavAgent>(follower)
            .map_or(true, |nav| nav.is_stopped_following(true))
    })
}

#[test]
fn slots_hand_out_lowest_free_slot() {
    let mut world = World::new();
    let e1 = world.spawn().id();
    let e2 = world.spawn().id();
    let e3 = world.spawn().id();

    let mut slots = FormationSlots::new(3);
    assert_eq!(slots.insert_first_free(e1), Some(0));
    assert_eq!(slots.insert_first_free(e2), Some(1));
    assert_eq!(slots.insert_first_free(e3), Some(2));
    assert!(!slots.has_positions_available());
    assert_eq!(slots.insert_first_free(e1), None);

    assert!(slots.clear_of(e2));
    assert!(!slots.clear_of(e2));
    assert_eq!(slots.slot_of(e3), Some(2));
    assert_eq!(slots.insert_first_free(e2), Some(1));
    assert_eq!(slots.members().as_slice(), &[e1, e2, e3]);
}

#[test]
#[should_panic]
fn shape_panics_on_out_of_range_slot() {
    let shape = FormationShape::new([TVec2::new(2., 0.)]);
    shape.offset_at(1);
}

#[test]
fn slot_position_rides_the_leader_frame() {
    let pos = TVec3::new(4., 2., -3.);
    // quarter turn to the left: forward becomes -X, lateral -Z
    let heading = TQuat::from_rotation_y(real::consts::FRAC_PI_2);
    let out = slot_world_position(pos, heading, TVec3::ZERO, TVec2::new(1., 2.), 0.);
    assert!(out.abs_diff_eq(pos + TVec3::new(-2., 0., -1.), 1e-5));

    // velocity extrapolation scales with the horizon
    let vel = TVec3::new(0., 0., -7.);
    let out = slot_world_position(pos, heading, vel, TVec2::new(1., 2.), 0.5);
    assert!(out.abs_diff_eq(pos + TVec3::new(-2., 0., -1.) + vel * 0.5, 1e-5));
}
