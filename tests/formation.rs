use deps::*;

use bevy::ecs::event::Events;
use bevy::prelude::*;

use echelon::*;

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn test_app() -> App {
    init_tracing();
    let mut app = App::new();
    app.add_plugins(MinimalPlugins).add_plugin(FormationPlugin);
    app
}

/// Staggered wedge: alternating sides, two slots per rank.
fn wedge(count: usize) -> FormationShape {
    FormationShape::new((0..count).map(|ii| {
        let rank = (ii / 2 + 1) as f32;
        let side = if ii % 2 == 0 { 1. } else { -1. };
        Vec2::new(side * rank * 2., -rank * 2.)
    }))
}

fn spawn_leader(world: &mut World, shape: FormationShape) -> Entity {
    world
        .spawn()
        .insert_bundle(FormationLeaderBundle::new(shape))
        .id()
}

fn spawn_follower(world: &mut World) -> Entity {
    world
        .spawn()
        .insert_bundle(FormationFollowerBundle::default())
        .id()
}

/// Puts the agent on a long straight leg so none of the stop clauses bite.
fn set_moving(world: &mut World, entt: Entity, pos: Vec3, vel: Vec3) {
    let mut nav = world.get_mut::<NavAgent>(entt).unwrap();
    nav.position = pos;
    nav.velocity = vel;
    nav.set_destination(pos + vel.normalize_or_zero() * 100.);
}

#[test]
fn slots_fill_in_order_and_reject_past_capacity() {
    let mut app = test_app();
    let world = &mut app.world;
    let leader = spawn_leader(world, wedge(3));
    let fols: Vec<Entity> = (0..4).map(|_| spawn_follower(world)).collect();

    for (ii, fol) in fols.iter().take(3).enumerate() {
        assert!(assign_leader(world, *fol, leader));
        let config = world.get::<FormationFollower>(*fol).unwrap();
        assert_eq!(config.leader(), Some(leader));
        assert_eq!(config.slot_index(), Some(ii));
    }
    {
        let slots = world.get::<FormationSlots>(leader).unwrap();
        assert_eq!(slots.members().as_slice(), &fols[..3]);
        assert!(!slots.has_positions_available());
    }

    // fourth one bounces, with no state change
    assert!(!assign_leader(world, fols[3], leader));
    assert_eq!(world.get::<FormationFollower>(fols[3]).unwrap().leader(), None);
    assert_eq!(world.get::<FormationSlots>(leader).unwrap().len(), 3);
}

#[test]
fn assigning_twice_is_idempotent() {
    let mut app = test_app();
    let world = &mut app.world;
    let leader = spawn_leader(world, wedge(3));
    let fol = spawn_follower(world);

    assert!(assign_leader(world, fol, leader));
    assert!(assign_leader(world, fol, leader));
    assert_eq!(world.get::<FormationFollower>(fol).unwrap().slot_index(), Some(0));
    assert_eq!(world.get::<FormationSlots>(leader).unwrap().len(), 1);
}

#[test]
fn assign_then_remove_restores_the_unattached_state() {
    let mut app = test_app();
    let world = &mut app.world;
    let leader = spawn_leader(world, wedge(3));
    let fol = spawn_follower(world);

    assert!(assign_leader(world, fol, leader));
    remove_leader(world, fol, leader);

    let config = world.get::<FormationFollower>(fol).unwrap();
    assert_eq!(config.leader(), None);
    assert_eq!(config.slot_index(), None);
    assert!(world.get::<FormationSlots>(leader).unwrap().is_empty());

    // and the slot is usable again
    assert!(assign_leader(world, fol, leader));
    assert_eq!(world.get::<FormationFollower>(fol).unwrap().slot_index(), Some(0));
}

#[test]
fn slot_indices_are_stable_across_removal() {
    let mut app = test_app();
    let world = &mut app.world;
    let leader = spawn_leader(world, wedge(3));
    let fols: Vec<Entity> = (0..3).map(|_| spawn_follower(world)).collect();
    for fol in &fols {
        assert!(assign_leader(world, *fol, leader));
    }

    remove_leader(world, fols[0], leader);
    assert_eq!(world.get::<FormationFollower>(fols[1]).unwrap().slot_index(), Some(1));
    assert_eq!(world.get::<FormationFollower>(fols[2]).unwrap().slot_index(), Some(2));

    // the freed slot goes to the next registration
    let late = spawn_follower(world);
    assert!(assign_leader(world, late, leader));
    assert_eq!(world.get::<FormationFollower>(late).unwrap().slot_index(), Some(0));
}

#[test]
fn slot_prediction_scales_with_look_ahead() {
    let mut app = test_app();
    let world = &mut app.world;
    let leader = spawn_leader(world, FormationShape::new([Vec2::new(2., -3.)]));
    {
        let mut nav = world.get_mut::<NavAgent>(leader).unwrap();
        nav.position = Vec3::new(10., 2., 5.);
        nav.velocity = Vec3::new(0., 0., -7.);
    }

    // zero look-ahead: raw slot position, elevation preserved, no velocity
    let raw = formation_position(world, leader, 0, 0., 0.016);
    assert!(raw.abs_diff_eq(Vec3::new(12., 2., 8.), 1e-4));

    let predicted = formation_position(world, leader, 0, 10., 0.5);
    assert!(predicted.abs_diff_eq(raw + Vec3::new(0., 0., -7.) * 5., 1e-4));
}

#[test]
fn followers_chase_their_predicted_slot_each_tick() {
    let mut app = test_app();
    let leader = {
        let world = &mut app.world;
        let leader = spawn_leader(world, FormationShape::new([Vec2::new(2., -3.)]));
        set_moving(world, leader, Vec3::ZERO, Vec3::new(0., 0., -7.));
        leader
    };
    let fol = {
        let world = &mut app.world;
        let fol = spawn_follower(world);
        assert!(assign_leader(world, fol, leader));
        // park it exactly on the raw slot
        let raw = formation_position(world, leader, 0, 0., 0.);
        world.get_mut::<NavAgent>(fol).unwrap().position = raw;
        fol
    };

    app.update();

    let delta = app.world.resource::<Time>().delta_seconds();
    let look_ahead = app.world.get::<FormationFollower>(fol).unwrap().look_ahead;
    let expected = formation_position(&app.world, leader, 0, look_ahead, delta);
    let nav = app.world.get::<NavAgent>(fol).unwrap();
    assert!(nav.destination().unwrap().abs_diff_eq(expected, 1e-4));

    // a follower far behind in line gets the capped catch-up speed
    {
        let world = &mut app.world;
        let raw = formation_position(world, leader, 0, 0., 0.);
        // 3 x max_drift straight behind (leader faces -Z)
        world.get_mut::<NavAgent>(fol).unwrap().position = raw + Vec3::new(0., 0., 3.);
    }
    app.update();
    let nav = app.world.get::<NavAgent>(fol).unwrap();
    let config = app.world.get::<FormationFollower>(fol).unwrap();
    assert!(
        (nav.speed - config.base_speed * config.max_speed_compensation).abs() < 1e-4,
        "speed {} not capped",
        nav.speed
    );
}

#[test]
fn stopped_leader_issues_exactly_one_final_destination() {
    let mut app = test_app();
    let (leader, fol) = {
        let world = &mut app.world;
        let leader = spawn_leader(world, FormationShape::new([Vec2::new(2., -3.)]));
        world.get_mut::<NavAgent>(leader).unwrap().halt();
        let fol = spawn_follower(world);
        assert!(assign_leader(world, fol, leader));
        (leader, fol)
    };

    app.update();
    let raw = formation_position(&app.world, leader, 0, 0., 0.);
    assert!(app
        .world
        .get::<NavAgent>(fol)
        .unwrap()
        .destination()
        .unwrap()
        .abs_diff_eq(raw, 1e-4));

    // not reissued while the leader stays stopped
    let sentinel = Vec3::new(123., 0., 456.);
    app.world
        .get_mut::<NavAgent>(fol)
        .unwrap()
        .set_destination(sentinel);
    app.update();
    assert!(app
        .world
        .get::<NavAgent>(fol)
        .unwrap()
        .destination()
        .unwrap()
        .abs_diff_eq(sentinel, 1e-4));

    // the latch releases once the leader moves again
    {
        let world = &mut app.world;
        world.get_mut::<NavAgent>(leader).unwrap().resume();
        set_moving(world, leader, Vec3::ZERO, Vec3::new(0., 0., -7.));
    }
    app.update();
    assert!(!app
        .world
        .get::<NavAgent>(fol)
        .unwrap()
        .destination()
        .unwrap()
        .abs_diff_eq(sentinel, 1e-4));
}

#[test]
fn stop_state_cascades_from_leader_to_formation() {
    let mut app = test_app();
    let (leader, fol) = {
        let world = &mut app.world;
        let leader = spawn_leader(world, wedge(2));
        world.get_mut::<NavAgent>(leader).unwrap().halt();
        let fol = spawn_follower(world);
        assert!(assign_leader(world, fol, leader));
        set_moving(world, fol, Vec3::new(5., 0., 5.), Vec3::new(0., 0., -5.));
        (leader, fol)
    };

    assert!(is_stopped(&app.world, leader));
    assert!(!is_follower_stopped(&app.world, fol));
    assert!(!is_formation_stopped(&app.world, leader));

    app.update();
    let leader_stops: Vec<_> = app
        .world
        .resource_mut::<Events<LeaderInPosition>>()
        .drain()
        .collect();
    assert_eq!(leader_stops.len(), 1);
    assert!(app
        .world
        .resource_mut::<Events<AllAgentsInPosition>>()
        .drain()
        .next()
        .is_none());

    // everyone halts: the group notification fires, once
    app.world.get_mut::<NavAgent>(fol).unwrap().halt();
    assert!(is_formation_stopped(&app.world, leader));
    app.update();
    let group_stops: Vec<_> = app
        .world
        .resource_mut::<Events<AllAgentsInPosition>>()
        .drain()
        .collect();
    assert_eq!(group_stops.len(), 1);
    assert_eq!(group_stops[0].leader, leader);

    // edge triggered: staying stopped is quiet
    app.update();
    assert!(app
        .world
        .resource_mut::<Events<LeaderInPosition>>()
        .drain()
        .next()
        .is_none());
    assert!(app
        .world
        .resource_mut::<Events<AllAgentsInPosition>>()
        .drain()
        .next()
        .is_none());
}

#[test]
fn leadership_transfer_reslots_the_group_in_order() {
    let mut app = test_app();
    let world = &mut app.world;
    let a = spawn_leader(world, wedge(3));
    world.entity_mut(a).insert(FormationFollower::default());
    let fols: Vec<Entity> = (0..3).map(|_| spawn_follower(world)).collect();
    for fol in &fols {
        assert!(assign_leader(world, *fol, a));
    }
    // the promotee moonlights as a leader already
    world
        .entity_mut(fols[1])
        .insert_bundle(FormationLeaderBundle::new(wedge(3)));

    // a plain follower can't take over
    assert!(!transfer_leadership(world, a, fols[0], true));

    assert!(transfer_leadership(world, a, fols[1], true));
    let new_roster = world.get::<FormationSlots>(fols[1]).unwrap().members();
    assert_eq!(new_roster.as_slice(), &[fols[0], fols[2], a]);
    assert!(world.get::<FormationSlots>(a).unwrap().is_empty());
    assert_eq!(world.get::<FormationFollower>(fols[1]).unwrap().leader(), None);
    assert_eq!(world.get::<FormationFollower>(a).unwrap().leader(), Some(fols[1]));
    assert_eq!(world.get::<FormationFollower>(a).unwrap().slot_index(), Some(2));
}

#[test]
fn directives_are_consumed_by_the_butlers() {
    let mut app = test_app();
    let (leader, fol) = {
        let world = &mut app.world;
        let leader = spawn_leader(world, wedge(2));
        let fol = spawn_follower(world);
        world.entity_mut(fol).insert(AssignToLeader { leader });
        (leader, fol)
    };

    app.update();
    assert!(app.world.get::<AssignToLeader>(fol).is_none());
    assert_eq!(
        app.world.get::<FormationFollower>(fol).unwrap().leader(),
        Some(leader)
    );

    // hand the group over through the directive
    let heir = {
        let world = &mut app.world;
        let heir = spawn_follower(world);
        assert!(assign_leader(world, heir, leader));
        world
            .entity_mut(heir)
            .insert_bundle(FormationLeaderBundle::new(wedge(2)));
        world.entity_mut(leader).insert(PassLeadership {
            to: heir,
            include_me: false,
        });
        heir
    };
    app.update();
    assert!(app.world.get::<PassLeadership>(leader).is_none());
    assert!(app.world.get::<FormationSlots>(leader).unwrap().is_empty());
    assert_eq!(
        app.world.get::<FormationSlots>(heir).unwrap().members().as_slice(),
        &[fol]
    );
}

#[test]
fn waiting_leader_stalls_until_the_group_closes_up() {
    let mut app = test_app();
    let (leader, fol) = {
        let world = &mut app.world;
        let leader = spawn_leader(world, wedge(2));
        world.get_mut::<FormationLeader>(leader).unwrap().wait_for_group = true;
        set_moving(world, leader, Vec3::ZERO, Vec3::new(0., 0., -7.));
        let fol = spawn_follower(world);
        assert!(assign_leader(world, fol, leader));
        // way out: center of mass drift is far past max_drift
        world.get_mut::<NavAgent>(fol).unwrap().position = Vec3::new(0., 0., 9.);
        (leader, fol)
    };

    app.update();
    assert!(app.world.get::<NavAgent>(leader).unwrap().speed.abs() < 1e-4);

    // group caught up: full base speed again
    {
        let world = &mut app.world;
        let pos = world.get::<NavAgent>(leader).unwrap().position;
        world.get_mut::<NavAgent>(fol).unwrap().position = pos;
        // keep the leg long so the leader doesn't count as stopped
        set_moving(world, leader, pos, Vec3::new(0., 0., -7.));
    }
    app.update();
    let nav = app.world.get::<NavAgent>(leader).unwrap();
    let base = app.world.get::<FormationLeader>(leader).unwrap().base_speed;
    assert!((nav.speed - base).abs() < 1e-4);
}

#[test]
fn swapping_shapes_evicts_the_overflow_and_rebroadcasts() {
    let mut app = test_app();
    let world = &mut app.world;
    let leader = spawn_leader(world, wedge(3));
    let fols: Vec<Entity> = (0..3).map(|_| spawn_follower(world)).collect();
    for fol in &fols {
        assert!(assign_leader(world, *fol, leader));
    }

    set_formation(world, leader, wedge(2));

    // the tail slot no longer exists
    let evicted = world.get::<FormationFollower>(fols[2]).unwrap();
    assert_eq!(evicted.leader(), None);
    assert_eq!(evicted.slot_index(), None);
    let slots = world.get::<FormationSlots>(leader).unwrap();
    assert_eq!(slots.capacity(), 2);
    assert_eq!(slots.members().as_slice(), &fols[..2]);

    // survivors were pointed at their new raw slots right away
    for (ii, fol) in fols.iter().take(2).enumerate() {
        let expected = formation_position(world, leader, ii, 0., 0.);
        let nav = world.get::<NavAgent>(*fol).unwrap();
        assert!(nav.destination().unwrap().abs_diff_eq(expected, 1e-4));
    }
}
