use glam::{Vec2, Vec3};
use skysweep_core::{
    AreaBounds, AttributeEncoding, AttributeSet, FlightState, HelmetColor, JacketColor,
    SkysweepConfig, Tick, WardrobeIndices, WorldState,
};
use skysweep_scene::{FlatScene, Obstacle};
use skysweep_score::{KeywordPolicy, IndexPolicy};

fn keyword_world(config: SkysweepConfig) -> WorldState {
    WorldState::with_matcher(config, Box::new(KeywordPolicy)).expect("world")
}

fn orange_no_helmet() -> AttributeSet {
    AttributeSet::Categorical {
        jacket: JacketColor::Orange,
        helmet: HelmetColor::None,
    }
}

fn red_no_helmet() -> AttributeSet {
    AttributeSet::Categorical {
        jacket: JacketColor::Red,
        helmet: HelmetColor::None,
    }
}

fn horizontal(a: Vec3, b: Vec3) -> f32 {
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    (dx * dx + dz * dz).sqrt()
}

#[test]
fn seeded_world_advances_deterministically() {
    let config = SkysweepConfig {
        rng_seed: Some(0xDEADBEEF),
        ..SkysweepConfig::default()
    };

    let mut world_a = keyword_world(config.clone());
    let mut world_b = keyword_world(config);

    for world in [&mut world_a, &mut world_b] {
        world
            .spawn_population(10, AttributeEncoding::Categorical)
            .expect("population");
        world.spawn_drone(Vec3::new(-20.0, 0.0, -40.0));
        world.spawn_drone(Vec3::new(20.0, 0.0, -40.0));
    }

    for _ in 0..400 {
        world_a.step();
        world_b.step();
    }

    assert_eq!(world_a.tick(), Tick(400));
    assert_eq!(world_b.tick(), Tick(400));
    let drones_a: Vec<_> = world_a.drones().map(|(_, d)| (d.position, d.state)).collect();
    let drones_b: Vec<_> = world_b.drones().map(|(_, d)| (d.position, d.state)).collect();
    assert_eq!(drones_a, drones_b);
}

#[test]
fn launch_acquired_target_is_approached_and_landed_beside() {
    let config = SkysweepConfig {
        rng_seed: Some(11),
        ..SkysweepConfig::default()
    };
    let mut world = keyword_world(config);

    let person_pos = Vec3::new(20.0, 0.0, 10.0);
    let person = world.spawn_person(person_pos, orange_no_helmet());
    let drone = world.spawn_drone(Vec3::new(0.0, 0.0, -30.0));
    let state = world.drone(drone).expect("drone");
    assert_eq!(state.target, Some(person));
    assert_eq!(state.state, FlightState::Approach);

    let mut landed_at = None;
    for _ in 0..4_000 {
        world.step();
        let state = world.drone(drone).expect("drone");
        if state.state == FlightState::Landed {
            landed_at = Some((state.position, state.landing_point()));
            break;
        }
    }

    let (position, landing) = landed_at.expect("drone landed");
    let tolerance = world.config().flight.position_tolerance + 0.05;
    assert!(position.distance(landing) <= tolerance);

    // Landing point sits on the terrain, inset from the target by the
    // configured offset.
    assert!(landing.y.abs() < 1e-3);
    let offset = horizontal(landing, person_pos);
    assert!((offset - world.config().flight.landing_offset).abs() < 1e-2);
}

#[test]
fn patrolling_drone_acquires_late_spawned_target() {
    let config = SkysweepConfig {
        rng_seed: Some(3),
        ..SkysweepConfig::default()
    };
    let mut world = keyword_world(config);
    let drone = world.spawn_drone(Vec3::ZERO);

    let mut reached_patrol = false;
    for _ in 0..1_000 {
        world.step();
        if world.drone(drone).expect("drone").state == FlightState::Patrol {
            reached_patrol = true;
            break;
        }
    }
    assert!(reached_patrol, "empty world must settle into patrol");

    let person = world.spawn_person(Vec3::new(30.0, 0.0, 0.0), orange_no_helmet());
    // More than one retarget interval of ticks.
    for _ in 0..30 {
        world.step();
    }
    let state = world.drone(drone).expect("drone");
    assert_eq!(state.target, Some(person));
    assert_ne!(state.state, FlightState::Patrol);

    // The full takeoff → patrol → approach chain finishes on the ground
    // beside the acquired person.
    for _ in 0..4_000 {
        if world.drone(drone).expect("drone").state == FlightState::Landed {
            break;
        }
        world.step();
    }
    let state = world.drone(drone).expect("drone");
    assert_eq!(state.state, FlightState::Landed);
    let rest = horizontal(state.position, Vec3::new(30.0, 0.0, 0.0));
    assert!(rest <= world.config().flight.landing_offset + 1.0);
}

#[test]
fn mission_query_update_reaches_every_drone() {
    // "red jacket" without a person term scores 0.0 against the orange
    // population, so the drone patrols indefinitely.
    let config = SkysweepConfig {
        rng_seed: Some(5),
        mission_query: "red jacket".to_string(),
        ..SkysweepConfig::default()
    };
    let mut world = keyword_world(config);
    world.spawn_person(Vec3::new(25.0, 0.0, 5.0), orange_no_helmet());
    let drone = world.spawn_drone(Vec3::ZERO);

    for _ in 0..600 {
        world.step();
    }
    assert_eq!(world.drone(drone).expect("drone").state, FlightState::Patrol);

    world.set_mission_query(Some("person with orange jacket"));
    for _ in 0..30 {
        world.step();
    }
    assert_ne!(world.drone(drone).expect("drone").state, FlightState::Patrol);
}

#[test]
fn index_policy_selects_strongest_token_match() {
    let config = SkysweepConfig {
        rng_seed: Some(9),
        mission_query: "material:1 hat:0 accessory:2".to_string(),
        ..SkysweepConfig::default()
    };
    let mut world = WorldState::with_matcher(config, Box::new(IndexPolicy)).expect("world");

    let _partial = world.spawn_person(
        Vec3::new(10.0, 0.0, 0.0),
        AttributeSet::Indexed(WardrobeIndices {
            material: 1,
            hat: 0,
            accessory: 0,
        }),
    );
    let full = world.spawn_person(
        Vec3::new(40.0, 0.0, 0.0),
        AttributeSet::Indexed(WardrobeIndices {
            material: 1,
            hat: 0,
            accessory: 2,
        }),
    );

    let drone = world.spawn_drone(Vec3::ZERO);
    assert_eq!(world.drone(drone).expect("drone").target, Some(full));
    assert_eq!(world.find_best_match(drone, None), Some(full));
}

#[test]
fn detections_never_fall_below_the_confidence_floor() {
    let mut config = SkysweepConfig {
        rng_seed: Some(21),
        ..SkysweepConfig::default()
    };
    config.perception.confidence_threshold = 0.5;
    let mut world = keyword_world(config);

    // Scores 1.0 against the default query.
    world.spawn_person(Vec3::new(30.0, 0.0, 0.0), orange_no_helmet());
    // Scores 0.3 (person term only): below the floor.
    world.spawn_person(Vec3::new(28.0, 0.0, 6.0), red_no_helmet());

    let drone = world.spawn_drone(Vec3::new(0.0, 4.0, 0.0));
    world.step();

    let detections = world.detections(drone);
    assert_eq!(detections.len(), 1);
    assert!(detections.iter().all(|d| d.confidence >= 0.5));
}

#[test]
fn occluders_hide_targets_from_perception_but_not_from_search() {
    let config = SkysweepConfig {
        rng_seed: Some(2),
        ..SkysweepConfig::default()
    };
    let mut world = keyword_world(config);

    let mut scene = FlatScene::new(0.0);
    scene.push_obstacle(Obstacle::new(
        Vec3::new(10.0, -1.0, -10.0),
        Vec3::new(12.0, 50.0, 10.0),
    ));
    world.set_scene(Box::new(scene));

    let person = world.spawn_person(Vec3::new(30.0, 0.0, 0.0), orange_no_helmet());
    let drone = world.spawn_drone(Vec3::new(0.0, 5.0, 0.0));
    world.step();

    assert!(world.detections(drone).is_empty());
    // The unconstrained search still sees through walls.
    assert_eq!(world.find_best_match(drone, None), Some(person));
}

#[test]
fn contested_target_is_assigned_to_one_drone_only() {
    let config = SkysweepConfig {
        rng_seed: Some(17),
        patrol_area: Some(AreaBounds::new(Vec2::splat(-80.0), Vec2::splat(80.0))),
        ..SkysweepConfig::default()
    };
    let mut world = keyword_world(config);

    let person = world.spawn_person(Vec3::new(0.0, 0.0, 20.0), orange_no_helmet());
    let near = world.spawn_drone(Vec3::new(0.0, 0.0, -10.0));
    let far = world.spawn_drone(Vec3::new(0.0, 0.0, -70.0));

    world.step();
    let owners: Vec<_> = world
        .assignment_snapshot()
        .into_iter()
        .filter(|entry| entry.target == Some(person))
        .map(|entry| entry.drone)
        .collect();
    assert_eq!(owners, vec![near]);
    assert_eq!(world.assignments().get(far).copied().flatten(), None);
}

#[test]
fn repeated_best_match_queries_are_idempotent() {
    let config = SkysweepConfig {
        rng_seed: Some(31),
        ..SkysweepConfig::default()
    };
    let mut world = keyword_world(config);
    world
        .spawn_population(8, AttributeEncoding::Categorical)
        .expect("population");
    let drone = world.spawn_drone(Vec3::ZERO);

    let first = world.find_best_match(drone, None);
    for _ in 0..16 {
        assert_eq!(world.find_best_match(drone, None), first);
    }
    assert_eq!(world.persons().len(), 8);
}
