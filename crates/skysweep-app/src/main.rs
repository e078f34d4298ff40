use anyhow::Result;
use clap::{Parser, ValueEnum};
use glam::Vec3;
use skysweep_core::{
    AttributeEncoding, FlightState, PatrolMode, SkysweepConfig, WorldState,
};
use skysweep_scene::{FlatScene, Obstacle};
use skysweep_score::{PolicyKind, matcher};
use tracing::{debug, info, warn};

/// Which scoring policy the deployment runs; the population encoding follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Keyword,
    Index,
}

impl From<PolicyArg> for PolicyKind {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Keyword => Self::Keyword,
            PolicyArg::Index => Self::Index,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "skysweep", about = "Autonomous drone mission-search simulation")]
struct Args {
    /// Number of drones in the fleet.
    #[arg(long, default_value_t = 2)]
    drones: usize,

    /// Number of persons seeded into the world.
    #[arg(long, default_value_t = 12)]
    persons: usize,

    /// Maximum number of simulation ticks to run.
    #[arg(long, default_value_t = 20_000)]
    ticks: u64,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Mission query; defaults to the built-in prompt.
    #[arg(long)]
    query: Option<String>,

    /// Scoring policy to wire into the world.
    #[arg(long, value_enum, default_value_t = PolicyArg::Keyword)]
    policy: PolicyArg,

    /// Patrol with random wander destinations instead of a fixed route.
    #[arg(long)]
    wander: bool,

    /// Emit the final world snapshot as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut world = bootstrap_world(&args)?;
    info!(
        drones = args.drones,
        persons = args.persons,
        policy = ?args.policy,
        query = world.mission_query(),
        "Starting Skysweep simulation shell"
    );
    run(&mut world, &args);
    report(&world, &args)?;
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap_world(args: &Args) -> Result<WorldState> {
    let mut config = SkysweepConfig {
        rng_seed: args.seed,
        ..SkysweepConfig::default()
    };
    if let Some(query) = &args.query {
        config.mission_query = query.clone();
    }
    if args.wander {
        config.flight.patrol_mode = PatrolMode::RandomWander;
    }

    let mut world = WorldState::with_matcher(config, matcher(args.policy.into()))?;

    let mut scene = FlatScene::new(0.0);
    scene.push_obstacle(Obstacle::new(
        Vec3::new(-12.0, 0.0, 18.0),
        Vec3::new(-4.0, 9.0, 26.0),
    ));
    world.set_scene(Box::new(scene));

    let encoding = match args.policy {
        PolicyArg::Keyword => AttributeEncoding::Categorical,
        PolicyArg::Index => AttributeEncoding::Indexed,
    };
    world.spawn_population(args.persons, encoding)?;

    let spacing = 15.0;
    let offset = (args.drones.saturating_sub(1)) as f32 * spacing * 0.5;
    for index in 0..args.drones {
        let origin = Vec3::new(index as f32 * spacing - offset, 0.0, -50.0);
        world.spawn_drone(origin);
    }
    Ok(world)
}

fn run(world: &mut WorldState, args: &Args) {
    let mut last_states: Vec<(skysweep_core::DroneId, FlightState)> = world
        .drones()
        .map(|(id, drone)| (id, drone.state))
        .collect();

    for _ in 0..args.ticks {
        let events = world.step();
        if events.coordinator_cycled {
            debug!(tick = events.tick.0, "coordinator reassessed assignments");
        }

        for (id, previous) in &mut last_states {
            let Some(drone) = world.drone(*id) else {
                continue;
            };
            if drone.state != *previous {
                info!(
                    tick = events.tick.0,
                    drone = ?*id,
                    from = ?*previous,
                    to = ?drone.state,
                    x = drone.position.x,
                    z = drone.position.z,
                    "flight state transition"
                );
                *previous = drone.state;
            }
        }

        if world.drones().all(|(_, drone)| drone.state == FlightState::Landed) {
            info!(tick = events.tick.0, "entire fleet has landed");
            break;
        }
    }
}

fn report(world: &WorldState, args: &Args) -> Result<()> {
    for group in world.population_report() {
        info!(count = group.count, "population: {}", group.description);
    }

    for entry in world.assignment_snapshot() {
        match entry.target.and_then(|id| world.persons().get(id)) {
            Some(person) => info!(
                drone = ?entry.drone,
                target = person.attributes.describe(),
                "final assignment"
            ),
            None => debug!(drone = ?entry.drone, "final assignment: none"),
        }
    }

    match world.history().last() {
        Some(summary) => info!(
            tick = summary.tick.0,
            landed = summary.landed,
            approaching = summary.approaching,
            patrolling = summary.patrolling,
            detections = summary.detections,
            "final summary"
        ),
        None => warn!("simulation produced no tick summaries"),
    }

    if args.json {
        let snapshot = serde_json::json!({
            "tick": world.tick().0,
            "mission_query": world.mission_query(),
            "population": world.population_report(),
            "assignments": world.assignment_snapshot(),
            "drones": world
                .drones()
                .map(|(_, drone)| {
                    serde_json::json!({
                        "state": format!("{:?}", drone.state),
                        "position": [drone.position.x, drone.position.y, drone.position.z],
                    })
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}
