//! Core simulation state shared across the Skysweep workspace.
//!
//! One [`WorldState`] owns the describable-person registry, every drone's
//! flight controller and perception state, and the multi-drone coordinator,
//! advancing all of them through a fixed-timestep [`WorldState::step`]
//! pipeline. Geometry is delegated to the [`skysweep_scene`] collaborator and
//! mission-query scoring to a pluggable [`MatchPolicy`].

use glam::{Vec2, Vec3};
use ordered_float::OrderedFloat;
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use skysweep_scene::{LayerMask, PinholeCamera, SceneQuery, Viewport};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for drones backed by a generational slot map.
    pub struct DroneId;
}

new_key_type! {
    /// Stable handle for describable persons in the registry.
    pub struct PersonId;
}

/// Convenience alias for associating side data with drones.
pub type DroneMap<T> = SecondaryMap<DroneId, T>;

/// Mission text applied to freshly built worlds.
pub const DEFAULT_MISSION_QUERY: &str = "person with orange jacket and yellow hard hat";

const FULL_TURN: f32 = std::f32::consts::TAU;
const HALF_TURN: f32 = std::f32::consts::PI;

/// Elevation above a probe point from which ground raycasts are fired.
const GROUND_PROBE_HEIGHT: f32 = 1_000.0;
const GROUND_PROBE_RANGE: f32 = 2_000.0;
/// Shorter probe used when validating a candidate landing point.
const LANDING_PROBE_HEIGHT: f32 = 200.0;
const LANDING_PROBE_RANGE: f32 = 500.0;
/// Coordinator cycles never run more often than this, whatever the config says.
const MIN_REASSESS_INTERVAL: f32 = 0.02;
/// Rays steeper than this vertical component can be intersected with a plane.
const RAY_PARALLEL_EPSILON: f32 = 1e-3;
/// Screen rectangles at or below this many pixels on a side are degenerate.
const MIN_BOX_PIXELS: f32 = 1.0;

fn wrap_signed_angle(mut angle: f32) -> f32 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle <= -HALF_TURN {
        angle += FULL_TURN;
    }
    while angle > HALF_TURN {
        angle -= FULL_TURN;
    }
    angle
}

fn horizontal_distance(a: Vec3, b: Vec3) -> f32 {
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    (dx * dx + dz * dz).sqrt()
}

fn angle_between_degrees(a: Vec3, b: Vec3) -> f32 {
    let denom = a.length() * b.length();
    if denom <= f32::EPSILON {
        return 0.0;
    }
    (a.dot(b) / denom).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Jacket colors recognized by the categorical attribute encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JacketColor {
    Orange,
    Red,
    Blue,
    Green,
    Yellow,
    Black,
}

impl JacketColor {
    /// Every jacket color, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Orange,
        Self::Red,
        Self::Blue,
        Self::Green,
        Self::Yellow,
        Self::Black,
    ];
}

impl fmt::Display for JacketColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Orange => "orange",
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Black => "black",
        };
        f.write_str(name)
    }
}

/// Helmet colors recognized by the categorical attribute encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HelmetColor {
    Yellow,
    White,
    Orange,
    None,
}

impl HelmetColor {
    /// Every helmet variant, in declaration order.
    pub const ALL: [Self; 4] = [Self::Yellow, Self::White, Self::Orange, Self::None];
}

impl fmt::Display for HelmetColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Yellow => "yellow",
            Self::White => "white",
            Self::Orange => "orange",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Integer-index wardrobe encoding: indices into fixed-size catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WardrobeIndices {
    pub material: u8,
    pub hat: u8,
    pub accessory: u8,
}

/// Discrete descriptor of a detectable person, assigned at creation and
/// immutable thereafter. The two encodings are an evolution of the same
/// concept and never coexist on one population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeSet {
    Categorical {
        jacket: JacketColor,
        helmet: HelmetColor,
    },
    Indexed(WardrobeIndices),
}

impl AttributeSet {
    /// Sample a uniformly random categorical descriptor.
    pub fn random_categorical(rng: &mut dyn RngCore) -> Self {
        Self::Categorical {
            jacket: JacketColor::ALL[rng.random_range(0..JacketColor::ALL.len())],
            helmet: HelmetColor::ALL[rng.random_range(0..HelmetColor::ALL.len())],
        }
    }

    /// Sample a uniformly random indexed descriptor from `catalog`.
    pub fn random_indexed(rng: &mut dyn RngCore, catalog: &WardrobeCatalog) -> Self {
        Self::Indexed(WardrobeIndices {
            material: rng.random_range(0..catalog.materials),
            hat: rng.random_range(0..catalog.hats),
            accessory: rng.random_range(0..catalog.accessories),
        })
    }

    /// Short human-readable phrase used by reports and debug output.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Categorical { jacket, helmet } => match helmet {
                HelmetColor::None => format!("{jacket} jacket, no helmet"),
                color => format!("{jacket} jacket, {color} helmet"),
            },
            Self::Indexed(w) => format!(
                "material {}, hat {}, accessory {}",
                w.material, w.hat, w.accessory
            ),
        }
    }
}

/// Scoring interface mapping a mission query and an attribute set to a
/// confidence in `[0, 1]`. Implementations live outside the core so a
/// deployment can choose its policy at wiring time.
pub trait MatchPolicy: Send + Sync {
    /// Static identifier of the policy implementation.
    fn kind(&self) -> &'static str;

    /// Confidence that `attrs` satisfies `query`.
    fn score(&self, query: &str, attrs: &AttributeSet) -> f32;
}

/// Policy that matches nothing; the default until a real policy is wired.
#[derive(Debug, Default)]
pub struct NullMatcher;

impl MatchPolicy for NullMatcher {
    fn kind(&self) -> &'static str {
        "score.null"
    }

    fn score(&self, _query: &str, _attrs: &AttributeSet) -> f32 {
        0.0
    }
}

/// Process-wide mission text. One logical writer; read by every perception
/// pass each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionPrompt {
    text: String,
}

impl MissionPrompt {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Replace the mission text. `None` normalizes to the empty string.
    pub fn set(&mut self, text: Option<&str>) {
        self.text = text.unwrap_or_default().to_string();
    }

    /// Current mission text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl Default for MissionPrompt {
    fn default() -> Self {
        Self::new(DEFAULT_MISSION_QUERY)
    }
}

/// Axis-aligned screen-space rectangle in device pixels, `y` from the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ScreenRect {
    /// Center of the rectangle.
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width * 0.5, self.y + self.height * 0.5)
    }
}

/// One perception result, rebuilt from scratch every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub confidence: f32,
    pub bounds: ScreenRect,
}

/// A detectable person: world pose, projection extent, and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub position: Vec3,
    pub half_extents: Vec3,
    pub attributes: AttributeSet,
}

/// Registry of describable persons with stable handles; replaces any
/// engine-wide reflective lookup.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersonArena {
    persons: SlotMap<PersonId, PersonRecord>,
}

impl PersonArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered persons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.persons.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    /// Register a person, returning its handle.
    pub fn insert(&mut self, record: PersonRecord) -> PersonId {
        self.persons.insert(record)
    }

    /// Remove a person by handle, returning its last known record.
    pub fn remove(&mut self, id: PersonId) -> Option<PersonRecord> {
        self.persons.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: PersonId) -> bool {
        self.persons.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: PersonId) -> Option<&PersonRecord> {
        self.persons.get(id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: PersonId) -> Option<&mut PersonRecord> {
        self.persons.get_mut(id)
    }

    /// Iterate persons in the arena's stable slot order. Scans that resolve
    /// score ties rely on this order staying fixed between calls.
    pub fn iter(&self) -> impl Iterator<Item = (PersonId, &PersonRecord)> {
        self.persons.iter()
    }

    /// Persons whose position lies within `radius` of `center`.
    pub fn within_radius(
        &self,
        center: Vec3,
        radius: f32,
    ) -> impl Iterator<Item = (PersonId, &PersonRecord)> {
        let radius_sq = radius * radius;
        self.persons
            .iter()
            .filter(move |(_, p)| p.position.distance_squared(center) <= radius_sq)
    }
}

/// One row of the population report: a description and how many persons
/// share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationGroup {
    pub description: String,
    pub count: usize,
}

/// Errors raised while seeding a population.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PopulationError {
    /// More persons requested than distinct indexed-wardrobe combinations.
    #[error("requested {requested} persons but only {available} distinct wardrobe combinations exist")]
    ExceedsCombinations { requested: usize, available: usize },
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Rectangular region on the ground plane, axes aligned with world X/Z.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaBounds {
    pub min: Vec2,
    pub max: Vec2,
}

impl AreaBounds {
    #[must_use]
    pub const fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Extent along X and Z.
    #[must_use]
    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }

    /// Midpoint of the region.
    #[must_use]
    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    fn is_valid(&self) -> bool {
        self.min.x < self.max.x && self.min.y < self.max.y
    }

    fn random_point_inset(&self, rng: &mut SmallRng, margin: f32) -> Vec2 {
        Vec2::new(
            rng.random_range(self.min.x + margin..self.max.x - margin),
            rng.random_range(self.min.y + margin..self.max.y - margin),
        )
    }
}

/// Which encoding freshly spawned populations receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttributeEncoding {
    #[default]
    Categorical,
    Indexed,
}

/// Catalog sizes for the indexed wardrobe encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WardrobeCatalog {
    pub materials: u8,
    pub hats: u8,
    pub accessories: u8,
}

impl WardrobeCatalog {
    /// Number of distinct attribute combinations the catalog can produce.
    #[must_use]
    pub fn combinations(&self) -> usize {
        self.materials as usize * self.hats as usize * self.accessories as usize
    }
}

impl Default for WardrobeCatalog {
    fn default() -> Self {
        Self {
            materials: 3,
            hats: 3,
            accessories: 3,
        }
    }
}

/// Patrol strategy executed while no target is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PatrolMode {
    /// Ping-pong between two waypoints.
    #[default]
    FixedRoute,
    /// Pick a fresh random destination on a timer or on arrival.
    RandomWander,
}

/// Per-drone perception tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerceptionSettings {
    /// Maximum range of the per-tick detection pass, in meters.
    pub detection_radius: f32,
    /// Full view-cone angle, in degrees.
    pub fov_degrees: f32,
    /// Detections scoring below this confidence are dropped.
    pub confidence_threshold: f32,
    /// Scene layers that block line of sight.
    pub occluder_mask: LayerMask,
    /// Disabled drones never poll for targets and patrol indefinitely.
    pub detection_enabled: bool,
}

impl Default for PerceptionSettings {
    fn default() -> Self {
        Self {
            detection_radius: 120.0,
            fov_degrees: 80.0,
            confidence_threshold: 0.30,
            occluder_mask: LayerMask::OBSTACLE,
            detection_enabled: true,
        }
    }
}

/// Pose of the perception camera relative to the drone body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraRig {
    /// Offset along the drone's flat heading direction.
    pub forward_offset: f32,
    /// Offset straight up from the body center (negative mounts below).
    pub height_offset: f32,
    /// Downward tilt of the camera, in degrees.
    pub pitch_degrees: f32,
    /// Vertical field of view of the projection, in degrees.
    pub fov_y_degrees: f32,
}

impl Default for CameraRig {
    fn default() -> Self {
        Self {
            forward_offset: 0.4,
            height_offset: -0.1,
            pitch_degrees: 25.0,
            fov_y_degrees: 60.0,
        }
    }
}

/// Flight controller tuning. Defaults mirror the observed field values; the
/// divergent speed/radius variants found in deployments are plain config
/// here rather than compile-time choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightConfig {
    /// Cruise elevation above locally sensed ground, in meters.
    pub cruise_height: f32,
    pub ascend_speed: f32,
    pub cruise_speed: f32,
    pub descend_speed: f32,
    /// Heading interpolation rate, in radians-equivalent per second.
    pub turn_rate: f32,
    /// Horizontal distance from the target at which the drone touches down.
    pub landing_offset: f32,
    pub height_tolerance: f32,
    pub position_tolerance: f32,
    /// Horizontal slack around the over-target point that triggers landing.
    pub approach_tolerance: f32,
    /// While farther than this from the landing point, keep cruise elevation.
    pub land_horizontal_slack: f32,
    /// Seconds between target polls while patrolling.
    pub retarget_interval: f32,
    pub patrol_mode: PatrolMode,
    /// Explicit ping-pong waypoints (X/Z); otherwise derived from the area.
    pub route_points: Option<(Vec2, Vec2)>,
    /// Derive the fixed route from the longer axis of the patrol area.
    pub prefer_longer_axis: bool,
    /// Wander circle radius used when no patrol area is configured.
    pub wander_radius: f32,
    /// Seconds between wander destination changes.
    pub wander_interval: f32,
    /// Inset from patrol-area edges for routes and wander destinations.
    pub patrol_margin: f32,
    /// Scene layers treated as ground by downward probes.
    pub ground_mask: LayerMask,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            cruise_height: 12.0,
            ascend_speed: 4.0,
            cruise_speed: 120.0,
            descend_speed: 3.5,
            turn_rate: 6.0,
            landing_offset: 1.8,
            height_tolerance: 0.15,
            position_tolerance: 0.25,
            approach_tolerance: 0.8,
            land_horizontal_slack: 0.5,
            retarget_interval: 0.3,
            patrol_mode: PatrolMode::FixedRoute,
            route_points: None,
            prefer_longer_axis: true,
            wander_radius: 40.0,
            wander_interval: 5.0,
            patrol_margin: 2.0,
            ground_mask: LayerMask::GROUND,
        }
    }
}

/// Cross-drone arbitration settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    pub enabled: bool,
    /// Seconds between reassessment cycles, floor-clamped at runtime.
    pub reassess_interval: f32,
    /// Also publish entries for drones whose detection is disabled.
    pub include_inactive: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reassess_interval: 0.5,
            include_inactive: true,
        }
    }
}

/// Errors raised when building a world from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a Skysweep world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkysweepConfig {
    /// Fixed timestep advanced by every [`WorldState::step`] call.
    pub tick_seconds: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Mission text applied at construction.
    pub mission_query: String,
    /// Device-pixel surface shared by every drone camera.
    pub viewport: Viewport,
    pub perception: PerceptionSettings,
    pub flight: FlightConfig,
    pub camera: CameraRig,
    pub coordinator: CoordinatorSettings,
    /// Bounded region drones patrol; `None` falls back to routes/circles
    /// around each drone's origin.
    pub patrol_area: Option<AreaBounds>,
    /// Region populations are seeded into.
    pub spawn_area: AreaBounds,
    pub catalog: WardrobeCatalog,
    /// Projection extent of a person, as half-sizes about its position.
    pub person_half_extents: Vec3,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for SkysweepConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 0.02,
            rng_seed: None,
            mission_query: DEFAULT_MISSION_QUERY.to_string(),
            viewport: Viewport::default(),
            perception: PerceptionSettings::default(),
            flight: FlightConfig::default(),
            camera: CameraRig::default(),
            coordinator: CoordinatorSettings::default(),
            patrol_area: Some(AreaBounds::new(Vec2::splat(-60.0), Vec2::splat(60.0))),
            spawn_area: AreaBounds::new(Vec2::splat(-60.0), Vec2::splat(60.0)),
            catalog: WardrobeCatalog::default(),
            person_half_extents: Vec3::new(0.4, 0.9, 0.3),
            history_capacity: 256,
        }
    }
}

impl SkysweepConfig {
    /// Validate every tunable before a world is built from this config.
    fn validate(&self) -> Result<(), WorldStateError> {
        if self.tick_seconds <= 0.0 {
            return Err(WorldStateError::InvalidConfig(
                "tick_seconds must be positive",
            ));
        }
        if self.viewport.width <= 0.0 || self.viewport.height <= 0.0 {
            return Err(WorldStateError::InvalidConfig(
                "viewport dimensions must be positive",
            ));
        }
        if self.perception.detection_radius <= 0.0 {
            return Err(WorldStateError::InvalidConfig(
                "detection_radius must be positive",
            ));
        }
        if self.perception.fov_degrees <= 0.0 || self.perception.fov_degrees >= 180.0 {
            return Err(WorldStateError::InvalidConfig(
                "fov_degrees must lie strictly between 0 and 180",
            ));
        }
        if !(0.0..=1.0).contains(&self.perception.confidence_threshold) {
            return Err(WorldStateError::InvalidConfig(
                "confidence_threshold must lie in [0, 1]",
            ));
        }
        if self.camera.fov_y_degrees <= 0.0 || self.camera.fov_y_degrees >= 180.0 {
            return Err(WorldStateError::InvalidConfig(
                "camera fov_y_degrees must lie strictly between 0 and 180",
            ));
        }
        let flight = &self.flight;
        if flight.cruise_height <= 0.0
            || flight.ascend_speed <= 0.0
            || flight.cruise_speed <= 0.0
            || flight.descend_speed <= 0.0
            || flight.turn_rate <= 0.0
        {
            return Err(WorldStateError::InvalidConfig(
                "flight heights, speeds, and turn rate must be positive",
            ));
        }
        if flight.landing_offset < 0.0 {
            return Err(WorldStateError::InvalidConfig(
                "landing_offset must be non-negative",
            ));
        }
        if flight.height_tolerance <= 0.0
            || flight.position_tolerance <= 0.0
            || flight.approach_tolerance <= 0.0
            || flight.land_horizontal_slack <= 0.0
        {
            return Err(WorldStateError::InvalidConfig(
                "flight tolerances must be positive",
            ));
        }
        if flight.retarget_interval <= 0.0
            || flight.wander_radius <= 0.0
            || flight.wander_interval <= 0.0
            || flight.patrol_margin < 0.0
        {
            return Err(WorldStateError::InvalidConfig(
                "patrol intervals and radii must be positive, margin non-negative",
            ));
        }
        if self.coordinator.reassess_interval < 0.0 {
            return Err(WorldStateError::InvalidConfig(
                "reassess_interval must be non-negative",
            ));
        }
        if !self.spawn_area.is_valid() {
            return Err(WorldStateError::InvalidConfig(
                "spawn_area must have positive extent",
            ));
        }
        if let Some(area) = &self.patrol_area {
            if !area.is_valid() {
                return Err(WorldStateError::InvalidConfig(
                    "patrol_area must have positive extent",
                ));
            }
            let size = area.size();
            if size.x <= 2.0 * flight.patrol_margin || size.y <= 2.0 * flight.patrol_margin {
                return Err(WorldStateError::InvalidConfig(
                    "patrol_area must be wider than twice the patrol margin",
                ));
            }
        }
        if self.catalog.materials == 0 || self.catalog.hats == 0 || self.catalog.accessories == 0 {
            return Err(WorldStateError::InvalidConfig(
                "wardrobe catalog sizes must be non-zero",
            ));
        }
        if self.person_half_extents.min_element() <= 0.0 {
            return Err(WorldStateError::InvalidConfig(
                "person_half_extents must be positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldStateError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Flight controller phase. Strictly sequential except Patrol and Approach,
/// which re-enter each other in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlightState {
    #[default]
    Idle,
    Takeoff,
    Patrol,
    Approach,
    Land,
    Landed,
}

/// Full per-drone state: body pose, flight phase, perception output, and the
/// tuning the drone was spawned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneState {
    pub position: Vec3,
    /// Yaw about the world Y axis, in radians.
    pub heading: f32,
    pub state: FlightState,
    pub flight: FlightConfig,
    pub perception: PerceptionSettings,
    pub camera: CameraRig,
    /// Detections from the most recent perception pass.
    pub detections: Vec<Detection>,
    /// Target the controller is currently committed to, if any.
    pub target: Option<PersonId>,
    origin: Vec3,
    ground_elevation: f32,
    cruise_elevation: f32,
    route: [Vec3; 2],
    route_index: usize,
    wander_target: Vec3,
    last_wander_change: f64,
    landing_point: Vec3,
    last_poll: f64,
}

struct FlightCtx<'a> {
    scene: &'a dyn SceneQuery,
    persons: &'a PersonArena,
    matcher: &'a dyn MatchPolicy,
    query: &'a str,
    assigned: Option<PersonId>,
    patrol_area: Option<&'a AreaBounds>,
    now: f64,
    dt: f32,
}

impl DroneState {
    fn new(origin: Vec3, config: &SkysweepConfig) -> Self {
        Self {
            position: origin,
            heading: 0.0,
            state: FlightState::Idle,
            flight: config.flight.clone(),
            perception: config.perception,
            camera: config.camera,
            detections: Vec::new(),
            target: None,
            origin,
            ground_elevation: origin.y,
            cruise_elevation: origin.y + config.flight.cruise_height,
            route: [origin; 2],
            route_index: 0,
            wander_target: origin,
            last_wander_change: f64::NEG_INFINITY,
            landing_point: origin,
            last_poll: f64::NEG_INFINITY,
        }
    }

    /// Launch position.
    #[must_use]
    pub const fn origin(&self) -> Vec3 {
        self.origin
    }

    /// Terrain elevation sensed below the launch point.
    #[must_use]
    pub const fn ground_elevation(&self) -> f32 {
        self.ground_elevation
    }

    /// Flight elevation used for takeoff, patrol, and approach.
    #[must_use]
    pub const fn cruise_elevation(&self) -> f32 {
        self.cruise_elevation
    }

    /// Point the drone descends onto once Land is entered.
    #[must_use]
    pub const fn landing_point(&self) -> Vec3 {
        self.landing_point
    }

    /// Current ping-pong waypoints.
    #[must_use]
    pub const fn route(&self) -> [Vec3; 2] {
        self.route
    }

    /// Perception camera for the drone's current pose.
    #[must_use]
    pub fn camera_view(&self, viewport: Viewport) -> PinholeCamera {
        let flat = Vec3::new(self.heading.cos(), 0.0, self.heading.sin());
        let position =
            self.position + Vec3::Y * self.camera.height_offset + flat * self.camera.forward_offset;
        let pitch = self.camera.pitch_degrees.to_radians();
        let forward = Vec3::new(
            pitch.cos() * self.heading.cos(),
            -pitch.sin(),
            pitch.cos() * self.heading.sin(),
        );
        PinholeCamera::new(position, forward, self.camera.fov_y_degrees, viewport)
    }

    fn configure_route(&mut self, area: Option<&AreaBounds>) {
        let y = self.cruise_elevation;
        if let Some((a, b)) = self.flight.route_points {
            self.route = [Vec3::new(a.x, y, a.y), Vec3::new(b.x, y, b.y)];
            return;
        }
        if let Some(area) = area {
            let center = area.center();
            let half = area.size() * 0.5;
            let margin = self.flight.patrol_margin;
            let use_x = !self.flight.prefer_longer_axis || half.x >= half.y;
            self.route = if use_x {
                [
                    Vec3::new(center.x - (half.x - margin), y, center.y),
                    Vec3::new(center.x + (half.x - margin), y, center.y),
                ]
            } else {
                [
                    Vec3::new(center.x, y, center.y - (half.y - margin)),
                    Vec3::new(center.x, y, center.y + (half.y - margin)),
                ]
            };
            return;
        }
        self.route = [
            Vec3::new(self.origin.x - 20.0, y, self.origin.z),
            Vec3::new(self.origin.x + 20.0, y, self.origin.z),
        ];
    }

    fn pick_wander_target(&mut self, area: Option<&AreaBounds>, rng: &mut SmallRng, now: f64) {
        let y = self.cruise_elevation;
        self.wander_target = if let Some(area) = area {
            let point = area.random_point_inset(rng, self.flight.patrol_margin);
            Vec3::new(point.x, y, point.y)
        } else {
            let radius = self.flight.wander_radius.max(1.0) * rng.random::<f32>().sqrt();
            let angle = rng.random_range(0.0..FULL_TURN);
            Vec3::new(
                self.origin.x + radius * angle.cos(),
                y,
                self.origin.z + radius * angle.sin(),
            )
        };
        self.last_wander_change = now;
    }

    /// Capped straight-line step toward `destination`, interpolating the
    /// heading toward the horizontal component of the motion.
    fn move_toward(&mut self, destination: Vec3, speed: f32, dt: f32) {
        let delta = destination - self.position;
        let distance = delta.length();
        let step = speed * dt;
        if distance <= step {
            self.position = destination;
        } else if distance > f32::EPSILON {
            self.position += delta * (step / distance);
        }

        let flat = Vec3::new(delta.x, 0.0, delta.z);
        if flat.length_squared() > 1e-4 {
            let desired = flat.z.atan2(flat.x);
            let blend = (self.flight.turn_rate * dt).min(1.0);
            self.heading =
                wrap_signed_angle(self.heading + wrap_signed_angle(desired - self.heading) * blend);
        }
    }

    fn tick_takeoff(&mut self, ctx: &FlightCtx<'_>) {
        let destination = Vec3::new(self.position.x, self.cruise_elevation, self.position.z);
        self.move_toward(destination, self.flight.ascend_speed, ctx.dt);
        if (self.position.y - self.cruise_elevation).abs() <= self.flight.height_tolerance {
            self.state = if self.target.is_some() {
                FlightState::Approach
            } else {
                FlightState::Patrol
            };
        }
    }

    fn tick_patrol(&mut self, ctx: &FlightCtx<'_>, rng: &mut SmallRng) {
        match self.flight.patrol_mode {
            PatrolMode::FixedRoute => {
                let waypoint = self.route[self.route_index];
                let waypoint = Vec3::new(waypoint.x, self.cruise_elevation, waypoint.z);
                self.move_toward(waypoint, self.flight.cruise_speed, ctx.dt);
                if horizontal_distance(self.position, waypoint) <= self.flight.position_tolerance {
                    self.route_index = 1 - self.route_index;
                }
            }
            PatrolMode::RandomWander => {
                let elapsed = ctx.now - self.last_wander_change >= f64::from(self.flight.wander_interval);
                let arrived = horizontal_distance(self.position, self.wander_target)
                    <= self.flight.position_tolerance;
                if elapsed || arrived {
                    self.pick_wander_target(ctx.patrol_area, rng, ctx.now);
                }
                let destination =
                    Vec3::new(self.wander_target.x, self.cruise_elevation, self.wander_target.z);
                self.move_toward(destination, self.flight.cruise_speed, ctx.dt);
            }
        }
    }

    /// Patrol-time target poll. The coordinator's published assignment wins
    /// when one exists; otherwise the drone re-runs its own global best-match
    /// so it keeps working with the coordinator disabled.
    fn poll_for_target(&mut self, ctx: &FlightCtx<'_>) {
        if !self.perception.detection_enabled {
            return;
        }
        if ctx.now - self.last_poll < f64::from(self.flight.retarget_interval) {
            return;
        }
        self.last_poll = ctx.now;

        let assigned = ctx.assigned.filter(|id| ctx.persons.contains(*id));
        let found = assigned.or_else(|| {
            best_match(
                ctx.persons,
                ctx.matcher,
                ctx.query,
                self.perception.confidence_threshold,
            )
            .map(|(id, _)| id)
        });
        if let Some(id) = found {
            self.target = Some(id);
            self.state = FlightState::Approach;
        }
    }

    fn tick_approach(&mut self, ctx: &FlightCtx<'_>, rng: &mut SmallRng) {
        let Some(person) = self.target.and_then(|id| ctx.persons.get(id)) else {
            self.target = None;
            self.state = FlightState::Patrol;
            return;
        };
        let target_position = person.position;
        let over = Vec3::new(target_position.x, self.cruise_elevation, target_position.z);
        self.move_toward(over, self.flight.cruise_speed, ctx.dt);

        if horizontal_distance(self.position, over) <= self.flight.approach_tolerance {
            let mut direction = self.position - over;
            direction.y = 0.0;
            if direction.length_squared() < 0.01 {
                let angle = rng.random_range(0.0..FULL_TURN);
                direction = Vec3::new(angle.cos(), 0.0, angle.sin());
            }
            let direction = direction.normalize();
            let candidate = target_position + direction * self.flight.landing_offset;

            let probe = candidate + Vec3::Y * LANDING_PROBE_HEIGHT;
            self.landing_point = match ctx.scene.raycast(
                probe,
                Vec3::NEG_Y,
                LANDING_PROBE_RANGE,
                self.flight.ground_mask,
            ) {
                Some(hit) => hit.point,
                None => Vec3::new(candidate.x, self.ground_elevation, candidate.z),
            };
            self.state = FlightState::Land;
        }
    }

    fn tick_land(&mut self, ctx: &FlightCtx<'_>) -> bool {
        let destination = self.landing_point;
        let over = Vec3::new(destination.x, self.cruise_elevation, destination.z);

        if horizontal_distance(self.position, destination) > self.flight.land_horizontal_slack {
            self.move_toward(over, self.flight.cruise_speed, ctx.dt);
        } else {
            self.move_toward(destination, self.flight.descend_speed, ctx.dt);
        }

        if self.position.distance(destination) <= self.flight.position_tolerance + 0.05 {
            self.state = FlightState::Landed;
            return true;
        }
        false
    }

    fn advance(&mut self, ctx: &FlightCtx<'_>, rng: &mut SmallRng) -> bool {
        match self.state {
            FlightState::Idle | FlightState::Landed => false,
            FlightState::Takeoff => {
                self.tick_takeoff(ctx);
                false
            }
            FlightState::Patrol => {
                self.tick_patrol(ctx, rng);
                self.poll_for_target(ctx);
                false
            }
            FlightState::Approach => {
                self.tick_approach(ctx, rng);
                false
            }
            FlightState::Land => self.tick_land(ctx),
        }
    }
}

/// Whole-arena best match: strictly highest score at or above `threshold`.
/// Ties keep the first-seen maximum in the arena's stable iteration order.
fn best_match(
    persons: &PersonArena,
    matcher: &dyn MatchPolicy,
    query: &str,
    threshold: f32,
) -> Option<(PersonId, f32)> {
    let mut best: Option<(PersonId, f32)> = None;
    for (id, person) in persons.iter() {
        let score = matcher.score(query, &person.attributes);
        if score < threshold {
            continue;
        }
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((id, score));
        }
    }
    best
}

fn detect_into(
    out: &mut Vec<Detection>,
    drone: &DroneState,
    viewport: Viewport,
    scene: &dyn SceneQuery,
    persons: &PersonArena,
    matcher: &dyn MatchPolicy,
    query: &str,
) {
    let camera = drone.camera_view(viewport);
    let half_fov = drone.perception.fov_degrees * 0.5;
    let threshold = drone.perception.confidence_threshold;

    for (_, person) in persons.within_radius(drone.position, drone.perception.detection_radius) {
        let to_target = person.position - camera.position();
        if angle_between_degrees(camera.forward(), to_target) > half_fov {
            continue;
        }

        let distance = to_target.length();
        if distance > f32::EPSILON
            && let Some(hit) = scene.raycast(
                camera.position(),
                to_target / distance,
                distance,
                drone.perception.occluder_mask,
            )
            && hit.distance < distance
        {
            continue;
        }

        let score = matcher.score(query, &person.attributes);
        if score < threshold {
            continue;
        }

        let Some(bounds) = project_extent(&camera, person) else {
            continue;
        };
        out.push(Detection {
            confidence: score.clamp(0.0, 1.0),
            bounds,
        });
    }
}

/// Screen-space bound of all eight extent corners. `None` when any corner is
/// behind the camera or the resulting rectangle is degenerate.
fn project_extent(camera: &PinholeCamera, person: &PersonRecord) -> Option<ScreenRect> {
    let mut min_x = f32::INFINITY;
    let mut min_y = f32::INFINITY;
    let mut max_x = f32::NEG_INFINITY;
    let mut max_y = f32::NEG_INFINITY;

    for xi in [-1.0, 1.0] {
        for yi in [-1.0, 1.0] {
            for zi in [-1.0, 1.0] {
                let corner =
                    person.position + person.half_extents * Vec3::new(xi, yi, zi);
                let screen = camera.world_to_screen(corner)?;
                min_x = min_x.min(screen.x);
                max_x = max_x.max(screen.x);
                min_y = min_y.min(screen.y);
                max_y = max_y.max(screen.y);
            }
        }
    }

    let width = max_x - min_x;
    let height = max_y - min_y;
    if width <= MIN_BOX_PIXELS || height <= MIN_BOX_PIXELS {
        return None;
    }
    Some(ScreenRect {
        x: min_x,
        y: min_y,
        width,
        height,
    })
}

/// Advisory cross-drone target arbiter.
#[derive(Debug)]
pub struct Coordinator {
    settings: CoordinatorSettings,
    last_reassess: f64,
    assignments: DroneMap<Option<PersonId>>,
}

impl Coordinator {
    fn new(settings: CoordinatorSettings) -> Self {
        Self {
            settings,
            last_reassess: f64::NEG_INFINITY,
            assignments: SecondaryMap::new(),
        }
    }

    /// Published drone-to-target map from the most recent cycle.
    #[must_use]
    pub fn assignments(&self) -> &DroneMap<Option<PersonId>> {
        &self.assignments
    }

    /// Current settings.
    #[must_use]
    pub const fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    fn due(&self, now: f64) -> bool {
        let interval = f64::from(self.settings.reassess_interval.max(MIN_REASSESS_INTERVAL));
        now - self.last_reassess >= interval
    }

    /// Rebuild the assignment map wholesale: one independent best-match per
    /// drone, duplicate targets resolved in favor of the closest contender.
    fn reassess(
        &mut self,
        drones: &SlotMap<DroneId, DroneState>,
        persons: &PersonArena,
        matcher: &dyn MatchPolicy,
        query: &str,
        now: f64,
    ) {
        self.last_reassess = now;

        let mut next: DroneMap<Option<PersonId>> = SecondaryMap::new();
        let mut groups: HashMap<PersonId, Vec<DroneId>> = HashMap::new();

        for (id, drone) in drones {
            if !drone.perception.detection_enabled && !self.settings.include_inactive {
                continue;
            }
            next.insert(id, None);
            if !drone.perception.detection_enabled {
                continue;
            }
            let proposal = best_match(
                persons,
                matcher,
                query,
                drone.perception.confidence_threshold,
            );
            if let Some((person, _)) = proposal
                && persons.contains(person)
            {
                groups.entry(person).or_default().push(id);
            }
        }

        for (person, contenders) in groups {
            let Some(record) = persons.get(person) else {
                continue;
            };
            let winner = contenders
                .iter()
                .copied()
                .min_by_key(|id| OrderedFloat(drones[*id].position.distance(record.position)));
            if let Some(winner) = winner {
                next.insert(winner, Some(person));
            }
        }

        self.assignments = next;
    }
}

/// One published assignment row, for external visualizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEntry {
    pub drone: DroneId,
    pub target: Option<PersonId>,
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    /// Whether the coordinator ran a reassessment cycle this tick.
    pub coordinator_cycled: bool,
    /// Number of drones that touched down this tick.
    pub landings: u32,
}

/// Aggregate counters sampled at the end of each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub drones: usize,
    pub patrolling: usize,
    pub approaching: usize,
    pub landed: usize,
    pub detections: usize,
    /// Drones holding a coordinator assignment.
    pub assigned: usize,
}

/// Aggregate world state: person registry, drone fleet, coordinator, and the
/// collaborators every stage consults.
pub struct WorldState {
    config: SkysweepConfig,
    tick: Tick,
    time: f64,
    rng: SmallRng,
    scene: Box<dyn SceneQuery>,
    matcher: Box<dyn MatchPolicy>,
    mission: MissionPrompt,
    persons: PersonArena,
    drones: SlotMap<DroneId, DroneState>,
    coordinator: Coordinator,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("tick", &self.tick)
            .field("drone_count", &self.drones.len())
            .field("person_count", &self.persons.len())
            .field("mission", &self.mission.text())
            .field("matcher", &self.matcher.kind())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a world with the default flat scene and the null matcher.
    pub fn new(config: SkysweepConfig) -> Result<Self, WorldStateError> {
        Self::with_matcher(config, Box::new(NullMatcher))
    }

    /// Instantiate a world with a concrete scoring policy.
    pub fn with_matcher(
        config: SkysweepConfig,
        matcher: Box<dyn MatchPolicy>,
    ) -> Result<Self, WorldStateError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let mission = MissionPrompt::new(config.mission_query.clone());
        let coordinator = Coordinator::new(config.coordinator);
        Ok(Self {
            config,
            tick: Tick::zero(),
            time: 0.0,
            rng,
            scene: Box::new(skysweep_scene::FlatScene::default()),
            matcher,
            mission,
            persons: PersonArena::new(),
            drones: SlotMap::with_key(),
            coordinator,
            history: VecDeque::new(),
        })
    }

    /// Replace the geometric collaborator.
    pub fn set_scene(&mut self, scene: Box<dyn SceneQuery>) {
        self.scene = scene;
    }

    /// Replace the scoring policy.
    pub fn set_matcher(&mut self, matcher: Box<dyn MatchPolicy>) {
        self.matcher = matcher;
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SkysweepConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Seconds of simulated time elapsed since boot.
    #[must_use]
    pub const fn sim_time(&self) -> f64 {
        self.time
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Replace the mission text for every perception pass in this world.
    /// `None` normalizes to the empty string.
    pub fn set_mission_query(&mut self, query: Option<&str>) {
        self.mission.set(query);
    }

    /// Current mission text.
    #[must_use]
    pub fn mission_query(&self) -> &str {
        self.mission.text()
    }

    /// Read-only access to the person registry.
    #[must_use]
    pub fn persons(&self) -> &PersonArena {
        &self.persons
    }

    /// Mutable access to the person registry.
    #[must_use]
    pub fn persons_mut(&mut self) -> &mut PersonArena {
        &mut self.persons
    }

    /// Register a person with an explicit attribute set (external spawner
    /// path). Its elevation is snapped to the ground below when terrain
    /// answers the probe.
    pub fn spawn_person(&mut self, position: Vec3, attributes: AttributeSet) -> PersonId {
        let probe = Vec3::new(position.x, position.y + GROUND_PROBE_HEIGHT, position.z);
        let grounded = self
            .scene
            .raycast(
                probe,
                Vec3::NEG_Y,
                GROUND_PROBE_RANGE,
                self.config.flight.ground_mask,
            )
            .map_or(position, |hit| Vec3::new(position.x, hit.point.y, position.z));
        self.persons.insert(PersonRecord {
            position: grounded,
            half_extents: self.config.person_half_extents,
            attributes,
        })
    }

    /// Seed `count` persons with randomized attributes at random positions
    /// inside the configured spawn area.
    pub fn spawn_population(
        &mut self,
        count: usize,
        encoding: AttributeEncoding,
    ) -> Result<Vec<PersonId>, PopulationError> {
        if encoding == AttributeEncoding::Indexed {
            let available = self.config.catalog.combinations();
            if count > available {
                return Err(PopulationError::ExceedsCombinations {
                    requested: count,
                    available,
                });
            }
        }

        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            let spot = self.config.spawn_area.random_point_inset(&mut self.rng, 0.0);
            let attributes = match encoding {
                AttributeEncoding::Categorical => AttributeSet::random_categorical(&mut self.rng),
                AttributeEncoding::Indexed => {
                    AttributeSet::random_indexed(&mut self.rng, &self.config.catalog)
                }
            };
            spawned.push(self.spawn_person(Vec3::new(spot.x, 0.0, spot.y), attributes));
        }
        Ok(spawned)
    }

    /// Remove a person from the registry. Drones committed to it fall back
    /// to Patrol on their next tick; the coordinator drops it next cycle.
    pub fn remove_person(&mut self, id: PersonId) -> Option<PersonRecord> {
        self.persons.remove(id)
    }

    /// Group the population by description, most common first.
    #[must_use]
    pub fn population_report(&self) -> Vec<PopulationGroup> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for (_, person) in self.persons.iter() {
            *counts.entry(person.attributes.describe()).or_default() += 1;
        }
        let mut groups: Vec<PopulationGroup> = counts
            .into_iter()
            .map(|(description, count)| PopulationGroup { description, count })
            .collect();
        groups.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.description.cmp(&b.description))
        });
        groups
    }

    /// Spawn a drone at `origin`, running the full launch sequence: ground
    /// probe, cruise elevation, patrol route, and one unconstrained
    /// best-match attempt. A successful attempt sends the drone straight
    /// into Approach; otherwise it takes off and patrols.
    pub fn spawn_drone(&mut self, origin: Vec3) -> DroneId {
        let mut drone = DroneState::new(origin, &self.config);

        let probe = origin + Vec3::Y * GROUND_PROBE_HEIGHT;
        drone.ground_elevation = self
            .scene
            .raycast(
                probe,
                Vec3::NEG_Y,
                GROUND_PROBE_RANGE,
                drone.flight.ground_mask,
            )
            .map_or(origin.y, |hit| hit.point.y);
        drone.cruise_elevation = drone.ground_elevation + drone.flight.cruise_height;

        drone.configure_route(self.config.patrol_area.as_ref());
        if drone.flight.patrol_mode == PatrolMode::RandomWander {
            drone.pick_wander_target(self.config.patrol_area.as_ref(), &mut self.rng, self.time);
        }

        if drone.perception.detection_enabled
            && let Some((person, _)) = best_match(
                &self.persons,
                &*self.matcher,
                self.mission.text(),
                drone.perception.confidence_threshold,
            )
        {
            drone.target = Some(person);
        }
        // A target acquired at launch skips the climb: Approach already flies
        // at cruise elevation.
        drone.state = if drone.target.is_some() {
            FlightState::Approach
        } else {
            FlightState::Takeoff
        };

        self.drones.insert(drone)
    }

    /// Remove a drone from the fleet.
    pub fn remove_drone(&mut self, id: DroneId) -> Option<DroneState> {
        self.drones.remove(id)
    }

    /// Number of live drones.
    #[must_use]
    pub fn drone_count(&self) -> usize {
        self.drones.len()
    }

    /// Borrow one drone's state.
    #[must_use]
    pub fn drone(&self, id: DroneId) -> Option<&DroneState> {
        self.drones.get(id)
    }

    /// Mutably borrow one drone's state.
    #[must_use]
    pub fn drone_mut(&mut self, id: DroneId) -> Option<&mut DroneState> {
        self.drones.get_mut(id)
    }

    /// Iterate the fleet with handles.
    pub fn drones(&self) -> impl Iterator<Item = (DroneId, &DroneState)> {
        self.drones.iter()
    }

    /// Published coordinator assignments from the most recent cycle.
    #[must_use]
    pub fn assignments(&self) -> &DroneMap<Option<PersonId>> {
        self.coordinator.assignments()
    }

    /// Serializable snapshot of the assignment map for external visualizers.
    #[must_use]
    pub fn assignment_snapshot(&self) -> Vec<AssignmentEntry> {
        self.coordinator
            .assignments()
            .iter()
            .map(|(drone, target)| AssignmentEntry {
                drone,
                target: *target,
            })
            .collect()
    }

    /// Unconstrained best match as seen from one drone's perception service:
    /// ignores FOV, occlusion, and radius. `min_confidence` overrides the
    /// drone's configured threshold when provided.
    #[must_use]
    pub fn find_best_match(&self, drone: DroneId, min_confidence: Option<f32>) -> Option<PersonId> {
        let drone = self.drones.get(drone)?;
        let threshold = min_confidence.unwrap_or(drone.perception.confidence_threshold);
        best_match(&self.persons, &*self.matcher, self.mission.text(), threshold)
            .map(|(id, _)| id)
    }

    /// Ground-plane point below the nearest qualifying detection: the ray
    /// through each detection's screen center is intersected with the
    /// horizontal plane at `plane_elevation`, skipping near-parallel rays
    /// and negative ray parameters.
    #[must_use]
    pub fn nearest_ground_point(
        &self,
        drone: DroneId,
        plane_elevation: f32,
        min_confidence: f32,
    ) -> Option<Vec3> {
        let drone = self.drones.get(drone)?;
        let floor = min_confidence.max(drone.perception.confidence_threshold);
        let camera = drone.camera_view(self.config.viewport);

        drone
            .detections
            .iter()
            .filter(|detection| detection.confidence >= floor)
            .filter_map(|detection| {
                let (cx, cy) = detection.bounds.center();
                let ray = camera.screen_to_world_ray(cx, cy);
                if ray.direction.y.abs() < RAY_PARALLEL_EPSILON {
                    return None;
                }
                let t = (plane_elevation - ray.origin.y) / ray.direction.y;
                if t <= 0.0 {
                    return None;
                }
                let hit = ray.origin + ray.direction * t;
                Some((OrderedFloat(drone.position.distance(hit)), hit))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, point)| point)
    }

    /// Detections from one drone's most recent perception pass.
    #[must_use]
    pub fn detections(&self, drone: DroneId) -> &[Detection] {
        self.drones
            .get(drone)
            .map_or(&[], |drone| drone.detections.as_slice())
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    fn stage_coordinator(&mut self) -> bool {
        if !self.coordinator.settings.enabled || !self.coordinator.due(self.time) {
            return false;
        }
        self.coordinator.reassess(
            &self.drones,
            &self.persons,
            &*self.matcher,
            self.mission.text(),
            self.time,
        );
        true
    }

    fn stage_perception(&mut self) {
        let scene = &*self.scene;
        let persons = &self.persons;
        let matcher = &*self.matcher;
        let query = self.mission.text();
        let viewport = self.config.viewport;

        for drone in self.drones.values_mut() {
            let mut detections = std::mem::take(&mut drone.detections);
            detections.clear();
            if drone.perception.detection_enabled {
                detect_into(
                    &mut detections,
                    drone,
                    viewport,
                    scene,
                    persons,
                    matcher,
                    query,
                );
            }
            drone.detections = detections;
        }
    }

    fn stage_flight(&mut self) -> u32 {
        let dt = self.config.tick_seconds;
        let now = self.time;
        let scene = &*self.scene;
        let persons = &self.persons;
        let matcher = &*self.matcher;
        let query = self.mission.text();
        let patrol_area = self.config.patrol_area.as_ref();
        let assignments = self.coordinator.assignments();
        let rng = &mut self.rng;

        let mut landings = 0;
        for (id, drone) in &mut self.drones {
            let ctx = FlightCtx {
                scene,
                persons,
                matcher,
                query,
                assigned: assignments.get(id).copied().flatten(),
                patrol_area,
                now,
                dt,
            };
            if drone.advance(&ctx, rng) {
                landings += 1;
            }
        }
        landings
    }

    fn stage_summary(&mut self, next_tick: Tick) {
        let mut summary = TickSummary {
            tick: next_tick,
            drones: self.drones.len(),
            patrolling: 0,
            approaching: 0,
            landed: 0,
            detections: 0,
            assigned: 0,
        };
        for drone in self.drones.values() {
            match drone.state {
                FlightState::Patrol => summary.patrolling += 1,
                FlightState::Approach | FlightState::Land => summary.approaching += 1,
                FlightState::Landed => summary.landed += 1,
                FlightState::Idle | FlightState::Takeoff => {}
            }
            summary.detections += drone.detections.len();
        }
        summary.assigned = self
            .coordinator
            .assignments()
            .iter()
            .filter(|(_, target)| target.is_some())
            .count();

        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Execute one fixed-timestep tick: coordinator at its cadence, then a
    /// perception pass and a flight-controller update for every drone.
    pub fn step(&mut self) -> TickEvents {
        let next_tick = self.tick.next();

        let coordinator_cycled = self.stage_coordinator();
        self.stage_perception();
        let landings = self.stage_flight();
        self.stage_summary(next_tick);

        self.tick = next_tick;
        self.time += f64::from(self.config.tick_seconds);

        TickEvents {
            tick: self.tick,
            coordinator_cycled,
            landings,
        }
    }
}
