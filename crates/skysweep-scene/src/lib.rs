//! Geometric scene queries backing Skysweep drone perception.
//!
//! The simulation core never talks to a physics engine: everything it needs
//! from the surrounding world is expressed here as synchronous queries
//! against a [`SceneQuery`] implementation plus a [`PinholeCamera`] for
//! screen-space projection.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 10_000.0;
const RAY_EPSILON: f32 = 1e-6;

/// Bit set of scene layers used to filter raycasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerMask(pub u32);

impl LayerMask {
    /// Matches nothing.
    pub const NONE: Self = Self(0);
    /// Terrain surface.
    pub const GROUND: Self = Self(1);
    /// Static obstacles (buildings, props) that block line of sight.
    pub const OBSTACLE: Self = Self(1 << 1);
    /// Matches every layer.
    pub const ALL: Self = Self(u32::MAX);

    /// Returns whether any layer is shared between the two masks.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Combine two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for LayerMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Half-line used for line-of-sight and ground queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

/// First intersection reported by a raycast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RayHit {
    pub point: Vec3,
    pub distance: f32,
}

/// Synchronous geometric queries consumed by the simulation core.
pub trait SceneQuery {
    /// Cast a ray and return the nearest hit on any layer in `mask`, if one
    /// exists within `max_distance`. Degenerate directions report no hit.
    fn raycast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        mask: LayerMask,
    ) -> Option<RayHit>;
}

/// Axis-aligned box occupying one scene layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub min: Vec3,
    pub max: Vec3,
    pub layer: LayerMask,
}

impl Obstacle {
    /// Construct an obstacle on the default [`LayerMask::OBSTACLE`] layer.
    #[must_use]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min,
            max,
            layer: LayerMask::OBSTACLE,
        }
    }

    /// Slab intersection against the box. Rays starting inside report no
    /// hit, matching the convention of the surrounding simulation substrate.
    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<f32> {
        let mut t_min = 0.0_f32;
        let mut t_max = max_distance;
        let mut entered = false;

        for axis in 0..3 {
            let o = origin[axis];
            let d = direction[axis];
            let lo = self.min[axis];
            let hi = self.max[axis];
            if d.abs() < RAY_EPSILON {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t0 = (lo - o) * inv;
            let mut t1 = (hi - o) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            if t0 > t_min {
                t_min = t0;
                entered = true;
            }
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }

        entered.then_some(t_min)
    }
}

/// Baseline scene: a horizontal ground plane plus axis-aligned occluders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlatScene {
    ground_elevation: f32,
    obstacles: Vec<Obstacle>,
}

impl FlatScene {
    /// Create a scene whose terrain is a plane at `ground_elevation`.
    #[must_use]
    pub fn new(ground_elevation: f32) -> Self {
        Self {
            ground_elevation,
            obstacles: Vec::new(),
        }
    }

    /// Elevation of the ground plane.
    #[must_use]
    pub const fn ground_elevation(&self) -> f32 {
        self.ground_elevation
    }

    /// Registered occluders.
    #[must_use]
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    /// Add an occluder to the scene.
    pub fn push_obstacle(&mut self, obstacle: Obstacle) {
        self.obstacles.push(obstacle);
    }

    fn ground_raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<f32> {
        if direction.y.abs() < RAY_EPSILON {
            return None;
        }
        let t = (self.ground_elevation - origin.y) / direction.y;
        (t >= 0.0 && t <= max_distance).then_some(t)
    }
}

impl SceneQuery for FlatScene {
    fn raycast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        mask: LayerMask,
    ) -> Option<RayHit> {
        let direction = direction.try_normalize()?;
        let mut nearest: Option<f32> = None;

        if mask.intersects(LayerMask::GROUND)
            && let Some(t) = self.ground_raycast(origin, direction, max_distance)
        {
            nearest = Some(t);
        }

        for obstacle in &self.obstacles {
            if !mask.intersects(obstacle.layer) {
                continue;
            }
            if let Some(t) = obstacle.raycast(origin, direction, max_distance)
                && nearest.is_none_or(|best| t < best)
            {
                nearest = Some(t);
            }
        }

        nearest.map(|distance| RayHit {
            point: origin + direction * distance,
            distance,
        })
    }
}

/// Device-pixel output surface of a drone camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    #[must_use]
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Width over height.
    #[must_use]
    pub fn aspect(&self) -> f32 {
        self.width / self.height.max(RAY_EPSILON)
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1920.0, 1080.0)
    }
}

/// Projected point in device pixels. `y` grows upward from the bottom edge;
/// `depth` is the distance along the camera's view axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f32,
    pub y: f32,
    pub depth: f32,
}

/// Perspective projection collaborator for one drone viewpoint.
#[derive(Debug, Clone, Copy)]
pub struct PinholeCamera {
    position: Vec3,
    forward: Vec3,
    viewport: Viewport,
    view_proj: Mat4,
    inverse_view_proj: Mat4,
}

impl PinholeCamera {
    /// Build a camera at `position` looking along `forward` with a vertical
    /// field of view of `fov_y_degrees`. A degenerate forward falls back to
    /// looking along -Z.
    #[must_use]
    pub fn new(position: Vec3, forward: Vec3, fov_y_degrees: f32, viewport: Viewport) -> Self {
        let forward = forward.try_normalize().unwrap_or(Vec3::NEG_Z);
        let up = if forward.y.abs() > 0.999 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let view = Mat4::look_at_rh(position, position + forward, up);
        let proj = Mat4::perspective_rh(
            fov_y_degrees.to_radians(),
            viewport.aspect(),
            Z_NEAR,
            Z_FAR,
        );
        let view_proj = proj * view;
        Self {
            position,
            forward,
            viewport,
            view_proj,
            inverse_view_proj: view_proj.inverse(),
        }
    }

    /// Camera position in world space.
    #[must_use]
    pub const fn position(&self) -> Vec3 {
        self.position
    }

    /// Unit view direction.
    #[must_use]
    pub const fn forward(&self) -> Vec3 {
        self.forward
    }

    /// Output surface in device pixels.
    #[must_use]
    pub const fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Project a world point to device pixels. Points at or behind the
    /// camera plane report `None`.
    #[must_use]
    pub fn world_to_screen(&self, point: Vec3) -> Option<ScreenPoint> {
        let clip = self.view_proj * point.extend(1.0);
        if clip.w <= RAY_EPSILON {
            return None;
        }
        let ndc_x = clip.x / clip.w;
        let ndc_y = clip.y / clip.w;
        Some(ScreenPoint {
            x: (ndc_x * 0.5 + 0.5) * self.viewport.width,
            y: (ndc_y * 0.5 + 0.5) * self.viewport.height,
            depth: clip.w,
        })
    }

    /// Ray from the camera through the given device-pixel coordinates.
    #[must_use]
    pub fn screen_to_world_ray(&self, x: f32, y: f32) -> Ray {
        let ndc_x = (x / self.viewport.width) * 2.0 - 1.0;
        let ndc_y = (y / self.viewport.height) * 2.0 - 1.0;
        let near = self.unproject(Vec4::new(ndc_x, ndc_y, 0.0, 1.0));
        let far = self.unproject(Vec4::new(ndc_x, ndc_y, 1.0, 1.0));
        let direction = (far - near).try_normalize().unwrap_or(self.forward);
        Ray {
            origin: self.position,
            direction,
        }
    }

    fn unproject(&self, ndc: Vec4) -> Vec3 {
        let world = self.inverse_view_proj * ndc;
        world.truncate() / world.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(min: Vec3, max: Vec3) -> Obstacle {
        Obstacle::new(min, max)
    }

    #[test]
    fn ground_raycast_respects_mask() {
        let scene = FlatScene::new(0.0);
        let origin = Vec3::new(0.0, 10.0, 0.0);

        let hit = scene
            .raycast(origin, Vec3::NEG_Y, 100.0, LayerMask::GROUND)
            .expect("ground hit");
        assert!((hit.distance - 10.0).abs() < 1e-4);
        assert!(hit.point.y.abs() < 1e-4);

        assert!(
            scene
                .raycast(origin, Vec3::NEG_Y, 100.0, LayerMask::OBSTACLE)
                .is_none()
        );
    }

    #[test]
    fn ground_raycast_ignores_parallel_rays() {
        let scene = FlatScene::new(0.0);
        let origin = Vec3::new(0.0, 5.0, 0.0);
        assert!(
            scene
                .raycast(origin, Vec3::X, 100.0, LayerMask::GROUND)
                .is_none()
        );
    }

    #[test]
    fn obstacle_raycast_returns_nearest_face() {
        let mut scene = FlatScene::new(0.0);
        scene.push_obstacle(boxed(Vec3::new(4.0, -1.0, -1.0), Vec3::new(6.0, 1.0, 1.0)));
        scene.push_obstacle(boxed(Vec3::new(8.0, -1.0, -1.0), Vec3::new(9.0, 1.0, 1.0)));

        let hit = scene
            .raycast(Vec3::ZERO, Vec3::X, 100.0, LayerMask::OBSTACLE)
            .expect("obstacle hit");
        assert!((hit.distance - 4.0).abs() < 1e-4);
    }

    #[test]
    fn raycast_from_inside_obstacle_misses() {
        let mut scene = FlatScene::new(-100.0);
        scene.push_obstacle(boxed(Vec3::splat(-2.0), Vec3::splat(2.0)));
        assert!(
            scene
                .raycast(Vec3::ZERO, Vec3::X, 100.0, LayerMask::OBSTACLE)
                .is_none()
        );
    }

    #[test]
    fn raycast_beyond_max_distance_misses() {
        let mut scene = FlatScene::new(0.0);
        scene.push_obstacle(boxed(Vec3::new(50.0, -1.0, -1.0), Vec3::new(51.0, 1.0, 1.0)));
        assert!(
            scene
                .raycast(Vec3::new(0.0, 0.5, 0.0), Vec3::X, 10.0, LayerMask::ALL)
                .is_none()
        );
    }

    #[test]
    fn projection_centers_points_on_the_view_axis() {
        let viewport = Viewport::new(800.0, 600.0);
        let camera = PinholeCamera::new(Vec3::ZERO, Vec3::X, 60.0, viewport);
        let screen = camera
            .world_to_screen(Vec3::new(20.0, 0.0, 0.0))
            .expect("projection");
        assert!((screen.x - 400.0).abs() < 1e-2);
        assert!((screen.y - 300.0).abs() < 1e-2);
        assert!((screen.depth - 20.0).abs() < 1e-3);
    }

    #[test]
    fn points_behind_camera_do_not_project() {
        let camera = PinholeCamera::new(Vec3::ZERO, Vec3::X, 60.0, Viewport::default());
        assert!(camera.world_to_screen(Vec3::new(-5.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn screen_ray_round_trips_through_projection() {
        let camera = PinholeCamera::new(
            Vec3::new(3.0, 8.0, -2.0),
            Vec3::new(0.4, -0.5, 0.77),
            70.0,
            Viewport::default(),
        );
        let world = Vec3::new(9.0, 1.5, 10.0);
        let screen = camera.world_to_screen(world).expect("projection");
        let ray = camera.screen_to_world_ray(screen.x, screen.y);

        let expected = (world - camera.position()).normalize();
        assert!(ray.direction.dot(expected) > 0.9999);
        assert!((ray.origin - camera.position()).length() < 1e-4);
    }

    #[test]
    fn straight_down_camera_uses_fallback_up_axis() {
        let camera = PinholeCamera::new(Vec3::new(0.0, 30.0, 0.0), Vec3::NEG_Y, 80.0, Viewport::default());
        let screen = camera
            .world_to_screen(Vec3::new(0.0, 0.0, 0.0))
            .expect("projection");
        assert!(screen.depth > 29.0);
        assert!(screen.x.is_finite() && screen.y.is_finite());
    }
}
