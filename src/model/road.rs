use std::f32::consts::TAU;

use glam::{Vec2, Vec3};

use super::channel::Channel;
use super::noise::{fbm1d, noise1d};
use super::spline::BSpline;
use crate::utils::Rect;

const ANGLE_STEP: f32 = 0.05;
const STRIP_STEP: f32 = 0.0025;
/// Parameter step used when seeding tile samples along the road.
pub const SAMPLE_STEP: f32 = 0.0005;

/// Plans the single closed road that loops around the terrain.
///
/// The 2D path is generated once, on the first heightmap, and then kept for
/// the rest of the session so regenerations only move it vertically.
#[derive(Debug, Clone, Default)]
pub struct RoadPathPlanner {
    spline: Option<BSpline<Vec2>>,
}

impl RoadPathPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spline(&self) -> Option<&BSpline<Vec2>> {
        self.spline.as_ref()
    }

    /// Returns the road, generating it on first use.
    pub fn ensure_spline(&mut self, size: f32, seed: f32) -> &BSpline<Vec2> {
        self.spline.get_or_insert_with(|| {
            let points = control_points(size, seed);
            tracing::debug!(points = points.len(), "generated road control points");
            BSpline::new(points)
        })
    }

    /// Triangle strip covering the road, in pixel space.
    pub fn strip(&self, size: f32, seed: f32) -> Vec<Vec2> {
        let Some(spline) = &self.spline else {
            return Vec::new();
        };
        let steps = (1.0 / STRIP_STEP).round() as usize;
        let scale = size / 512.0;
        let mut strip = Vec::with_capacity((steps + 1) * 2);
        for i in 0..=steps {
            let t = i as f32 * STRIP_STEP;
            let p = spline.position(t);
            let tangent = (spline.position(t + STRIP_STEP * 0.5) - p).normalize_or_zero();
            let normal = tangent.perp();
            let width = 1.0 + (noise1d(seed + i as f32 * 50.1) * 0.5 + 0.5) * scale;
            strip.push(p + normal * width);
            strip.push(p - normal * width);
        }
        strip
    }

    /// Road samples falling inside `area`, used to seed tile sampling so the
    /// mesh is dense along the road.
    pub fn samples_in(&self, area: &Rect) -> Vec<Vec2> {
        let Some(spline) = &self.spline else {
            return Vec::new();
        };
        let steps = (1.0 / SAMPLE_STEP).round() as usize;
        (0..steps)
            .map(|i| spline.position(i as f32 * SAMPLE_STEP))
            .filter(|p| area.contains(*p))
            .collect()
    }
}

/// Noisy circle around the terrain center.
pub fn control_points(size: f32, seed: f32) -> Vec<Vec2> {
    let center = Vec2::splat(size * 0.5);
    let radius = Vec2::splat(size).length() / 3.5;
    let mut points = Vec::new();
    let mut angle = 0.0f32;
    while angle < TAU {
        let jitter = fbm1d(angle * 2.0 + 123.456 + seed, 4) * 0.1;
        let dist = radius + (0.3 + 0.5 * fbm1d(angle * 1.25 + seed, 4)) * radius;
        let a = angle + jitter;
        points.push(center + 0.5 * dist * Vec2::new(a.cos(), a.sin()));
        angle += ANGLE_STEP;
    }
    points
}

/// Lifts the 2D road onto `heights`, leaving heights normalized.
pub fn snap_to_heights(road: &BSpline<Vec2>, heights: Option<&Channel>) -> BSpline<Vec3> {
    let points = road
        .control_points()
        .iter()
        .map(|p| {
            let h = heights.map_or(0.0, |c| c.get_value(*p));
            Vec3::new(p.x, h, p.y)
        })
        .collect();
    BSpline::new(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn road_is_generated_once() {
        let mut planner = RoadPathPlanner::new();
        let first = planner.ensure_spline(256.0, 0.0).clone();
        let second = planner.ensure_spline(256.0, 42.0).clone();
        assert_eq!(first, second);
        assert!(first.num_control_points() >= 4);
    }

    #[test]
    fn strip_is_rasterizable() {
        let mut planner = RoadPathPlanner::new();
        planner.ensure_spline(256.0, 0.0);
        let strip = planner.strip(256.0, 0.0);
        let mut mask = Channel::new(256, 256);
        mask.fill_strip(&strip, 1.0);
        let covered = mask.data().iter().filter(|v| **v > 0.0).count();
        assert!(covered > 100);
        // the center of the loop stays clear
        assert_eq!(mask.get(128, 128), 0.0);
    }

    #[test]
    fn snapping_reads_the_height_channel() {
        let mut planner = RoadPathPlanner::new();
        let road = planner.ensure_spline(64.0, 1.0).clone();
        let heights = Channel::from_fn(64, 64, |_, _| 0.25);
        let lifted = snap_to_heights(&road, Some(&heights));
        assert!(lifted.control_points().iter().all(|p| p.y == 0.25));
        let flat = snap_to_heights(&road, None);
        assert!(flat.control_points().iter().all(|p| p.y == 0.0));
    }
}
