use std::ops::{Add, Mul, Sub};

use glam::{Vec2, Vec3};

/// Arclength table resolution per control point.
const SAMPLES_PER_SEGMENT: usize = 16;

pub trait SplinePoint:
    Copy + Add<Output = Self> + Sub<Output = Self> + Mul<f32, Output = Self>
{
    const ZERO: Self;
    fn distance(self, other: Self) -> f32;
}

impl SplinePoint for Vec2 {
    const ZERO: Self = Vec2::ZERO;
    fn distance(self, other: Self) -> f32 {
        Vec2::distance(self, other)
    }
}

impl SplinePoint for Vec3 {
    const ZERO: Self = Vec3::ZERO;
    fn distance(self, other: Self) -> f32 {
        Vec3::distance(self, other)
    }
}

/// Closed uniform cubic B-spline. The parameter `t` covers the whole loop
/// over `[0, 1)` and wraps outside of it.
#[derive(Debug, Clone, PartialEq)]
pub struct BSpline<V> {
    points: Vec<V>,
    // cumulative arclength at t = i / (len - 1)
    lengths: Vec<f32>,
}

impl<V: SplinePoint> BSpline<V> {
    pub fn new(points: Vec<V>) -> Self {
        let mut spline = Self { points, lengths: Vec::new() };
        spline.rebuild_lengths();
        spline
    }

    pub fn control_points(&self) -> &[V] {
        &self.points
    }

    pub fn num_control_points(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn position(&self, t: f32) -> V {
        let n = self.points.len();
        if n == 0 {
            return V::ZERO;
        }
        let u = t.rem_euclid(1.0) * n as f32;
        let seg = (u.floor() as usize).min(n - 1);
        let s = u - seg as f32;

        let p0 = self.points[(seg + n - 1) % n];
        let p1 = self.points[seg];
        let p2 = self.points[(seg + 1) % n];
        let p3 = self.points[(seg + 2) % n];

        let s2 = s * s;
        let s3 = s2 * s;
        let b0 = (1.0 - s).powi(3) / 6.0;
        let b1 = (3.0 * s3 - 6.0 * s2 + 4.0) / 6.0;
        let b2 = (-3.0 * s3 + 3.0 * s2 + 3.0 * s + 1.0) / 6.0;
        let b3 = s3 / 6.0;
        p0 * b0 + p1 * b1 + p2 * b2 + p3 * b3
    }

    pub fn length(&self) -> f32 {
        self.lengths.last().copied().unwrap_or(0.0)
    }

    /// Arclength between two parameters in `[0, 1]`.
    pub fn length_between(&self, t0: f32, t1: f32) -> f32 {
        (self.length_at(t1) - self.length_at(t0)).abs()
    }

    /// Parameter at which the accumulated arclength reaches `length`.
    pub fn time_at_length(&self, length: f32) -> f32 {
        let total = self.length();
        if total <= 0.0 || self.lengths.len() < 2 {
            return 0.0;
        }
        let target = length.clamp(0.0, total);
        let i = self.lengths.partition_point(|&l| l < target).clamp(1, self.lengths.len() - 1);
        let (l0, l1) = (self.lengths[i - 1], self.lengths[i]);
        let frac = if l1 > l0 { (target - l0) / (l1 - l0) } else { 0.0 };
        let step = 1.0 / (self.lengths.len() - 1) as f32;
        (i as f32 - 1.0 + frac) * step
    }

    fn length_at(&self, t: f32) -> f32 {
        if self.lengths.len() < 2 {
            return 0.0;
        }
        let x = t.clamp(0.0, 1.0) * (self.lengths.len() - 1) as f32;
        let i = (x.floor() as usize).min(self.lengths.len() - 2);
        let frac = x - i as f32;
        self.lengths[i] + (self.lengths[i + 1] - self.lengths[i]) * frac
    }

    fn rebuild_lengths(&mut self) {
        self.lengths.clear();
        if self.points.is_empty() {
            return;
        }
        let samples = self.points.len() * SAMPLES_PER_SEGMENT;
        let mut total = 0.0;
        let mut prev = self.position(0.0);
        self.lengths.push(0.0);
        for i in 1..=samples {
            let p = self.position(i as f32 / samples as f32);
            total += prev.distance(p);
            self.lengths.push(total);
            prev = p;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> BSpline<Vec2> {
        BSpline::new(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(10.0, 0.0),
            Vec2::new(10.0, 10.0),
            Vec2::new(0.0, 10.0),
        ])
    }

    #[test]
    fn closed_loop_wraps() {
        let s = square();
        assert!(s.position(0.0).distance(s.position(1.0)) < 1e-4);
        assert!(s.position(0.25).distance(s.position(1.25)) < 1e-4);
    }

    #[test]
    fn curve_stays_inside_control_hull() {
        let s = square();
        for i in 0..100 {
            let p = s.position(i as f32 / 100.0);
            assert!(p.x >= 0.0 && p.x <= 10.0 && p.y >= 0.0 && p.y <= 10.0);
        }
    }

    #[test]
    fn time_at_length_inverts_length() {
        let s = square();
        let total = s.length();
        assert!(total > 0.0 && total < 40.0);
        let t = s.time_at_length(total * 0.5);
        assert!((s.length_between(0.0, t) - total * 0.5).abs() < total * 0.01);
        assert_eq!(s.time_at_length(-5.0), 0.0);
    }
}
