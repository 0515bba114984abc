use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::utils::Rect;

/// Variable-spacing Poisson-disk sampler (Bridson's algorithm with a
/// bucketed grid, since spacing changes across the area).
#[derive(Debug, Clone)]
pub struct PoissonDisk {
    area: Rect,
    attempts: u32,
    cell: f32,
    seed: u64,
}

impl PoissonDisk {
    pub fn new(area: Rect, min_spacing: f32, max_spacing: f32) -> Self {
        Self {
            area,
            attempts: 30,
            cell: (min_spacing * 2.0).max(max_spacing / 16.0).max(1e-3),
            seed: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Grows a distribution from `initial`. `spacing` gives the minimum
    /// distance required around a candidate and `accept` rejects
    /// candidates outright. Initial points are kept unconditionally.
    pub fn sample(
        &self,
        initial: &[Vec2],
        spacing: impl Fn(Vec2) -> f32,
        accept: impl Fn(Vec2) -> bool,
    ) -> Vec<Vec2> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let size = self.area.size();
        if size.x <= 0.0 || size.y <= 0.0 {
            return Vec::new();
        }
        let mut grid = Grid::new(self.area, self.cell);
        let mut samples: Vec<Vec2> = Vec::new();
        let mut active: Vec<usize> = Vec::new();

        let seeds: Vec<Vec2> = if initial.is_empty() {
            vec![self.area.center()]
        } else {
            initial.to_vec()
        };
        for p in seeds {
            grid.insert(p, samples.len());
            active.push(samples.len());
            samples.push(p);
        }

        while !active.is_empty() {
            let slot = rng.gen_range(0..active.len());
            let origin = samples[active[slot]];
            let r = spacing(origin).max(1e-3);

            let mut found = None;
            for _ in 0..self.attempts {
                let angle = rng.gen_range(0.0..std::f32::consts::TAU);
                let dist = rng.gen_range(r..r * 2.0);
                let candidate = origin + Vec2::new(angle.cos(), angle.sin()) * dist;
                if !self.area.contains(candidate) || !accept(candidate) {
                    continue;
                }
                let rc = spacing(candidate).max(1e-3);
                if !grid.any_within(candidate, rc, &samples) {
                    found = Some(candidate);
                    break;
                }
            }

            match found {
                Some(p) => {
                    grid.insert(p, samples.len());
                    active.push(samples.len());
                    samples.push(p);
                }
                None => {
                    active.swap_remove(slot);
                }
            }
        }
        samples
    }
}

struct Grid {
    origin: Vec2,
    cell: f32,
    cols: i32,
    rows: i32,
    buckets: Vec<Vec<usize>>,
}

impl Grid {
    fn new(area: Rect, cell: f32) -> Self {
        let size = area.size();
        let cols = (size.x / cell).ceil().max(1.0) as i32;
        let rows = (size.y / cell).ceil().max(1.0) as i32;
        Self {
            origin: area.min,
            cell,
            cols,
            rows,
            buckets: vec![Vec::new(); (cols * rows) as usize],
        }
    }

    fn coords(&self, p: Vec2) -> (i32, i32) {
        let c = (p - self.origin) / self.cell;
        (
            (c.x.floor() as i32).clamp(0, self.cols - 1),
            (c.y.floor() as i32).clamp(0, self.rows - 1),
        )
    }

    fn insert(&mut self, p: Vec2, index: usize) {
        let (x, y) = self.coords(p);
        self.buckets[(y * self.cols + x) as usize].push(index);
    }

    fn any_within(&self, p: Vec2, radius: f32, samples: &[Vec2]) -> bool {
        let (lo_x, lo_y) = self.coords(p - Vec2::splat(radius));
        let (hi_x, hi_y) = self.coords(p + Vec2::splat(radius));
        let r2 = radius * radius;
        for y in lo_y..=hi_y {
            for x in lo_x..=hi_x {
                let bucket = &self.buckets[(y * self.cols + x) as usize];
                if bucket.iter().any(|&i| samples[i].distance_squared(p) < r2) {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_minimum_spacing() {
        let area = Rect::new(Vec2::ZERO, Vec2::splat(64.0));
        let samples = PoissonDisk::new(area, 2.0, 2.0).with_seed(7).sample(&[], |_| 2.0, |_| true);
        assert!(samples.len() > 100);
        for (i, a) in samples.iter().enumerate() {
            assert!(area.contains(*a));
            for b in &samples[i + 1..] {
                assert!(a.distance(*b) >= 2.0 - 1e-4);
            }
        }
    }

    #[test]
    fn spacing_follows_density() {
        let area = Rect::new(Vec2::ZERO, Vec2::new(64.0, 32.0));
        let spacing = |p: Vec2| if p.x < 32.0 { 1.0 } else { 4.0 };
        let samples = PoissonDisk::new(area, 1.0, 4.0).with_seed(3).sample(&[], spacing, |_| true);
        let dense = samples.iter().filter(|p| p.x < 32.0).count();
        let sparse = samples.len() - dense;
        assert!(dense > sparse * 4);
    }

    #[test]
    fn predicate_and_seed_are_honored() {
        let area = Rect::new(Vec2::ZERO, Vec2::splat(32.0));
        let disk = PoissonDisk::new(area, 1.5, 1.5).with_seed(11);
        let initial = [Vec2::new(4.0, 4.0)];
        let a = disk.sample(&initial, |_| 1.5, |p| p.y < 16.0);
        let b = disk.sample(&initial, |_| 1.5, |p| p.y < 16.0);
        assert_eq!(a, b);
        assert_eq!(a[0], initial[0]);
        assert!(a.iter().all(|p| p.y < 16.0));
    }
}
