use glam::Vec2;

use crate::error::{Result, TerrainError};

/// Single-channel `f32` image, row-major, `y` growing with terrain `z`.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

/// Row-major offset, widened before multiplying.
fn index(width: u32, x: u32, y: u32) -> usize {
    y as usize * width as usize + x as usize
}

impl Channel {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    pub fn from_data(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(TerrainError::ChannelSize { expected, actual: data.len() });
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[index(self.width, x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let i = index(self.width, x, y);
        self.data[i] = value;
    }

    /// Texel lookup with integer coordinates clamped to the image.
    pub fn get_clamped(&self, x: i32, y: i32) -> f32 {
        let x = x.clamp(0, self.width as i32 - 1) as u32;
        let y = y.clamp(0, self.height as i32 - 1) as u32;
        self.get(x, y)
    }

    /// Value at the texel containing `pos`, clamped to the image.
    pub fn get_value(&self, pos: Vec2) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.get_clamped(pos.x.floor() as i32, pos.y.floor() as i32)
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        let mut iter = self.data.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    /// Rasterizes a triangle, interpolating `values` across it. Texels whose
    /// centers fall inside the triangle (either winding) are written.
    pub fn fill_triangle(&mut self, a: Vec2, b: Vec2, c: Vec2, values: [f32; 3]) {
        let area = edge(a, b, c);
        if area.abs() < f32::EPSILON || self.data.is_empty() {
            return;
        }
        let lo = a.min(b).min(c).floor().max(Vec2::ZERO);
        let hi = a.max(b).max(c).ceil().min(Vec2::new(self.width as f32, self.height as f32));

        for y in lo.y as u32..hi.y as u32 {
            for x in lo.x as u32..hi.x as u32 {
                let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let w0 = edge(b, c, p) / area;
                let w1 = edge(c, a, p) / area;
                let w2 = edge(a, b, p) / area;
                if w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0 {
                    self.set(x, y, w0 * values[0] + w1 * values[1] + w2 * values[2]);
                }
            }
        }
    }

    /// Rasterizes a triangle strip with a constant value.
    pub fn fill_strip(&mut self, strip: &[Vec2], value: f32) {
        for w in strip.windows(3) {
            self.fill_triangle(w[0], w[1], w[2], [value; 3]);
        }
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_clamp_to_edges() {
        let c = Channel::from_fn(4, 4, |x, y| (x + y * 4) as f32);
        assert_eq!(c.get_value(Vec2::new(-3.0, -3.0)), 0.0);
        assert_eq!(c.get_value(Vec2::new(10.0, 1.2)), 7.0);
        assert_eq!(c.get_value(Vec2::new(2.9, 3.9)), 14.0);
    }

    #[test]
    fn triangle_fill_interpolates() {
        let mut c = Channel::new(16, 16);
        c.fill_triangle(
            Vec2::new(0.0, 0.0),
            Vec2::new(16.0, 0.0),
            Vec2::new(0.0, 16.0),
            [1.0, 1.0, 1.0],
        );
        assert_eq!(c.get(1, 1), 1.0);
        assert_eq!(c.get(15, 15), 0.0);

        let mut ramp = Channel::new(16, 16);
        ramp.fill_triangle(
            Vec2::new(0.0, 0.0),
            Vec2::new(0.0, 16.0),
            Vec2::new(16.0, 0.0),
            [0.0, 0.0, 1.0],
        );
        assert!(ramp.get(8, 0) > ramp.get(2, 0));
    }

    #[test]
    fn offsets_do_not_wrap_on_large_channels() {
        assert_eq!(index(70_000, 5, 70_000), 4_900_000_005);
        assert_eq!(index(4, 1, 2), 9);
    }

    #[test]
    fn from_data_checks_length() {
        assert!(Channel::from_data(2, 2, vec![0.0; 3]).is_err());
        assert!(Channel::from_data(2, 2, vec![0.0; 4]).is_ok());
    }
}
