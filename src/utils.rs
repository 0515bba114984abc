use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use wgpu::util::DeviceExt;

/// Vertex layout shared by tiles, population instances and occluder proxies.
/// `params` carries per-mesh extras: `[prototype, instance fraction]` for
/// population vertices, zero for terrain.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub params: [f32; 2],
}

impl Vertex {
    pub fn flat(x: f32, z: f32, uv: Vec2) -> Self {
        Self {
            pos: [x, 0.0, z],
            normal: [0.0, 1.0, 0.0],
            uv: uv.to_array(),
            params: [0.0, 0.0],
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.pos)
    }
}

pub struct MeshBuffer {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn empty() -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Appends `other`, rebasing its indices.
    pub fn append(&mut self, other: &Mesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.indices.extend(other.indices.iter().map(|i| i + base));
    }

    pub fn bounds(&self) -> Option<Aabb> {
        let mut iter = self.vertices.iter().map(Vertex::position);
        let first = iter.next()?;
        Some(iter.fold(Aabb::new(first, first), |b, p| b.include_point(p)))
    }

    pub fn upload(&self, device: &wgpu::Device) -> MeshBuffer {
        let vertices = bytemuck::cast_slice(&self.vertices);
        let indices = bytemuck::cast_slice(&self.indices);

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mesh Vertex Buffer"),
            contents: vertices,
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mesh Index Buffer"),
            contents: indices,
            usage: wgpu::BufferUsages::INDEX,
        });

        MeshBuffer {
            vertex_buffer,
            index_buffer,
            index_count: self.indices.len() as u32,
        }
    }
}

/// Axis-aligned rectangle in terrain pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.y >= self.min.y && p.x <= self.max.x && p.y <= self.max.y
    }

    /// Strict containment, `epsilon` away from every edge.
    pub fn contains_inset(&self, p: Vec2, epsilon: f32) -> bool {
        p.x > self.min.x + epsilon
            && p.y > self.min.y + epsilon
            && p.x < self.max.x - epsilon
            && p.y < self.max.y - epsilon
    }

    pub fn expanded(&self, margin: f32) -> Self {
        Self::new(self.min - Vec2::splat(margin), self.max + Vec2::splat(margin))
    }

    pub fn clipped(&self, other: &Rect) -> Self {
        Self::new(self.min.max(other.min), self.max.min(other.max))
    }

    pub fn offset(&self, by: Vec2) -> Self {
        Self::new(self.min + by, self.max + by)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn include_point(self, p: Vec3) -> Self {
        Self::new(self.min.min(p), self.max.max(p))
    }

    pub fn union(self, other: &Aabb) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }

    pub fn lerp(&self, other: &Aabb, t: f32) -> Self {
        Self::new(self.min.lerp(other.min, t), self.max.lerp(other.max, t))
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }
}

/// Unit cube mesh spanning `[-0.5, 0.5]`, used for occlusion proxies.
pub fn create_box_mesh() -> Mesh {
    let vertices = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))
        .corners()
        .iter()
        .map(|c| Vertex {
            pos: c.to_array(),
            normal: [0.0, 1.0, 0.0],
            uv: [0.0, 0.0],
            params: [0.0, 0.0],
        })
        .collect();
    let indices = vec![
        0, 2, 1, 1, 2, 3, // back
        4, 5, 6, 5, 7, 6, // front
        0, 1, 4, 1, 5, 4, // bottom
        2, 6, 3, 3, 6, 7, // top
        0, 4, 2, 2, 4, 6, // left
        1, 3, 5, 3, 7, 5, // right
    ];
    Mesh { vertices, indices }
}

pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

pub fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rebases_indices() {
        let mut a = create_box_mesh();
        let b = create_box_mesh();
        a.append(&b);
        assert_eq!(a.vertices.len(), 16);
        assert_eq!(a.indices.len(), 72);
        assert!(a.indices[36..].iter().all(|&i| i >= 8));
    }

    #[test]
    fn rect_clip_and_inset() {
        let full = Rect::new(Vec2::ZERO, Vec2::splat(100.0));
        let r = Rect::new(Vec2::splat(80.0), Vec2::splat(100.0)).expanded(20.0).clipped(&full);
        assert_eq!(r.min, Vec2::splat(60.0));
        assert_eq!(r.max, Vec2::splat(100.0));
        assert!(!r.contains_inset(Vec2::new(100.0, 80.0), 0.1));
        assert!(r.contains(Vec2::new(100.0, 80.0)));
    }
}
