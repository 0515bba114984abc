use glam::{Mat4, Vec3, Vec4};

use crate::utils::Aabb;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub eye: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub up: Vec3,
    pub fov_y: f32,
    pub aspect: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl Camera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            eye: Vec3::new(425.0, 60.0, 425.0),
            yaw: 0.0,
            pitch: 0.0,
            up: Vec3::Y,
            fov_y: 60f32.to_radians(),
            aspect: width as f32 / height.max(1) as f32,
            z_near: 0.1,
            z_far: 5000.0,
        }
    }

    pub fn forward(&self) -> Vec3 {
        let cy = self.yaw;
        let cp = self.pitch.clamp(-1.5533, 1.5533); // Slightly less than π/2 to avoid gimbal lock
        Vec3::new(cy.cos() * cp.cos(), cp.sin(), cy.sin() * cp.cos()).normalize()
    }

    pub fn target(&self) -> Vec3 {
        self.eye + self.forward()
    }

    pub fn set_aspect(&mut self, width: u32, height: u32) {
        self.aspect = width as f32 / height.max(1) as f32;
    }

    pub fn set_look_at(&mut self, target: Vec3) {
        let dir = (target - self.eye).normalize();
        self.yaw = dir.z.atan2(dir.x);
        self.pitch = dir.y.asin().clamp(-1.4, 1.4);
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target(), self.up)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.z_near, self.z_far)
    }

    pub fn view_proj(&self) -> Mat4 {
        self.projection() * self.view()
    }

    /// Same camera with the vertical field of view widened by `degrees`.
    pub fn widened(&self, degrees: f32) -> Self {
        Self { fov_y: self.fov_y + degrees.to_radians(), ..*self }
    }

    /// Distance in front of the camera along the view axis.
    pub fn eye_depth(&self, p: Vec3) -> f32 {
        -self.view().transform_point3(p).z
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(&self.view_proj())
    }
}

/// Six clip planes `[a, b, c, d]` with `ax + by + cz + d >= 0` inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    // Extract planes from a zero-to-one depth view-projection matrix
    pub fn from_matrix(vp: &Mat4) -> Self {
        let m = vp.to_cols_array();
        Self {
            planes: [
                // Left: row4 + row1
                Vec4::new(m[3] + m[0], m[7] + m[4], m[11] + m[8], m[15] + m[12]),
                // Right: row4 - row1
                Vec4::new(m[3] - m[0], m[7] - m[4], m[11] - m[8], m[15] - m[12]),
                // Bottom: row4 + row2
                Vec4::new(m[3] + m[1], m[7] + m[5], m[11] + m[9], m[15] + m[13]),
                // Top: row4 - row2
                Vec4::new(m[3] - m[1], m[7] - m[5], m[11] - m[9], m[15] - m[13]),
                // Near: row3
                Vec4::new(m[2], m[6], m[10], m[14]),
                // Far: row4 - row3
                Vec4::new(m[3] - m[2], m[7] - m[6], m[11] - m[10], m[15] - m[14]),
            ],
        }
    }

    /// Conservative box test: a box is culled only when all eight corners
    /// lie outside the same plane.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let corners = aabb.corners();
        self.planes.iter().all(|plane| {
            corners.iter().any(|c| plane.truncate().dot(*c) + plane.w > 0.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn looking_down_x() -> Camera {
        let mut camera = Camera::new(800, 600);
        camera.eye = Vec3::ZERO;
        camera.set_look_at(Vec3::X);
        camera
    }

    #[test]
    fn frustum_culls_boxes_behind_and_beside() {
        let camera = looking_down_x();
        let frustum = camera.frustum();
        let ahead = Aabb::new(Vec3::new(10.0, -1.0, -1.0), Vec3::new(12.0, 1.0, 1.0));
        let behind = Aabb::new(Vec3::new(-12.0, -1.0, -1.0), Vec3::new(-10.0, 1.0, 1.0));
        let aside = Aabb::new(Vec3::new(1.0, -1.0, 50.0), Vec3::new(2.0, 1.0, 52.0));
        assert!(frustum.intersects_aabb(&ahead));
        assert!(!frustum.intersects_aabb(&behind));
        assert!(!frustum.intersects_aabb(&aside));
    }

    #[test]
    fn widened_frustum_keeps_edge_boxes() {
        let camera = looking_down_x();
        // just past the right edge of the 60 degree frustum at distance 10
        let half_width = (camera.fov_y * 0.5).tan() * camera.aspect * 10.0;
        let edge = Aabb::new(
            Vec3::new(9.9, -0.1, half_width + 0.05),
            Vec3::new(10.0, 0.1, half_width + 0.1),
        );
        assert!(!camera.frustum().intersects_aabb(&edge));
        assert!(camera.widened(2.0).frustum().intersects_aabb(&edge));
    }

    #[test]
    fn eye_depth_grows_along_forward() {
        let camera = looking_down_x();
        assert!(camera.eye_depth(Vec3::new(5.0, 0.0, 0.0)) > camera.eye_depth(Vec3::new(1.0, 0.0, 0.0)));
        assert!(camera.eye_depth(Vec3::new(-1.0, 0.0, 0.0)) < 0.0);
    }
}
