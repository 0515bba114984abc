use glam::Vec2;

pub use delaunator::{Triangulation, EMPTY};

/// Triangulates `input` with `delaunator`. Fewer than three points, or
/// all-collinear input, yields no triangles.
pub fn triangulate(input: &[Vec2]) -> Triangulation {
    let points: Vec<delaunator::Point> = input
        .iter()
        .map(|p| delaunator::Point { x: p.x as f64, y: p.y as f64 })
        .collect();
    delaunator::triangulate(&points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<Vec2> {
        let mut pts = Vec::new();
        for y in 0..n {
            for x in 0..n {
                pts.push(Vec2::new(x as f32, y as f32));
            }
        }
        pts
    }

    #[test]
    fn square_grid_is_fully_covered() {
        let pts = grid(6);
        let t = triangulate(&pts);
        let areas: Vec<f32> = t
            .triangles
            .chunks(3)
            .map(|tri| {
                let (a, b, c) = (pts[tri[0]], pts[tri[1]], pts[tri[2]]);
                (b - a).perp_dot(c - a).abs() * 0.5
            })
            .collect();
        assert!(areas.iter().all(|a| *a > 0.0));
        assert!((areas.iter().sum::<f32>() - 25.0).abs() < 1e-3);
        for corner in [0, 5, 30, 35] {
            assert!(t.hull.contains(&corner));
        }
    }

    #[test]
    fn halfedges_are_symmetric() {
        let pts: Vec<Vec2> = (0..200)
            .map(|i| {
                let f = i as f32;
                Vec2::new((f * 12.9898).sin() * 43.0, (f * 78.233).cos() * 17.0)
            })
            .collect();
        let t = triangulate(&pts);
        assert!(!t.triangles.is_empty());
        for (e, &o) in t.halfedges.iter().enumerate() {
            if o != EMPTY {
                assert_eq!(t.halfedges[o], e);
            }
        }
    }

    #[test]
    fn degenerate_inputs() {
        assert!(triangulate(&[Vec2::ZERO, Vec2::X]).triangles.is_empty());
        let line: Vec<Vec2> = (0..10).map(|i| Vec2::new(i as f32, 0.0)).collect();
        assert!(triangulate(&line).triangles.is_empty());
    }
}
