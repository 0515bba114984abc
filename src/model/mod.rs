// MODEL: terrain data, geometry and generation state
pub mod camera;
pub mod channel;
pub mod delaunay;
pub mod generation;
pub mod noise;
pub mod occlusion;
pub mod poisson;
pub mod population;
pub mod road;
pub mod spline;
pub mod tile;

pub use camera::{Camera, Frustum};
pub use channel::Channel;
pub use generation::{DoubleBuffer, GenerationEpoch};
pub use occlusion::{OcclusionState, QueryId, QueryRing};
pub use population::{Family, PopulationData, Prototypes};
pub use road::RoadPathPlanner;
pub use spline::BSpline;
pub use tile::{Tile, TileBounds, TileGeometry, TileGrid, TileId};
