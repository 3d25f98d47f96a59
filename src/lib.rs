//! Incremental perception for simulated 3D worlds.
//!
//! The [`VisionMap`] tracks observer and observable entities and
//! maintains, per observer, the set of observables it can currently
//! perceive. Candidate membership comes from spatial-grid queries and
//! pure filter predicates; line-of-sight truth comes from budgeted,
//! asynchronous, priority-ordered ray casts driven by a [`RayCaster`].
//!
//! A self-contained 2D polygon module ([`Polygon2d`] over a BSP segment
//! splitter) provides the boolean operations used for carving walkable
//! areas out of navigation surfaces.

pub mod bsp;
pub mod constants;
pub mod line_seg;
pub mod params;
pub mod polygon;
pub mod raycast;
pub mod spatial_grid;
pub mod vision;

pub use bsp::{BspLineSegSplitter, BspTree2d};
pub use line_seg::{LineSeg, SegRelation};
pub use params::{
    BodyHandle, EntityId, ObservableChangeHint, ObservableId, ObservableParams,
    ObserverChangeHint, ObserverId, ObserverParams, SkipList, VisibilityChange, VisionCallback,
};
pub use polygon::Polygon2d;
pub use raycast::{
    QueuedRayId, RayCastPriority, RayCastPriorityRule, RayCastPriorityTable, RayCastRequest,
    RayCastResult, RayCaster, RayQueue,
};
pub use spatial_grid::SpatialGrid;
pub use vision::{
    should_observe, FrameClock, VisionMap, VisionMapConfig, VisionMapStats,
};
