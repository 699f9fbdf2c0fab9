//! Bounding volumes used for chunk culling and edit footprints

pub mod aabb;
pub mod frustum;

pub use aabb::Aabb;
pub use frustum::{Frustum, Plane};
