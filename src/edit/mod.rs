//! Terrain deformation: brushes, the edit journal and the service applying
//! them to resident chunks

pub mod brush;
pub mod journal;
pub mod service;

pub use brush::EditOp;
pub use journal::EditJournal;
pub use service::{EditOutcome, TerrainEditService};
