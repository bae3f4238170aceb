//! Utility types shared by the codec and the fluid model.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - Math type re-exports from glam and [`BBox3d`]

mod error;
mod math;

pub use error::*;
pub use math::*;
