//! # fluidcache
//!
//! Reader, writer and sampler for Maya-style fluid simulation caches: one
//! XML sidecar per simulation plus one binary `.mc` file per frame, holding
//! voxel-grid channels (density, velocity) for each named fluid shape.
//!
//! ## Modules
//!
//! - [`util`] - Errors and math types
//! - [`chunk`] - Binary chunk container (decode and streaming encode)
//! - [`fluid`] - Cache, frames, shapes, channels, grid sampling and blending
//!
//! ## Example
//!
//! ```ignore
//! use fluidcache::prelude::*;
//!
//! let mut cache = Cache::load("smoke.xml")?;
//! for frame in cache.frames()? {
//!     let view = frame.shape_view("fluidShape1")?;
//!     let density = view.sample(&Interpretation::Density, DVec3::ZERO, true)?;
//!     println!("{:?}", density);
//! }
//! ```

pub mod util;
pub mod chunk;
pub mod fluid;

// Re-export commonly used types
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{BBox3d, DVec3, Error, IVec3, Result, UVec3};
    pub use crate::chunk::{ChunkReader, ChunkTree, Tag};
    pub use crate::fluid::{
        BlendEngine, BlendObserver, BlendSource, Cache, CacheMetadata, Channel, Frame, FrameState,
        Interpretation, Shape, ShapeSpec, ShapeView, TracingObserver,
    };
}
