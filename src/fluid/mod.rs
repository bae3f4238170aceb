//! Fluid cache model: sidecar metadata, frames, shapes, channels and blends.
//!
//! ## Data flow
//!
//! ```text
//! <base>.xml --> CacheMetadata --> Cache --frames()--> Frame --> Shape + Channel
//!                                                         \
//!                          Frame + Frame --BlendEngine--> synthetic Frame --> .mc
//! ```
//!
//! Frames share the cache's metadata through an `Arc`, so independent
//! frames can be decoded on separate threads.

mod blend;
mod cache;
mod channel;
mod frame;
mod metadata;
mod shape;
mod xml;

pub use blend::*;
pub use cache::*;
pub use channel::*;
pub use frame::*;
pub use metadata::*;
pub use shape::*;
pub use xml::*;
