//! Binary chunk container used by per-frame `.mc` cache files.
//!
//! The container is a 32-bit IFF variant: a flat sequence of tagged
//! records, each either a group (`FOR4`) holding child records or a leaf
//! holding a typed payload.
//!
//! ## Record Layout
//!
//! ```text
//! Group:                          Leaf:
//! +------------------+            +------------------+
//! | "FOR4"           |  4 bytes   | Tag              |  4 bytes
//! +------------------+            +------------------+
//! | Size (u32 BE)    |  4 bytes   | Size (u32 BE)    |  4 bytes
//! +------------------+            +------------------+
//! | Group tag        |  4 bytes   | Payload          |  Size bytes
//! +------------------+            +------------------+
//! | Children ...     |            | Zero padding     |  to 4-byte boundary
//! +------------------+            +------------------+
//! ```
//!
//! A frame file holds a `CACH` group (`VRSN`, `STIM`, `ETIM`) followed by a
//! `MYCH` group of repeated `CHNM` / `SIZE` / `FBCA` triples.

mod format;
mod node;
mod reader;
mod writer;

pub use format::*;
pub use node::*;
pub use reader::*;
pub use writer::*;
