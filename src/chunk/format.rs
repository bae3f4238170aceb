//! Chunk container constants and structures.

use std::fmt;

/// Four-character record tag.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    /// 32-bit group marker.
    pub const FOR4: Tag = Tag(*b"FOR4");
    /// 64-bit group marker (`mcx` caches, not supported here).
    pub const FOR8: Tag = Tag(*b"FOR8");

    /// Frame header group.
    pub const CACH: Tag = Tag(*b"CACH");
    /// Format version string.
    pub const VRSN: Tag = Tag(*b"VRSN");
    /// Start tick.
    pub const STIM: Tag = Tag(*b"STIM");
    /// End tick.
    pub const ETIM: Tag = Tag(*b"ETIM");
    /// Channel group.
    pub const MYCH: Tag = Tag(*b"MYCH");
    /// Channel name.
    pub const CHNM: Tag = Tag(*b"CHNM");
    /// Element count of the following array.
    pub const SIZE: Tag = Tag(*b"SIZE");
    /// Float array.
    pub const FBCA: Tag = Tag(*b"FBCA");
    /// Float vector array.
    pub const FVCA: Tag = Tag(*b"FVCA");
    /// Double array.
    pub const DBLA: Tag = Tag(*b"DBLA");

    /// Build a tag from a 4-byte string literal.
    pub const fn new(bytes: &[u8; 4]) -> Self {
        Self(*bytes)
    }

    /// Raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Whether this tag opens a group.
    #[inline]
    pub fn is_group_marker(&self) -> bool {
        *self == Self::FOR4 || *self == Self::FOR8
    }

    /// Whether leaves with this tag hold a channel data array.
    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(*self, Self::FBCA | Self::FVCA | Self::DBLA)
    }

    /// Payload kind leaves with this tag carry on the wire.
    pub fn payload_kind(&self) -> PayloadKind {
        match *self {
            Self::STIM | Self::ETIM | Self::SIZE => PayloadKind::Ints,
            Self::FBCA | Self::FVCA => PayloadKind::Floats,
            Self::DBLA => PayloadKind::Doubles,
            Self::VRSN | Self::CHNM => PayloadKind::String,
            _ => PayloadKind::Raw,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

/// Payload interpretation of a leaf chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// Big-endian i32 sequence.
    Ints,
    /// Big-endian f32 sequence.
    Floats,
    /// Big-endian f64 sequence.
    Doubles,
    /// NUL-terminated string.
    String,
    /// Bytes kept verbatim.
    Raw,
}

impl PayloadKind {
    /// Human readable name for error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ints => "ints",
            Self::Floats => "floats",
            Self::Doubles => "doubles",
            Self::String => "string",
            Self::Raw => "raw bytes",
        }
    }

    /// Width in bytes of one element (1 for strings and raw data).
    pub const fn element_size(self) -> usize {
        match self {
            Self::Ints | Self::Floats => 4,
            Self::Doubles => 8,
            Self::String | Self::Raw => 1,
        }
    }
}

/// Size of a record header (tag + u32 size).
pub const RECORD_HEADER_SIZE: u64 = 8;

/// Size of the group type tag that follows a group header.
pub const GROUP_TAG_SIZE: u64 = 4;

/// Record alignment in `FOR4` containers.
pub const ALIGNMENT: u64 = 4;

/// Number of array elements converted per emitted fragment.
pub const FRAGMENT_ELEMENTS: usize = 16 * 1024;

/// Round `size` up to the record alignment.
#[inline]
pub const fn aligned(size: u64) -> u64 {
    (size + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT
}

/// Padding bytes needed after a payload of `size` bytes.
#[inline]
pub const fn padding(size: u64) -> u64 {
    aligned(size) - size
}
