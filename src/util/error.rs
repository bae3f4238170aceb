//! Error types for the fluid cache library.

use std::path::PathBuf;
use thiserror::Error;

use crate::chunk::Tag;

/// Main error type for fluid cache operations.
#[derive(Error, Debug)]
pub enum Error {
    /// File does not exist or cannot be accessed
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// Sidecar does not describe the one supported cache layout,
    /// or is missing required elements.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The sidecar is not well-formed XML.
    #[error("XML error: {0}")]
    Xml(String),

    /// Chunk stream is inconsistent (bad tag, size overruns its group, ...)
    #[error("Malformed chunk stream at byte {pos}: {reason}")]
    MalformedBinary { pos: u64, reason: String },

    /// Chunk stream ended before a record or a required tag was complete.
    #[error("Chunk stream truncated at byte {pos} (expected {missing})")]
    TruncatedStream { pos: u64, missing: String },

    /// No direct child with the requested tag.
    #[error("Chunk not found: {0}")]
    TagNotFound(Tag),

    /// Chunk exists but carries a different payload kind.
    #[error("Chunk {tag} holds {actual}, expected {expected}")]
    WrongPayloadKind {
        tag: Tag,
        expected: &'static str,
        actual: &'static str,
    },

    /// Value does not fit the fixed-width wire encoding.
    #[error("Value {value} cannot be encoded in chunk {tag}")]
    NotRepresentable { tag: Tag, value: String },

    /// Interpretation has no known vector width, so it cannot be sampled.
    #[error("Channel {channel}: unknown interpretation '{interpretation}'")]
    UnknownInterpretation {
        channel: String,
        interpretation: String,
    },

    /// Channel is read through the wrong grid layout
    /// (e.g. a staggered velocity channel through the cell-centered lookup).
    #[error("Channel {channel} is not a {expected} channel")]
    WrongLayout {
        channel: String,
        expected: &'static str,
    },

    /// Channel refers to a shape that the metadata does not declare.
    #[error("Channel {channel} refers to unknown shape '{shape}'")]
    UnknownShape { channel: String, shape: String },

    /// Frame has no shape with this name.
    #[error("Shape not found: {0}")]
    ShapeNotFound(String),

    /// Shape lacks a channel an operation needs.
    #[error("Shape {shape} has no '{interpretation}' channel")]
    ChannelNotFound {
        shape: String,
        interpretation: String,
    },

    /// Channel payload length disagrees with its shape's grid.
    #[error("Channel {channel} holds {actual} values, grid needs {expected}")]
    ChannelSize {
        channel: String,
        expected: usize,
        actual: usize,
    },

    /// Frame has no value for a required header.
    #[error("Missing frame header {0}")]
    MissingHeader(Tag),

    /// Frame buffers were released with `free()`.
    #[error("Frame has been freed: {0}")]
    FrameFreed(PathBuf),

    /// Frame data is needed but the frame is not fully decoded yet.
    #[error("Frame is not decoded: {0}")]
    FrameNotDecoded(String),

    /// Error scoped to a single frame file.
    #[error("Frame {path}: {source}")]
    Frame {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 conversion error
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid metadata error.
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }

    /// Create a malformed stream error.
    pub fn malformed(pos: u64, reason: impl Into<String>) -> Self {
        Self::MalformedBinary { pos, reason: reason.into() }
    }

    /// Attach the frame file this error happened in.
    ///
    /// Already-scoped errors are returned unchanged.
    pub fn in_frame(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Frame { .. } => self,
            other => Self::Frame {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strip frame scoping, if any.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Frame { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias for fluid cache operations.
pub type Result<T> = std::result::Result<T, Error>;
