//! One frame file: headers, shapes and channels, decoded lazily.
//!
//! ```text
//! Unloaded --headers()--> HeadersParsed --shapes()/channels()--> FullyDecoded
//!     \___________________________|_____________________________/
//!                                 v
//!                            free() -> Freed
//! ```
//!
//! Header access scans the chunk stream only as far as `STIM` and `ETIM`.
//! Channel access decodes the rest of the file and closes it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::channel::{Channel, ChannelId, Interpretation};
use super::metadata::{CacheMetadata, ChannelSpec};
use super::shape::{Shape, ShapeView};
use crate::chunk::{ChunkReader, ChunkTree, Fragments, Node, Tag};
use crate::util::{DVec3, Error, Result, UVec3};

/// Version string written into every frame header.
pub const FORMAT_VERSION: &str = "0.1";

/// Decode progress of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Unloaded,
    HeadersParsed,
    FullyDecoded,
    /// Buffers released; the frame can no longer be used.
    Freed,
}

/// Frame and sub-frame tick parsed from a frame file name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIndex {
    pub frame: u64,
    pub tick: u32,
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tick == 0 {
            write!(f, "{}", self.frame)
        } else {
            write!(f, "{}.tick{}", self.frame, self.tick)
        }
    }
}

/// Values from the `CACH` header group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeaders {
    pub version: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl FrameHeaders {
    fn is_complete(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_some()
    }
}

/// One frame of a cache, backed by a file or synthetic.
pub struct Frame {
    metadata: Arc<CacheMetadata>,
    path: Option<PathBuf>,
    index: Option<FrameIndex>,
    state: FrameState,
    reader: Option<ChunkReader<BufReader<File>>>,
    headers: FrameHeaders,
    shapes: BTreeMap<String, Shape>,
    channels: Vec<Channel>,
    channel_names: BTreeMap<String, ChannelId>,
}

impl Frame {
    /// Frame backed by a file; nothing is read until first access.
    pub fn open(metadata: Arc<CacheMetadata>, path: impl Into<PathBuf>, index: Option<FrameIndex>) -> Self {
        Self {
            metadata,
            path: Some(path.into()),
            index,
            state: FrameState::Unloaded,
            reader: None,
            headers: FrameHeaders::default(),
            shapes: BTreeMap::new(),
            channels: Vec::new(),
            channel_names: BTreeMap::new(),
        }
    }

    /// Empty in-memory frame, ready to receive shapes and channels.
    pub fn synthetic(metadata: Arc<CacheMetadata>) -> Self {
        Self {
            metadata,
            path: None,
            index: None,
            state: FrameState::FullyDecoded,
            reader: None,
            headers: FrameHeaders::default(),
            shapes: BTreeMap::new(),
            channels: Vec::new(),
            channel_names: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline]
    pub fn index(&self) -> Option<FrameIndex> {
        self.index
    }

    #[inline]
    pub fn metadata(&self) -> &Arc<CacheMetadata> {
        &self.metadata
    }

    fn display_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from("<synthetic>"))
    }

    fn check_not_freed(&self) -> Result<()> {
        if self.state == FrameState::Freed {
            return Err(Error::FrameFreed(self.display_path()));
        }
        Ok(())
    }

    /// Scan the stream for `STIM` / `ETIM` without decoding channels.
    pub fn ensure_headers(&mut self) -> Result<()> {
        self.check_not_freed()?;
        if self.state != FrameState::Unloaded {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.scan_headers(&path).map_err(|e| e.in_frame(&path))?;
        self.state = FrameState::HeadersParsed;
        Ok(())
    }

    fn scan_headers(&mut self, path: &Path) -> Result<()> {
        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => ChunkReader::open(path)?,
        };
        let mut headers = FrameHeaders::default();
        while !headers.is_complete() {
            let Some(node) = reader.parse_next()? else {
                let missing = if headers.start_time.is_none() { Tag::STIM } else { Tag::ETIM };
                return Err(Error::TruncatedStream {
                    pos: reader.pos(),
                    missing: format!("header {}", missing),
                });
            };
            let Node::Leaf(leaf) = node else {
                continue;
            };
            let tag = leaf.tag();
            if tag == Tag::VRSN {
                headers.version = Some(leaf.string()?.to_string());
                continue;
            }
            if tag != Tag::STIM && tag != Tag::ETIM {
                continue;
            }
            let Some(value) = leaf.ints()?.first().copied() else {
                return Err(Error::malformed(reader.pos(), format!("empty {} chunk", tag)));
            };
            if tag == Tag::STIM {
                headers.start_time = Some(i64::from(value));
            } else {
                headers.end_time = Some(i64::from(value));
            }
        }
        tracing::trace!(path = %path.display(), ?headers, "parsed frame headers");
        self.headers = headers;
        self.reader = Some(reader);
        Ok(())
    }

    /// Decode every shape and channel. Later calls are no-ops.
    #[tracing::instrument(level = "debug", skip_all, fields(path = ?self.path))]
    pub fn ensure_decoded(&mut self) -> Result<()> {
        self.ensure_headers()?;
        if self.state == FrameState::FullyDecoded {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            self.state = FrameState::FullyDecoded;
            return Ok(());
        };
        match self.decode(&path) {
            Ok(()) => {
                self.state = FrameState::FullyDecoded;
                tracing::debug!(
                    shapes = self.shapes.len(),
                    channels = self.channels.len(),
                    "decoded frame"
                );
                Ok(())
            }
            Err(e) => {
                self.shapes.clear();
                self.channels.clear();
                self.channel_names.clear();
                Err(e.in_frame(&path))
            }
        }
    }

    fn decode(&mut self, path: &Path) -> Result<()> {
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => ChunkReader::open(path)?,
        };
        let mut tree = reader.into_tree()?;

        self.shapes = self
            .metadata
            .shape_specs()
            .iter()
            .map(|(name, spec)| (name.clone(), Shape::new(Arc::clone(spec))))
            .collect();

        let group = tree.take_one(Tag::MYCH)?.into_group()?;
        let mut name: Option<String> = None;
        let mut size: Option<i32> = None;
        for node in group.into_children() {
            let Node::Leaf(leaf) = node else {
                continue;
            };
            let tag = leaf.tag();
            match tag {
                Tag::CHNM => {
                    if let Some(previous) = name.take() {
                        return Err(Error::other(format!("channel {} has no data array", previous)));
                    }
                    name = Some(leaf.string()?.to_string());
                    size = None;
                }
                Tag::SIZE => size = leaf.ints()?.first().copied(),
                _ if tag.is_array() => {
                    let channel_name = name
                        .take()
                        .ok_or_else(|| Error::other(format!("{} array without a channel name", tag)))?;
                    let data = leaf.into_floats()?;
                    if let Some(declared) = size.take() {
                        let declared = usize::try_from(declared).unwrap_or(usize::MAX);
                        let matches = declared == data.len()
                            || (tag == Tag::FVCA && declared.checked_mul(3) == Some(data.len()));
                        if !matches {
                            return Err(Error::ChannelSize {
                                channel: channel_name,
                                expected: declared,
                                actual: data.len(),
                            });
                        }
                    }
                    self.insert_decoded(channel_name, data)?;
                }
                _ => {}
            }
        }
        if let Some(dangling) = name {
            return Err(Error::other(format!("channel {} has no data array", dangling)));
        }

        for shape in self.shapes.values_mut() {
            shape.finalize(&self.channels)?;
        }
        Ok(())
    }

    fn insert_decoded(&mut self, name: String, data: Vec<f64>) -> Result<()> {
        let spec = match self.metadata.channel_spec(&name) {
            Some(spec) => spec.clone(),
            None => ChannelSpec::parse(&name)?,
        };
        if !self.shapes.contains_key(spec.shape_name()) {
            return Err(Error::UnknownShape {
                channel: name,
                shape: spec.shape_name().to_string(),
            });
        }
        let channel = Channel::new(name, spec.shape_name(), spec.interpretation().clone(), data);
        self.put_channel(channel);
        Ok(())
    }

    /// Store a channel, replacing one with the same name.
    fn put_channel(&mut self, channel: Channel) -> ChannelId {
        let id = match self.channel_names.get(channel.name()) {
            Some(&id) => {
                self.channels[id.index()] = channel;
                id
            }
            None => {
                let id = ChannelId(self.channels.len());
                self.channel_names.insert(channel.name().to_string(), id);
                self.channels.push(channel);
                id
            }
        };
        let channel = &self.channels[id.index()];
        if let Some(shape) = self.shapes.get_mut(channel.shape_name()) {
            shape.attach(channel.interpretation().clone(), id);
        }
        id
    }

    /// Frame headers, scanning the file on first access.
    pub fn headers(&mut self) -> Result<&FrameHeaders> {
        self.ensure_headers()?;
        Ok(&self.headers)
    }

    /// `STIM` in ticks.
    pub fn start_time(&mut self) -> Result<i64> {
        self.headers()?.start_time.ok_or(Error::MissingHeader(Tag::STIM))
    }

    /// `ETIM` in ticks.
    pub fn end_time(&mut self) -> Result<i64> {
        self.headers()?.end_time.ok_or(Error::MissingHeader(Tag::ETIM))
    }

    /// Override the header times.
    pub fn set_times(&mut self, start: i64, end: i64) -> Result<()> {
        self.ensure_headers()?;
        self.headers.start_time = Some(start);
        self.headers.end_time = Some(end);
        Ok(())
    }

    /// All shapes, decoding the file on first access.
    pub fn shapes(&mut self) -> Result<&BTreeMap<String, Shape>> {
        self.ensure_decoded()?;
        Ok(&self.shapes)
    }

    /// All channels in file order, decoding the file on first access.
    pub fn channels(&mut self) -> Result<&[Channel]> {
        self.ensure_decoded()?;
        Ok(&self.channels)
    }

    /// Channel by full name.
    pub fn channel(&mut self, name: &str) -> Result<Option<&Channel>> {
        self.ensure_decoded()?;
        Ok(self.channel_names.get(name).map(|id| &self.channels[id.index()]))
    }

    /// Decode if needed and view one shape with its channels.
    pub fn shape_view(&mut self, name: &str) -> Result<ShapeView<'_>> {
        self.ensure_decoded()?;
        self.view(name)
    }

    /// View a shape of an already decoded frame.
    pub fn view(&self, name: &str) -> Result<ShapeView<'_>> {
        self.check_not_freed()?;
        if self.state != FrameState::FullyDecoded {
            return Err(Error::FrameNotDecoded(self.display_path().display().to_string()));
        }
        let shape = self
            .shapes
            .get(name)
            .ok_or_else(|| Error::ShapeNotFound(name.to_string()))?;
        Ok(ShapeView::new(shape, &self.channels))
    }

    /// Add or replace a shape, dropping the channels of any shape it replaces.
    pub fn insert_shape(&mut self, mut shape: Shape) -> Result<()> {
        self.ensure_decoded()?;
        let name = shape.name().to_string();
        if self.shapes.contains_key(&name) {
            self.channels.retain(|c| c.shape_name() != name);
            self.reindex();
        }
        shape.detach_all();
        self.shapes.insert(name, shape);
        Ok(())
    }

    /// Add or replace a channel. Its shape must already be in the frame.
    ///
    /// Values are rounded to `f32` on the way in, so the frame holds exactly
    /// what [`Frame::write`] will put on disk.
    pub fn insert_channel(&mut self, mut channel: Channel) -> Result<ChannelId> {
        self.ensure_decoded()?;
        if !self.shapes.contains_key(channel.shape_name()) {
            return Err(Error::UnknownShape {
                channel: channel.name().to_string(),
                shape: channel.shape_name().to_string(),
            });
        }
        channel.round_to_f32()?;
        Ok(self.put_channel(channel))
    }

    /// Rebuild name and shape lookups after the channel table changed.
    fn reindex(&mut self) {
        self.channel_names.clear();
        for shape in self.shapes.values_mut() {
            shape.detach_all();
        }
        for (i, channel) in self.channels.iter().enumerate() {
            let id = ChannelId(i);
            self.channel_names.insert(channel.name().to_string(), id);
            if let Some(shape) = self.shapes.get_mut(channel.shape_name()) {
                shape.attach(channel.interpretation().clone(), id);
            }
        }
    }

    /// Re-derive a shape's geometry from its current channels.
    pub fn finalize_shape(&mut self, name: &str) -> Result<()> {
        self.ensure_decoded()?;
        let shape = self
            .shapes
            .get_mut(name)
            .ok_or_else(|| Error::ShapeNotFound(name.to_string()))?;
        shape.finalize(&self.channels)
    }

    /// Release decoded buffers and close the file. Safe to call repeatedly.
    pub fn free(&mut self) {
        if self.state == FrameState::Freed {
            return;
        }
        self.reader = None;
        for channel in &mut self.channels {
            channel.clear();
        }
        self.channels = Vec::new();
        self.channel_names.clear();
        self.shapes.clear();
        self.state = FrameState::Freed;
        tracing::trace!(path = ?self.path, "freed frame");
    }

    /// Encode headers and channels into a lazy fragment stream.
    ///
    /// The frame must already be decoded; channel arrays are borrowed, not
    /// copied.
    pub fn dumps_iter(&self) -> Result<Fragments<'_>> {
        self.check_not_freed()?;
        if self.state != FrameState::FullyDecoded {
            return Err(Error::FrameNotDecoded(self.display_path().display().to_string()));
        }
        let start = self.headers.start_time.ok_or(Error::MissingHeader(Tag::STIM))?;
        let end = self.headers.end_time.ok_or(Error::MissingHeader(Tag::ETIM))?;

        let mut tree = ChunkTree::new();
        let header = tree.add_group(Tag::CACH);
        header.add_chunk(Tag::VRSN).set_string(FORMAT_VERSION)?;
        header.add_chunk(Tag::STIM).set_ints(&[start])?;
        header.add_chunk(Tag::ETIM).set_ints(&[end])?;

        let group = tree.add_group(Tag::MYCH);
        for channel in &self.channels {
            group.add_chunk(Tag::CHNM).set_string(channel.name())?;
            group.add_chunk(Tag::SIZE).set_ints(&[channel.len() as i64])?;
            group.add_chunk(Tag::FBCA).set_floats(channel.data())?;
        }
        tree.dumps_iter()
    }

    /// Decode if needed and write the frame to `path`. Returns bytes written.
    pub fn write(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        self.ensure_decoded()?;
        let mut out = BufWriter::new(File::create(path)?);
        let mut written = 0u64;
        for fragment in self.dumps_iter()? {
            out.write_all(&fragment)?;
            written += fragment.len() as u64;
        }
        out.flush()?;
        tracing::debug!(path = %path.display(), bytes = written, "wrote frame");
        Ok(written)
    }

    /// Decode if needed and describe times and shapes.
    pub fn summary(&mut self) -> Result<FrameSummary> {
        self.ensure_decoded()?;
        let shapes = self
            .shapes
            .values()
            .map(|shape| ShapeSummary {
                name: shape.name().to_string(),
                resolution: shape.resolution(),
                offset: shape.offset(),
                bb_min: shape.bb_min(),
                bb_max: shape.bb_max(),
                channels: shape.channel_ids().keys().cloned().collect(),
            })
            .collect();
        Ok(FrameSummary {
            path: self.path.clone(),
            index: self.index,
            start_time: self.headers.start_time,
            end_time: self.headers.end_time,
            shapes,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("path", &self.path)
            .field("index", &self.index)
            .field("state", &self.state)
            .field("headers", &self.headers)
            .field("shapes", &self.shapes.keys().collect::<Vec<_>>())
            .field("channels", &self.channel_names.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Geometry of one shape in a [`FrameSummary`].
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeSummary {
    pub name: String,
    pub resolution: UVec3,
    pub offset: DVec3,
    pub bb_min: DVec3,
    pub bb_max: DVec3,
    pub channels: Vec<Interpretation>,
}

/// Human-readable description of a decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameSummary {
    pub path: Option<PathBuf>,
    pub index: Option<FrameIndex>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub shapes: Vec<ShapeSummary>,
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = |t: Option<i64>| t.map_or_else(|| "?".to_string(), |t| t.to_string());
        writeln!(f, "Frame from {} to {}", time(self.start_time), time(self.end_time))?;
        writeln!(f, "Shapes:")?;
        for shape in &self.shapes {
            writeln!(f, "\t{}:", shape.name)?;
            writeln!(f, "\t\tresolution: {}", shape.resolution)?;
            writeln!(f, "\t\toffset: {}", shape.offset)?;
            writeln!(f, "\t\tbb_min: {}", shape.bb_min)?;
            writeln!(f, "\t\tbb_max: {}", shape.bb_max)?;
            let channels: Vec<&str> = shape.channels.iter().map(Interpretation::as_str).collect();
            writeln!(f, "\t\tchannels: {}", channels.join(", "))?;
        }
        Ok(())
    }
}
