//! Top-level cache: sidecar metadata plus the frame files next to it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use regex::Regex;

use super::frame::{Frame, FrameIndex};
use super::metadata::{CacheMetadata, ExtraValue, FRAME_EXTENSION};
use crate::util::{DVec3, Error, Result, UVec3};

/// A fluid cache on disk: `<base>.xml` and `<base>Frame<N>[Tick<T>].mc`.
pub struct Cache {
    metadata: Arc<CacheMetadata>,
    xml_path: Option<PathBuf>,
    directory: Option<PathBuf>,
    base_name: Option<String>,
    frames: Option<Vec<Frame>>,
}

impl Cache {
    /// Load and validate a sidecar. Frame files are not touched yet.
    pub fn load(xml_path: impl AsRef<Path>) -> Result<Self> {
        let xml_path = std::path::absolute(xml_path.as_ref())?;
        let metadata = CacheMetadata::read(&xml_path)?;
        let directory = xml_path.parent().map(Path::to_path_buf);
        let base_name = xml_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::metadata(format!("{} has no file name", xml_path.display())))?;
        tracing::debug!(path = %xml_path.display(), base = %base_name, "loaded cache");
        Ok(Self {
            metadata: Arc::new(metadata),
            xml_path: Some(xml_path),
            directory,
            base_name: Some(base_name),
            frames: None,
        })
    }

    /// Cache over already parsed metadata, with no files on disk.
    pub fn from_metadata(metadata: CacheMetadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            xml_path: None,
            directory: None,
            base_name: None,
            frames: None,
        }
    }

    #[inline]
    pub fn metadata(&self) -> &Arc<CacheMetadata> {
        &self.metadata
    }

    pub fn xml_path(&self) -> Option<&Path> {
        self.xml_path.as_deref()
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn base_name(&self) -> Option<&str> {
        self.base_name.as_deref()
    }

    /// Point the cache at another sidecar location. Discovered frames are
    /// dropped and will be rescanned from the new directory.
    pub fn set_path(&mut self, xml_path: impl AsRef<Path>) -> Result<()> {
        let xml_path = std::path::absolute(xml_path.as_ref())?;
        self.base_name = Some(
            xml_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| Error::other(format!("{} has no file name", xml_path.display())))?,
        );
        self.directory = xml_path.parent().map(Path::to_path_buf);
        self.xml_path = Some(xml_path);
        self.frames = None;
        Ok(())
    }

    /// Path of the frame file for `index` under the current location.
    pub fn frame_path(&self, index: FrameIndex) -> Option<PathBuf> {
        let (directory, base_name) = (self.directory.as_ref()?, self.base_name.as_ref()?);
        let file_name = if index.tick == 0 {
            format!("{}Frame{}.{}", base_name, index.frame, FRAME_EXTENSION)
        } else {
            format!("{}Frame{}Tick{}.{}", base_name, index.frame, index.tick, FRAME_EXTENSION)
        };
        Some(directory.join(file_name))
    }

    fn frame_pattern(base_name: &str) -> Result<Regex> {
        let pattern = format!(
            r"^{}Frame([0-9]+)(?:Tick([0-9]))?\.{}$",
            regex::escape(base_name),
            regex::escape(FRAME_EXTENSION)
        );
        Regex::new(&pattern).map_err(|e| Error::other(e.to_string()))
    }

    fn scan(&self) -> Result<Vec<Frame>> {
        let (Some(directory), Some(base_name)) = (&self.directory, &self.base_name) else {
            return Ok(Vec::new());
        };
        let pattern = Self::frame_pattern(base_name)?;

        let mut found = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(caps) = pattern.captures(file_name) else {
                continue;
            };
            let Ok(frame) = caps[1].parse::<u64>() else {
                tracing::warn!(file = file_name, "frame number out of range, skipping");
                continue;
            };
            let tick = match caps.get(2) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|_| Error::other(format!("{}: bad tick '{}'", file_name, m.as_str())))?,
                None => 0,
            };
            found.push((FrameIndex { frame, tick }, entry.path()));
        }
        found.sort();
        tracing::debug!(directory = %directory.display(), frames = found.len(), "scanned frames");

        Ok(found
            .into_iter()
            .map(|(index, path)| Frame::open(Arc::clone(&self.metadata), path, Some(index)))
            .collect())
    }

    /// Frames on disk ordered by frame then tick. The directory is scanned
    /// once; later calls return the same frames.
    pub fn frames(&mut self) -> Result<&mut [Frame]> {
        if self.frames.is_none() {
            self.frames = Some(self.scan()?);
        }
        Ok(self.frames.get_or_insert_with(Vec::new).as_mut_slice())
    }

    /// Number of frames on disk.
    pub fn frame_count(&mut self) -> Result<usize> {
        Ok(self.frames()?.len())
    }

    /// Release every frame's buffers.
    pub fn free(&mut self) {
        if let Some(frames) = &mut self.frames {
            for frame in frames.iter_mut() {
                frame.free();
            }
        }
    }

    /// Decode all frames in parallel. One result per frame, in frame order,
    /// so a bad file does not stop the others.
    pub fn decode_all(&mut self) -> Result<Vec<Result<()>>> {
        let frames = self.frames()?;
        Ok(frames.par_iter_mut().map(Frame::ensure_decoded).collect())
    }

    /// New synthetic frame sharing this cache's metadata.
    pub fn synthetic_frame(&self) -> Frame {
        Frame::synthetic(Arc::clone(&self.metadata))
    }

    /// Set the sidecar time range and mark channels as irregularly sampled.
    ///
    /// Frames already handed out keep the metadata they were created with.
    pub fn update_time_range(&mut self, min: i64, max: i64) {
        Arc::make_mut(&mut self.metadata).update_time_range(min, max);
    }

    /// Write the sidecar.
    pub fn write_metadata(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.metadata.write(path)?;
        tracing::debug!(path = %path.display(), "wrote cache metadata");
        Ok(())
    }

    /// Describe the cache settings and specs.
    pub fn summary(&self) -> CacheSummary {
        CacheSummary {
            xml_path: self.xml_path.clone(),
            time_per_frame: self.metadata.time_per_frame(),
            cache_type: self.metadata.cache_type().to_string(),
            cache_format: self.metadata.cache_format().to_string(),
            time_range: self.metadata.time_range(),
            extra: self
                .metadata
                .extra()
                .iter()
                .flat_map(|(shape, values)| {
                    values
                        .iter()
                        .map(move |(key, value)| (format!("{}.{}", shape, key), value.clone()))
                })
                .collect(),
            shapes: self
                .metadata
                .shape_specs()
                .values()
                .map(|spec| ShapeSpecSummary {
                    name: spec.name().to_string(),
                    dimensions: spec.dimensions(),
                    resolution: spec.resolution(),
                    unit_size: spec.unit_size(),
                })
                .collect(),
            channels: self.metadata.channel_specs().keys().cloned().collect(),
        }
    }
}

/// Deep copy of the metadata with re-derived specs. Frames are not copied.
impl Clone for Cache {
    fn clone(&self) -> Self {
        let metadata = CacheMetadata::from_document(self.metadata.document().clone())
            .unwrap_or_else(|_| (*self.metadata).clone());
        Self {
            metadata: Arc::new(metadata),
            xml_path: self.xml_path.clone(),
            directory: self.directory.clone(),
            base_name: self.base_name.clone(),
            frames: None,
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("xml_path", &self.xml_path)
            .field("shapes", &self.metadata.shape_specs().keys().collect::<Vec<_>>())
            .field("frames", &self.frames.as_ref().map(Vec::len))
            .finish()
    }
}

/// One shape spec in a [`CacheSummary`].
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeSpecSummary {
    pub name: String,
    pub dimensions: DVec3,
    pub resolution: UVec3,
    pub unit_size: DVec3,
}

/// Cache settings, raw geometry extras and specs.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSummary {
    pub xml_path: Option<PathBuf>,
    pub time_per_frame: i64,
    pub cache_type: String,
    pub cache_format: String,
    pub time_range: Option<(i64, i64)>,
    pub extra: Vec<(String, ExtraValue)>,
    pub shapes: Vec<ShapeSpecSummary>,
    pub channels: Vec<String>,
}

impl fmt::Display for CacheSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.xml_path {
            writeln!(f, "{}", path.display())?;
        }
        writeln!(f, "\ttimePerFrame: {}", self.time_per_frame)?;
        writeln!(f, "\tcacheType: {}", self.cache_type)?;
        writeln!(f, "\tcacheFormat: {}", self.cache_format)?;
        if let Some((min, max)) = self.time_range {
            writeln!(f, "\ttime range: {}-{}", min, max)?;
        }
        writeln!(f, "\traw \"extra\" data:")?;
        for (key, value) in &self.extra {
            writeln!(f, "\t\t{}: {:?}", key, value)?;
        }
        writeln!(f, "\tshape specifications:")?;
        for shape in &self.shapes {
            writeln!(f, "\t\t{}:", shape.name)?;
            writeln!(f, "\t\t\tdimensions: {}", shape.dimensions)?;
            writeln!(f, "\t\t\tresolution: {}", shape.resolution)?;
            writeln!(f, "\t\t\tunit_size: {}", shape.unit_size)?;
        }
        writeln!(f, "\tchannel specifications:")?;
        for channel in &self.channels {
            writeln!(f, "\t\t{}", channel)?;
        }
        Ok(())
    }
}
