//! Grid geometry of one fluid domain within a frame.
//!
//! A [`Shape`] maps between world space and cell indices and reads samples
//! out of the flat channel buffers its frame owns. Channels are referenced
//! by [`ChannelId`] into the frame's channel table; a [`ShapeView`] pairs a
//! shape with that table for sampling.
//!
//! ## Layouts
//!
//! Cell-centered channels store `width` values per cell, x fastest:
//!
//! ```text
//! offset(xi, yi, zi) = width * (xi + yi*rx + zi*rx*ry)
//! ```
//!
//! Velocity is stored on three face grids, one per component, concatenated:
//!
//! ```text
//! x-faces: (rx+1) * ry     * rz
//! y-faces:  rx    * (ry+1) * rz
//! z-faces:  rx    * ry     * (rz+1)
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use smallvec::SmallVec;

use super::channel::{Channel, ChannelId, GridLayout, Interpretation};
use super::metadata::ShapeSpec;
use crate::util::{clamp01, BBox3d, DVec3, Error, IVec3, Result, UVec3};

/// One sample of a cell-centered channel (`width` values).
pub type Sample = SmallVec<[f64; 3]>;

/// Non-owning record of a shape a blend was derived from.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceRef {
    /// File of the source frame, `None` for synthetic frames.
    pub frame: Option<PathBuf>,
    pub shape: String,
    pub bounds: BBox3d,
}

/// The two sources of a blended shape.
#[derive(Clone, Debug, PartialEq)]
pub struct BlendSources {
    pub a: SourceRef,
    pub b: SourceRef,
}

/// One named fluid domain within one frame.
#[derive(Clone, Debug)]
pub struct Shape {
    spec: Arc<ShapeSpec>,
    resolution: UVec3,
    offset: DVec3,
    bounds: BBox3d,
    channels: BTreeMap<Interpretation, ChannelId>,
    sources: Option<BlendSources>,
}

impl Shape {
    /// Shape with the spec's default resolution, centered on the origin.
    pub fn new(spec: Arc<ShapeSpec>) -> Self {
        let resolution = spec.resolution();
        let mut shape = Self {
            spec,
            resolution,
            offset: DVec3::ZERO,
            bounds: BBox3d::EMPTY,
            channels: BTreeMap::new(),
            sources: None,
        };
        shape.update_bounds();
        shape
    }

    /// Shape with explicit live geometry.
    pub fn with_geometry(spec: Arc<ShapeSpec>, resolution: UVec3, offset: DVec3) -> Result<Self> {
        if resolution.cmpeq(UVec3::ZERO).any() || !offset.is_finite() {
            return Err(Error::other(format!(
                "shape {}: invalid geometry (resolution {}, offset {})",
                spec.name(),
                resolution,
                offset
            )));
        }
        let mut shape = Self::new(spec);
        shape.resolution = resolution;
        shape.offset = offset;
        shape.update_bounds();
        Ok(shape)
    }

    fn update_bounds(&mut self) {
        let size = self.resolution.as_dvec3() * self.spec.unit_size();
        self.bounds = BBox3d::from_center_size(self.offset, size);
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    #[inline]
    pub fn spec(&self) -> &Arc<ShapeSpec> {
        &self.spec
    }

    #[inline]
    pub fn resolution(&self) -> UVec3 {
        self.resolution
    }

    /// Domain center.
    #[inline]
    pub fn offset(&self) -> DVec3 {
        self.offset
    }

    #[inline]
    pub fn unit_size(&self) -> DVec3 {
        self.spec.unit_size()
    }

    #[inline]
    pub fn bounds(&self) -> BBox3d {
        self.bounds
    }

    #[inline]
    pub fn bb_min(&self) -> DVec3 {
        self.bounds.min
    }

    #[inline]
    pub fn bb_max(&self) -> DVec3 {
        self.bounds.max
    }

    /// Channels attached to this shape, by interpretation.
    pub fn channel_ids(&self) -> &BTreeMap<Interpretation, ChannelId> {
        &self.channels
    }

    pub fn channel_id(&self, interpretation: &Interpretation) -> Option<ChannelId> {
        self.channels.get(interpretation).copied()
    }

    pub(crate) fn attach(&mut self, interpretation: Interpretation, id: ChannelId) {
        self.channels.insert(interpretation, id);
    }

    pub(crate) fn detach_all(&mut self) {
        self.channels.clear();
    }

    /// Blend ancestry, if this shape was produced by a blend.
    pub fn sources(&self) -> Option<&BlendSources> {
        self.sources.as_ref()
    }

    pub(crate) fn set_sources(&mut self, sources: BlendSources) {
        self.sources = Some(sources);
    }

    /// Apply live `resolution` / `offset` channels, recompute bounds and
    /// check every attached channel against the grid.
    pub fn finalize(&mut self, channels: &[Channel]) -> Result<()> {
        let spec = Arc::clone(&self.spec);
        let get = |id: ChannelId| {
            channels
                .get(id.index())
                .ok_or_else(|| Error::other(format!("shape {}: dangling channel id {}", spec.name(), id.index())))
        };

        self.resolution = match self.channel_id(&Interpretation::Resolution) {
            Some(id) => parse_resolution(get(id)?)?,
            None => self.spec.resolution(),
        };
        self.offset = match self.channel_id(&Interpretation::Offset) {
            Some(id) => parse_offset(get(id)?)?,
            None => DVec3::ZERO,
        };
        self.update_bounds();

        for (interpretation, &id) in &self.channels {
            let channel = get(id)?;
            if let Some(expected) = self.expected_len(interpretation) {
                if channel.len() != expected {
                    return Err(Error::ChannelSize {
                        channel: channel.name().to_string(),
                        expected,
                        actual: channel.len(),
                    });
                }
            }
        }
        tracing::trace!(
            shape = self.name(),
            resolution = %self.resolution,
            offset = %self.offset,
            "finalized shape"
        );
        Ok(())
    }

    /// Number of cells.
    pub fn cell_count(&self) -> usize {
        let r = self.resolution;
        r.x as usize * r.y as usize * r.z as usize
    }

    /// Number of values in a staggered velocity channel.
    pub fn staggered_len(&self) -> usize {
        let (x, y, z) = (self.resolution.x as usize, self.resolution.y as usize, self.resolution.z as usize);
        (x + 1) * y * z + x * (y + 1) * z + x * y * (z + 1)
    }

    /// Buffer length a channel of this interpretation must have, if known.
    pub fn expected_len(&self, interpretation: &Interpretation) -> Option<usize> {
        Some(match interpretation.layout()? {
            GridLayout::CellCentered { width } => self.cell_count() * width,
            GridLayout::Staggered => self.staggered_len(),
            GridLayout::Parameters => 3,
        })
    }

    /// Cell centers in storage order (z outermost, x innermost).
    pub fn iter_centers(&self) -> impl Iterator<Item = DVec3> + '_ {
        let r = self.resolution.as_ivec3();
        (0..r.z).flat_map(move |z| {
            (0..r.y).flat_map(move |y| (0..r.x).map(move |x| self.point_for_index(IVec3::new(x, y, z))))
        })
    }

    /// Cell containing `point`.
    ///
    /// Points outside the grid map to `-1` or `resolution` on the offending
    /// axis, so neighbor arithmetic cannot overflow.
    pub fn index_for_point(&self, point: DVec3) -> IVec3 {
        ((point - self.bounds.min) / self.unit_size())
            .floor()
            .clamp(DVec3::splat(-1.0), self.resolution.as_dvec3())
            .as_ivec3()
    }

    /// World-space center of a cell.
    pub fn point_for_index(&self, index: IVec3) -> DVec3 {
        self.bounds.min + self.unit_size() * (index.as_dvec3() + 0.5)
    }

    /// Whether a cell index lies inside the grid.
    pub fn contains_index(&self, index: IVec3) -> bool {
        index.cmpge(IVec3::ZERO).all() && index.as_uvec3().cmplt(self.resolution).all()
    }

    /// Flat buffer offset of a cell for a channel `width` values wide.
    pub fn data_index(&self, index: IVec3, width: usize) -> Option<usize> {
        if !self.contains_index(index) {
            return None;
        }
        let (rx, ry) = (self.resolution.x as usize, self.resolution.y as usize);
        let (x, y, z) = (index.x as usize, index.y as usize, index.z as usize);
        Some(width * (x + y * rx + z * rx * ry))
    }

    fn cell_width(&self, channel: &Channel) -> Result<usize> {
        match channel.interpretation().layout() {
            Some(GridLayout::CellCentered { width }) => {
                let expected = self.cell_count() * width;
                if channel.len() != expected {
                    return Err(Error::ChannelSize {
                        channel: channel.name().to_string(),
                        expected,
                        actual: channel.len(),
                    });
                }
                Ok(width)
            }
            Some(GridLayout::Staggered | GridLayout::Parameters) => Err(Error::WrongLayout {
                channel: channel.name().to_string(),
                expected: "cell-centered",
            }),
            None => Err(Error::UnknownInterpretation {
                channel: channel.name().to_string(),
                interpretation: channel.interpretation().to_string(),
            }),
        }
    }

    /// Append the sample at `index` to `out`, or zeros outside the grid.
    fn push_cell(&self, data: &[f64], index: IVec3, width: usize, out: &mut Sample) {
        match self.data_index(index, width) {
            Some(i) => out.extend_from_slice(&data[i..i + width]),
            None => out.extend(std::iter::repeat(0.0).take(width)),
        }
    }

    /// Sample a cell-centered channel at a world point.
    ///
    /// Without `interpolate` this reads the containing cell. With it, the
    /// cell and its seven upper neighbors are blended trilinearly, reducing
    /// along z, then y, then x. Neighbors outside the grid read as zero; a
    /// point whose own cell is outside the grid samples as all zeros.
    pub fn lookup_value(&self, channel: &Channel, point: DVec3, interpolate: bool) -> Result<Sample> {
        let width = self.cell_width(channel)?;
        let data = channel.data();
        let base = self.index_for_point(point);

        let mut values = Sample::new();
        if !interpolate || !self.contains_index(base) {
            self.push_cell(data, base, width, &mut values);
            return Ok(values);
        }

        let unit = self.unit_size();
        let t = (point - self.point_for_index(base)) / unit;
        let weights = [clamp01(t.z), clamp01(t.y), clamp01(t.x)];

        let mut corners: SmallVec<[f64; 24]> = SmallVec::with_capacity(8 * width);
        let mut cell = Sample::new();
        for dx in 0..2 {
            for dy in 0..2 {
                for dz in 0..2 {
                    cell.clear();
                    self.push_cell(data, base + IVec3::new(dx, dy, dz), width, &mut cell);
                    corners.extend_from_slice(&cell);
                }
            }
        }

        for weight in weights {
            let pairs = corners.len() / (2 * width);
            let mut next: SmallVec<[f64; 24]> = SmallVec::with_capacity(pairs * width);
            for p in 0..pairs {
                let low = &corners[2 * p * width..(2 * p + 1) * width];
                let high = &corners[(2 * p + 1) * width..(2 * p + 2) * width];
                next.extend(low.iter().zip(high).map(|(a, b)| a * (1.0 - weight) + b * weight));
            }
            corners = next;
        }
        values.extend_from_slice(&corners);
        Ok(values)
    }

    /// Read the three face velocities of the cell containing `point`.
    ///
    /// No interpolation; the zero vector outside the grid.
    pub fn lookup_velocity(&self, channel: &Channel, point: DVec3) -> Result<DVec3> {
        if channel.interpretation().layout() != Some(GridLayout::Staggered) {
            return Err(Error::WrongLayout {
                channel: channel.name().to_string(),
                expected: "staggered",
            });
        }
        let expected = self.staggered_len();
        if channel.len() != expected {
            return Err(Error::ChannelSize {
                channel: channel.name().to_string(),
                expected,
                actual: channel.len(),
            });
        }

        let index = self.index_for_point(point);
        if !self.contains_index(index) {
            return Ok(DVec3::ZERO);
        }
        let (xr, yr, zr) = (self.resolution.x as usize, self.resolution.y as usize, self.resolution.z as usize);
        let (xi, yi, zi) = (index.x as usize, index.y as usize, index.z as usize);
        let x_faces = (xr + 1) * yr * zr;
        let y_faces = xr * (yr + 1) * zr;

        let data = channel.data();
        Ok(DVec3::new(
            data[xi + yi * (xr + 1) + zi * (xr + 1) * yr],
            data[xi + (yi + 1) * xr + zi * xr * (yr + 1) + x_faces],
            data[xi + yi * xr + (zi + 1) * xr * yr + x_faces + y_faces],
        ))
    }
}

/// Values must be three finite, positive, integral-after-rounding counts.
fn parse_resolution(channel: &Channel) -> Result<UVec3> {
    let v = three(channel)?;
    let mut out = [0u32; 3];
    for (o, &x) in out.iter_mut().zip(v) {
        let r = x.round();
        if !r.is_finite() || r < 1.0 || r > f64::from(u32::MAX) {
            return Err(Error::other(format!(
                "channel {}: {} is not a valid resolution",
                channel.name(),
                x
            )));
        }
        *o = r as u32;
    }
    Ok(UVec3::from_array(out))
}

fn parse_offset(channel: &Channel) -> Result<DVec3> {
    let v = DVec3::from_slice(three(channel)?);
    if !v.is_finite() {
        return Err(Error::other(format!("channel {}: offset {} is not finite", channel.name(), v)));
    }
    Ok(v)
}

fn three(channel: &Channel) -> Result<&[f64]> {
    if channel.len() != 3 {
        return Err(Error::ChannelSize {
            channel: channel.name().to_string(),
            expected: 3,
            actual: channel.len(),
        });
    }
    Ok(channel.data())
}

/// A shape together with its frame's channel table.
#[derive(Clone, Copy, Debug)]
pub struct ShapeView<'a> {
    shape: &'a Shape,
    channels: &'a [Channel],
}

impl<'a> ShapeView<'a> {
    pub fn new(shape: &'a Shape, channels: &'a [Channel]) -> Self {
        Self { shape, channels }
    }

    #[inline]
    pub fn shape(&self) -> &'a Shape {
        self.shape
    }

    pub fn channel(&self, interpretation: &Interpretation) -> Option<&'a Channel> {
        self.shape
            .channel_id(interpretation)
            .and_then(|id| self.channels.get(id.index()))
    }

    /// Like [`channel`](Self::channel), failing when absent.
    pub fn require(&self, interpretation: &Interpretation) -> Result<&'a Channel> {
        self.channel(interpretation).ok_or_else(|| Error::ChannelNotFound {
            shape: self.shape.name().to_string(),
            interpretation: interpretation.to_string(),
        })
    }

    /// Attached channels in interpretation order.
    pub fn channels(&self) -> impl Iterator<Item = (&'a Interpretation, &'a Channel)> + 'a {
        let channels = self.channels;
        self.shape
            .channel_ids()
            .iter()
            .filter_map(move |(i, id)| channels.get(id.index()).map(|c| (i, c)))
    }

    pub fn sample(&self, interpretation: &Interpretation, point: DVec3, interpolate: bool) -> Result<Sample> {
        self.shape.lookup_value(self.require(interpretation)?, point, interpolate)
    }

    pub fn velocity(&self, point: DVec3) -> Result<DVec3> {
        self.shape.lookup_velocity(self.require(&Interpretation::Velocity)?, point)
    }
}
