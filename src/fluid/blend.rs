//! Blending two frames of the same fluid domain into a new shape.
//!
//! The blended shape spans the union of both sources' bounds. Each
//! blendable channel is resampled at the new cell centers as
//! `a * (1 - factor) + b * factor`. With advection, the sample points are
//! first moved along each source's velocity so density follows the flow
//! instead of cross-fading in place.

use std::path::PathBuf;

use rayon::prelude::*;

use super::channel::{Channel, Interpretation};
use super::frame::Frame;
use super::shape::{BlendSources, Sample, Shape, ShapeView, SourceRef};
use crate::util::{DVec3, Error, Result, UVec3};

/// Velocity is divided by this before displacing sample points.
pub const ADVECTION_SUBSTEPS: f64 = 24.0;

/// Relative slack when checking that rounded extents still cover the union.
const EXTENT_TOLERANCE: f64 = 1e-9;

/// Progress callbacks for long blends. Every method defaults to a no-op.
pub trait BlendObserver {
    fn shape_started(&mut self, _shape: &str, _resolution: UVec3) {}
    fn channel_started(&mut self, _shape: &str, _interpretation: &Interpretation, _advect: bool) {}
    fn channel_finished(&mut self, _shape: &str, _interpretation: &Interpretation, _values: usize) {}
}

impl BlendObserver for () {}

/// Reports blend progress as `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl BlendObserver for TracingObserver {
    fn shape_started(&mut self, shape: &str, resolution: UVec3) {
        tracing::info!(shape, %resolution, "blending shape");
    }

    fn channel_started(&mut self, shape: &str, interpretation: &Interpretation, advect: bool) {
        tracing::info!(shape, %interpretation, advect, "blending channel");
    }

    fn channel_finished(&mut self, shape: &str, interpretation: &Interpretation, values: usize) {
        tracing::debug!(shape, %interpretation, values, "blended channel");
    }
}

/// One side of a blend.
#[derive(Debug)]
pub enum BlendSource<'a> {
    /// A decoded frame; its shape with the blend's name is used.
    Frame(&'a Frame),
    /// A frame that is decoded first if it has not been yet.
    Decode(&'a mut Frame),
    /// A shape given directly.
    Shape(ShapeView<'a>),
}

impl<'a> From<&'a Frame> for BlendSource<'a> {
    fn from(frame: &'a Frame) -> Self {
        Self::Frame(frame)
    }
}

impl<'a> From<&'a mut Frame> for BlendSource<'a> {
    fn from(frame: &'a mut Frame) -> Self {
        Self::Decode(frame)
    }
}

impl<'a> From<ShapeView<'a>> for BlendSource<'a> {
    fn from(view: ShapeView<'a>) -> Self {
        Self::Shape(view)
    }
}

impl<'a> BlendSource<'a> {
    fn resolve(self, name: &str) -> Result<(ShapeView<'a>, Option<PathBuf>)> {
        let frame: &'a Frame = match self {
            Self::Frame(frame) => frame,
            Self::Decode(frame) => {
                frame.ensure_decoded()?;
                let frame: &'a Frame = frame;
                frame
            }
            Self::Shape(view) => return Ok((view, None)),
        };
        Ok((frame.view(name)?, frame.path().map(PathBuf::from)))
    }
}

/// A blended shape in a target frame, bound to its two sources.
pub struct BlendEngine<'a, 't> {
    target: &'t mut Frame,
    name: String,
    a: ShapeView<'a>,
    b: ShapeView<'a>,
}

impl<'a, 't> BlendEngine<'a, 't> {
    /// Create the blended shape `name` in `target` with `resolution` and
    /// `offset` channels describing bounds that cover both sources.
    ///
    /// Resolution is the union extent over source A's cell size, rounded to
    /// the nearest count and grown by one cell where rounding would fall
    /// short of the union.
    pub fn setup(
        target: &'t mut Frame,
        name: &str,
        a: impl Into<BlendSource<'a>>,
        b: impl Into<BlendSource<'a>>,
    ) -> Result<Self> {
        let spec = target
            .metadata()
            .shape_spec(name)
            .cloned()
            .ok_or_else(|| Error::ShapeNotFound(name.to_string()))?;
        let (a, a_path) = a.into().resolve(name)?;
        let (b, b_path) = b.into().resolve(name)?;

        let union = a.shape().bounds().union(&b.shape().bounds());
        let size = union.size();
        let unit = a.shape().unit_size();
        // The offset is stored as f32, so measure coverage from the rounded center.
        let offset = union.center().as_vec3().as_dvec3();
        let reach = (offset - union.min).max(union.max - offset) * 2.0;
        let mut counts = (size / unit).round().max(DVec3::ONE);
        for axis in 0..3 {
            if counts[axis] * unit[axis] < reach[axis] * (1.0 - EXTENT_TOLERANCE) {
                counts[axis] += 1.0;
            }
        }
        if !offset.is_finite() || !counts.is_finite() || counts.max_element() > f64::from(u32::MAX) {
            return Err(Error::other(format!("blend of {}: bounds {:?} cannot be gridded", name, union)));
        }
        let resolution = counts.as_uvec3();

        let mut shape = Shape::with_geometry(spec, resolution, offset)?;
        shape.set_sources(BlendSources {
            a: SourceRef {
                frame: a_path,
                shape: a.shape().name().to_string(),
                bounds: a.shape().bounds(),
            },
            b: SourceRef {
                frame: b_path,
                shape: b.shape().name().to_string(),
                bounds: b.shape().bounds(),
            },
        });
        target.insert_shape(shape)?;
        target.insert_channel(Channel::new(
            format!("{}_resolution", name),
            name,
            Interpretation::Resolution,
            resolution.as_dvec3().to_array().to_vec(),
        ))?;
        target.insert_channel(Channel::new(
            format!("{}_offset", name),
            name,
            Interpretation::Offset,
            offset.to_array().to_vec(),
        ))?;
        target.finalize_shape(name)?;

        tracing::debug!(shape = name, %resolution, %offset, "set up blend");
        Ok(Self {
            target,
            name: name.to_string(),
            a,
            b,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The blended shape as it currently stands in the target frame.
    pub fn shape(&self) -> Result<&Shape> {
        Ok(self.target.view(&self.name)?.shape())
    }

    /// Blend with progress reported through `tracing`.
    pub fn blend(&mut self, factor: f64, advect: bool) -> Result<()> {
        self.blend_with(factor, advect, &mut TracingObserver)
    }

    /// Fill every blendable channel of source A into the target shape.
    ///
    /// `factor` is not range checked; values outside `[0, 1]` extrapolate.
    /// Advection only happens when both sources carry velocity.
    pub fn blend_with(&mut self, factor: f64, advect: bool, observer: &mut dyn BlendObserver) -> Result<()> {
        let shape = self.shape()?.clone();
        let velocity = match (
            self.a.channel(&Interpretation::Velocity),
            self.b.channel(&Interpretation::Velocity),
        ) {
            (Some(va), Some(vb)) if advect => Some((va, vb)),
            _ => {
                if advect {
                    tracing::debug!(shape = %self.name, "a source has no velocity, advection disabled");
                }
                None
            }
        };

        observer.shape_started(&self.name, shape.resolution());
        let centers: Vec<DVec3> = shape.iter_centers().collect();

        let interpretations: Vec<Interpretation> = self
            .a
            .channels()
            .map(|(interpretation, _)| interpretation)
            .filter(|interpretation| interpretation.is_blendable())
            .cloned()
            .collect();

        for interpretation in interpretations {
            observer.channel_started(&self.name, &interpretation, velocity.is_some());
            let (a, b) = (self.a, self.b);
            let a_channel = a.require(&interpretation)?;
            let b_channel = b.require(&interpretation)?;
            let interpolate = velocity.is_some();

            let samples = centers
                .par_iter()
                .map(|&center| -> Result<Sample> {
                    let (mut pa, mut pb) = (center, center);
                    if let Some((va, vb)) = velocity {
                        pa -= factor * a.shape().lookup_velocity(va, center)? / ADVECTION_SUBSTEPS;
                        pb += (1.0 - factor) * b.shape().lookup_velocity(vb, center)? / ADVECTION_SUBSTEPS;
                    }
                    let sa = a.shape().lookup_value(a_channel, pa, interpolate)?;
                    let sb = b.shape().lookup_value(b_channel, pb, interpolate)?;
                    Ok(sa.iter().zip(&sb).map(|(x, y)| x * (1.0 - factor) + y * factor).collect())
                })
                .collect::<Result<Vec<Sample>>>()?;
            let data: Vec<f64> = samples.into_iter().flatten().collect();

            observer.channel_finished(&self.name, &interpretation, data.len());
            self.target.insert_channel(Channel::new(
                format!("{}_{}", self.name, interpretation),
                self.name.as_str(),
                interpretation,
                data,
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid::frame::FrameState;
    use crate::fluid::metadata::CacheMetadata;
    use crate::util::{BBox3d, IVec3};
    use std::sync::Arc;

    const SIDECAR: &str = r#"<Autodesk_Cache_File>
  <cacheType Type="OneFilePerFrame" Format="mcc"/>
  <cacheTimePerFrame TimePerFrame="250"/>
  <extra>fluid1.dimensionsW=10</extra>
  <extra>fluid1.dimensionsH=10</extra>
  <extra>fluid1.dimensionsD=10</extra>
  <extra>fluid1.resolutionW=5</extra>
  <extra>fluid1.resolutionH=5</extra>
  <extra>fluid1.resolutionD=5</extra>
  <Channels>
    <c0 ChannelName="fluid1_density" ChannelInterpretation="density"/>
    <c1 ChannelName="fluid1_velocity" ChannelInterpretation="velocity"/>
  </Channels>
</Autodesk_Cache_File>"#;

    fn metadata() -> Arc<CacheMetadata> {
        Arc::new(CacheMetadata::parse(SIDECAR).unwrap())
    }

    /// 5x5x5 source centered on `offset`, density from `f(cell index)`.
    fn source(
        meta: &Arc<CacheMetadata>,
        offset: DVec3,
        f: impl Fn(usize) -> f64,
        velocity: Option<f64>,
    ) -> Result<Frame> {
        let mut frame = Frame::synthetic(Arc::clone(meta));
        let spec = meta.shape_spec("fluid1").cloned().unwrap();
        let shape = Shape::new(spec);
        let (cells, faces) = (shape.cell_count(), shape.staggered_len());
        frame.insert_shape(shape)?;
        frame.insert_channel(Channel::new("fluid1_offset", "fluid1", Interpretation::Offset, offset.to_array().to_vec()))?;
        frame.insert_channel(Channel::new(
            "fluid1_density",
            "fluid1",
            Interpretation::Density,
            (0..cells).map(f).collect(),
        ))?;
        if let Some(v) = velocity {
            frame.insert_channel(Channel::new("fluid1_velocity", "fluid1", Interpretation::Velocity, vec![v; faces]))?;
        }
        frame.finalize_shape("fluid1")?;
        frame.set_times(250, 250)?;
        Ok(frame)
    }

    fn density(frame: &Frame) -> Vec<f64> {
        frame
            .view("fluid1")
            .and_then(|v| v.require(&Interpretation::Density).map(|c| c.data().to_vec()))
            .unwrap()
    }

    #[test]
    fn test_factor_endpoints_reproduce_sources() -> Result<()> {
        let meta = metadata();
        let a = source(&meta, DVec3::ZERO, |i| i as f64, None)?;
        let b = source(&meta, DVec3::ZERO, |i| 1000.0 - i as f64, None)?;

        for (factor, expected) in [(0.0, density(&a)), (1.0, density(&b))] {
            let mut out = Frame::synthetic(Arc::clone(&meta));
            let mut engine = BlendEngine::setup(&mut out, "fluid1", &a, &b)?;
            engine.blend_with(factor, false, &mut ())?;
            assert_eq!(density(&out), expected, "factor {factor}");
        }
        Ok(())
    }

    #[test]
    fn test_bounds_cover_union() -> Result<()> {
        let meta = metadata();
        let a = source(&meta, DVec3::ZERO, |_| 1.0, None)?;
        let b = source(&meta, DVec3::new(3.0, -4.0, 0.5), |_| 2.0, None)?;

        let mut out = Frame::synthetic(Arc::clone(&meta));
        let engine = BlendEngine::setup(&mut out, "fluid1", &a, &b)?;
        let shape = engine.shape()?;
        let union = a.view("fluid1")?.shape().bounds().union(&b.view("fluid1")?.shape().bounds());
        assert!(shape.bounds().contains_box(&union, 1e-9));
        assert_eq!(shape.resolution(), UVec3::new(7, 7, 6));
        assert_eq!(shape.offset(), union.center());
        let sources = shape.sources().expect("sources");
        assert_eq!(sources.b.bounds, b.view("fluid1")?.shape().bounds());

        let extent = shape.bb_max() - shape.bb_min();
        assert!((extent - shape.resolution().as_dvec3() * shape.unit_size()).abs().max_element() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_output_channels() -> Result<()> {
        let meta = metadata();
        let a = source(&meta, DVec3::ZERO, |_| 1.0, Some(0.0))?;
        let b = source(&meta, DVec3::ZERO, |_| 3.0, Some(0.0))?;

        let mut out = Frame::synthetic(Arc::clone(&meta));
        BlendEngine::setup(&mut out, "fluid1", &a, &b)?.blend(0.25, true)?;

        let names: Vec<String> = out.channels()?.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, ["fluid1_resolution", "fluid1_offset", "fluid1_density"]);
        assert!(density(&out).iter().all(|&v| v == 1.5));
        Ok(())
    }

    #[test]
    fn test_advection_moves_samples() -> Result<()> {
        let meta = metadata();
        // Negative velocity pushes A's sample point a quarter cell up every axis.
        let a = source(&meta, DVec3::ZERO, |i| i as f64, Some(-ADVECTION_SUBSTEPS))?;
        let b = source(&meta, DVec3::ZERO, |_| 0.0, Some(0.0))?;

        let mut out = Frame::synthetic(Arc::clone(&meta));
        let mut engine = BlendEngine::setup(&mut out, "fluid1", &a, &b)?;
        engine.blend_with(0.5, true, &mut ())?;
        let shape = engine.shape()?.clone();

        let i = shape.data_index(IVec3::new(1, 0, 0), 1).unwrap();
        let values = density(&out);
        // A is linear in the cell index, so the trilinear sample at
        // (1.25, 0.25, 0.25) is 1.25 + 5 * 0.25 + 25 * 0.25.
        assert_eq!(values[i], 0.5 * 8.75);

        let mut plain = Frame::synthetic(Arc::clone(&meta));
        BlendEngine::setup(&mut plain, "fluid1", &a, &b)?.blend_with(0.5, false, &mut ())?;
        assert_eq!(density(&plain)[i], 0.5);
        Ok(())
    }

    #[test]
    fn test_advection_needs_both_velocities() -> Result<()> {
        let meta = metadata();
        let a = source(&meta, DVec3::ZERO, |i| i as f64, Some(-ADVECTION_SUBSTEPS))?;
        let b = source(&meta, DVec3::ZERO, |_| 0.0, None)?;

        let mut out = Frame::synthetic(Arc::clone(&meta));
        BlendEngine::setup(&mut out, "fluid1", &a, &b)?.blend_with(0.5, true, &mut ())?;
        let expected: Vec<f64> = density(&a).iter().map(|v| v * 0.5).collect();
        assert_eq!(density(&out), expected);
        Ok(())
    }

    #[test]
    fn test_missing_density_in_b() -> Result<()> {
        let meta = metadata();
        let a = source(&meta, DVec3::ZERO, |_| 1.0, None)?;
        let mut b = Frame::synthetic(Arc::clone(&meta));
        b.insert_shape(Shape::new(meta.shape_spec("fluid1").cloned().unwrap()))?;

        let mut out = Frame::synthetic(Arc::clone(&meta));
        let err = BlendEngine::setup(&mut out, "fluid1", &a, &b)?
            .blend_with(0.5, false, &mut ())
            .unwrap_err();
        assert!(matches!(err, Error::ChannelNotFound { .. }));
        Ok(())
    }

    #[test]
    fn test_shape_source() -> Result<()> {
        let meta = metadata();
        let a = source(&meta, DVec3::ZERO, |_| 4.0, None)?;
        let b = source(&meta, DVec3::ZERO, |_| 8.0, None)?;

        let mut out = Frame::synthetic(Arc::clone(&meta));
        let mut engine = BlendEngine::setup(&mut out, "fluid1", a.view("fluid1")?, &b)?;
        engine.blend_with(0.5, false, &mut ())?;
        assert_eq!(engine.shape()?.sources().map(|s| s.a.frame.clone()), Some(None));
        assert_eq!(engine.shape()?.bounds(), BBox3d::new(DVec3::splat(-5.0), DVec3::splat(5.0)));
        Ok(())
    }

    #[test]
    fn test_sources_decode_on_demand() -> Result<()> {
        let meta = metadata();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("aFrame1.mc");
        source(&meta, DVec3::ZERO, |i| i as f64, None)?.write(&path)?;

        let mut a = Frame::open(Arc::clone(&meta), &path, None);
        let mut b = Frame::open(Arc::clone(&meta), &path, None);
        let mut out = Frame::synthetic(Arc::clone(&meta));
        BlendEngine::setup(&mut out, "fluid1", &mut a, &mut b)?.blend(0.5, false)?;
        assert_eq!(a.state(), FrameState::FullyDecoded);
        assert_eq!(density(&out), (0..125).map(|i| i as f64).collect::<Vec<_>>());

        // A borrowed frame is not decoded behind the caller's back
        let c = Frame::open(Arc::clone(&meta), &path, None);
        let err = BlendEngine::setup(&mut out, "fluid1", &c, &b).err().unwrap();
        assert!(matches!(err, Error::FrameNotDecoded(_)));

        let mut missing = Frame::open(Arc::clone(&meta), dir.path().join("bFrame1.mc"), None);
        let err = BlendEngine::setup(&mut out, "fluid1", &mut missing, &b).err().unwrap();
        assert!(matches!(err.root_cause(), Error::FileNotFound(_)));
        Ok(())
    }
}
