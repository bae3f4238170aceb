//! Named data channels over a shape's grid.

use std::fmt;

use crate::chunk::Tag;
use crate::util::{Error, Result};

/// What a channel's values mean, parsed from the suffix of its name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Interpretation {
    /// Scalar per cell.
    Density,
    /// Three-component velocity on the staggered face grids.
    Velocity,
    /// Live grid resolution (three values).
    Resolution,
    /// Live domain center (three values).
    Offset,
    /// Anything else. Stored and re-encoded, never sampled.
    Other(String),
}

/// How a channel's flat buffer maps onto the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridLayout {
    /// `width` values per cell, x fastest.
    CellCentered { width: usize },
    /// One scalar per face, x-faces then y-faces then z-faces.
    Staggered,
    /// Shape parameters rather than grid samples.
    Parameters,
}

impl Interpretation {
    pub fn parse(s: &str) -> Self {
        match s {
            "density" => Self::Density,
            "velocity" => Self::Velocity,
            "resolution" => Self::Resolution,
            "offset" => Self::Offset,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Density => "density",
            Self::Velocity => "velocity",
            Self::Resolution => "resolution",
            Self::Offset => "offset",
            Self::Other(s) => s,
        }
    }

    /// Vector width of one sample, or `None` for unknown interpretations.
    pub fn data_size(&self) -> Option<usize> {
        match self {
            Self::Density => Some(1),
            Self::Velocity | Self::Resolution | Self::Offset => Some(3),
            Self::Other(_) => None,
        }
    }

    pub fn layout(&self) -> Option<GridLayout> {
        match self {
            Self::Density => Some(GridLayout::CellCentered { width: 1 }),
            Self::Velocity => Some(GridLayout::Staggered),
            Self::Resolution | Self::Offset => Some(GridLayout::Parameters),
            Self::Other(_) => None,
        }
    }

    /// Whether blending produces a new value for this channel.
    /// Velocity only drives advection.
    pub fn is_blendable(&self) -> bool {
        matches!(self, Self::Density)
    }
}

impl fmt::Display for Interpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a channel in its frame's channel table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A flat numeric buffer tied to one shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    name: String,
    shape: String,
    interpretation: Interpretation,
    data: Vec<f64>,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        shape: impl Into<String>,
        interpretation: Interpretation,
        data: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            interpretation,
            data,
        }
    }

    /// Full channel name, e.g. `fluidShape1_density`.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the shape this channel samples.
    #[inline]
    pub fn shape_name(&self) -> &str {
        &self.shape
    }

    #[inline]
    pub fn interpretation(&self) -> &Interpretation {
        &self.interpretation
    }

    #[inline]
    pub fn data_size(&self) -> Option<usize> {
        self.interpretation.data_size()
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<f64>) {
        self.data = data;
    }

    /// Round every value to the nearest `f32`, the precision frames store.
    ///
    /// Finite values beyond the `f32` range are an error; infinities and NaN
    /// pass through.
    pub fn round_to_f32(&mut self) -> Result<()> {
        for v in &mut self.data {
            let narrow = *v as f32;
            if v.is_finite() && !narrow.is_finite() {
                return Err(Error::NotRepresentable {
                    tag: Tag::FBCA,
                    value: format!("{} in channel {}", v, self.name),
                });
            }
            *v = f64::from(narrow);
        }
        Ok(())
    }

    /// Release the buffer.
    pub fn clear(&mut self) {
        self.data = Vec::new();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpretation_widths() {
        assert_eq!(Interpretation::parse("density").data_size(), Some(1));
        assert_eq!(Interpretation::parse("velocity").data_size(), Some(3));
        assert_eq!(Interpretation::parse("temperature").data_size(), None);
        assert_eq!(Interpretation::parse("temperature").layout(), None);
        assert_eq!(Interpretation::Velocity.layout(), Some(GridLayout::Staggered));
        assert_eq!(Interpretation::parse("fuel").to_string(), "fuel");
    }

    #[test]
    fn test_round_to_f32() {
        let mut c = Channel::new("f_density", "f", Interpretation::Density, vec![0.1, 0.5, f64::NAN]);
        c.round_to_f32().unwrap();
        assert_eq!(c.data()[0], f64::from(0.1f32));
        assert_eq!(c.data()[1], 0.5);
        assert!(c.data()[2].is_nan());

        let mut c = Channel::new("f_density", "f", Interpretation::Density, vec![1e300]);
        assert!(matches!(c.round_to_f32(), Err(Error::NotRepresentable { .. })));
    }

    #[test]
    fn test_clear() {
        let mut c = Channel::new("f_density", "f", Interpretation::Density, vec![1.0; 8]);
        assert_eq!(c.len(), 8);
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.name(), "f_density");
    }
}
