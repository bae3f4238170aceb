//! Cache sidecar metadata.
//!
//! The XML sidecar declares the cache layout, per-shape grid geometry
//! (through `extra` lines such as `fluidShape1.resolutionW=32`) and the
//! list of channels stored in every frame file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use super::channel::Interpretation;
use super::xml::{XmlDocument, XmlElement};
use crate::util::{DVec3, Error, Result, UVec3};

/// The only supported tick count per frame.
pub const TIME_PER_FRAME: i64 = 250;

/// The only supported cache type.
pub const CACHE_TYPE: &str = "OneFilePerFrame";

/// The only supported container format.
pub const CACHE_FORMAT: &str = "mcc";

/// File extension of per-frame files in `mcc` caches.
pub const FRAME_EXTENSION: &str = "mc";

/// `extra` keys that carry shape geometry; everything else is ignored.
const GEOMETRY_KEYS: [&str; 6] = [
    "dimensionsW",
    "dimensionsH",
    "dimensionsD",
    "resolutionW",
    "resolutionH",
    "resolutionD",
];

static EXTRA_PATTERN: OnceLock<Regex> = OnceLock::new();

fn extra_pattern() -> &'static Regex {
    EXTRA_PATTERN.get_or_init(|| Regex::new(r"^([^.]+)\.(\w+)=(.+)$").expect("Invalid extra regex pattern"))
}

/// Literal value of an `extra` line.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtraValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl ExtraValue {
    /// Parse a scalar literal, falling back to the raw text.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        match s {
            "True" => return Self::Bool(true),
            "False" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(v) = s.parse::<i64>() {
            return Self::Int(v);
        }
        let numeric = !s.is_empty()
            && s.chars().any(|c| c.is_ascii_digit())
            && s.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
        if numeric {
            if let Ok(v) = s.parse::<f64>() {
                return Self::Float(v);
            }
        }
        for quote in ['\'', '"'] {
            if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
                return Self::Str(s[1..s.len() - 1].to_string());
            }
        }
        Self::Str(raw.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }
}

/// Grid geometry declared for one shape.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeSpec {
    name: String,
    dimensions: DVec3,
    resolution: UVec3,
    unit_size: DVec3,
}

impl ShapeSpec {
    pub fn new(name: impl Into<String>, dimensions: DVec3, resolution: UVec3) -> Result<Self> {
        let name = name.into();
        if resolution.cmpeq(UVec3::ZERO).any() {
            return Err(Error::metadata(format!("shape {}: zero resolution {}", name, resolution)));
        }
        if !dimensions.is_finite() || dimensions.cmple(DVec3::ZERO).any() {
            return Err(Error::metadata(format!("shape {}: bad dimensions {}", name, dimensions)));
        }
        Ok(Self {
            unit_size: dimensions / resolution.as_dvec3(),
            name,
            dimensions,
            resolution,
        })
    }

    fn from_extra(name: &str, extra: &BTreeMap<String, ExtraValue>) -> Result<Self> {
        let get = |key: &str| -> Result<f64> {
            extra
                .get(key)
                .ok_or_else(|| Error::metadata(format!("shape {}: missing {}", name, key)))?
                .as_f64()
                .ok_or_else(|| Error::metadata(format!("shape {}: {} is not numeric", name, key)))
        };
        let get_res = |key: &str| -> Result<u32> {
            let v = get(key)?;
            if v.fract() != 0.0 || v < 0.0 || v > f64::from(u32::MAX) {
                return Err(Error::metadata(format!("shape {}: {} = {} is not a count", name, key, v)));
            }
            Ok(v as u32)
        };
        let dimensions = DVec3::new(get("dimensionsW")?, get("dimensionsH")?, get("dimensionsD")?);
        let resolution = UVec3::new(
            get_res("resolutionW")?,
            get_res("resolutionH")?,
            get_res("resolutionD")?,
        );
        Self::new(name, dimensions, resolution)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// World-space extent of the domain.
    #[inline]
    pub fn dimensions(&self) -> DVec3 {
        self.dimensions
    }

    /// Default cell counts.
    #[inline]
    pub fn resolution(&self) -> UVec3 {
        self.resolution
    }

    /// Cell size, `dimensions / resolution`.
    #[inline]
    pub fn unit_size(&self) -> DVec3 {
        self.unit_size
    }
}

/// Declared channel: `<shape>_<interpretation>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    name: String,
    shape: String,
    interpretation: Interpretation,
}

impl ChannelSpec {
    /// Split a channel name on its last underscore.
    pub fn parse(name: &str) -> Result<Self> {
        let (shape, interpretation) = name
            .rsplit_once('_')
            .filter(|(s, i)| !s.is_empty() && !i.is_empty())
            .ok_or_else(|| Error::metadata(format!("channel name '{}' has no <shape>_<interpretation> form", name)))?;
        Ok(Self {
            name: name.to_string(),
            shape: shape.to_string(),
            interpretation: Interpretation::parse(interpretation),
        })
    }

    /// Parse a `Channels` entry; a declared interpretation must match the name.
    fn from_element(element: &XmlElement) -> Result<Self> {
        let name = element.attr("ChannelName").ok_or_else(|| {
            Error::metadata(format!("channel element <{}> has no ChannelName", element.name()))
        })?;
        let spec = Self::parse(name)?;
        if let Some(declared) = element.attr("ChannelInterpretation") {
            if !declared.is_empty() && declared != spec.interpretation.as_str() {
                return Err(Error::metadata(format!(
                    "channel {} declares interpretation '{}'",
                    name, declared
                )));
            }
        }
        Ok(spec)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn shape_name(&self) -> &str {
        &self.shape
    }

    #[inline]
    pub fn interpretation(&self) -> &Interpretation {
        &self.interpretation
    }
}

/// Typed view of a sidecar, plus the document for writing it back.
#[derive(Clone, Debug)]
pub struct CacheMetadata {
    document: XmlDocument,
    time_per_frame: i64,
    cache_type: String,
    cache_format: String,
    time_range: Option<(i64, i64)>,
    extra: BTreeMap<String, BTreeMap<String, ExtraValue>>,
    shape_specs: BTreeMap<String, Arc<ShapeSpec>>,
    channel_specs: BTreeMap<String, ChannelSpec>,
}

impl CacheMetadata {
    /// Read and validate a sidecar file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_document(XmlDocument::read(path)?)
    }

    /// Parse and validate sidecar text.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_document(XmlDocument::parse(text)?)
    }

    /// Derive all typed settings and specs from a document.
    pub fn from_document(document: XmlDocument) -> Result<Self> {
        let root = document.root();

        let time_per_frame = root
            .find("cacheTimePerFrame")
            .and_then(|e| e.attr("TimePerFrame"))
            .ok_or_else(|| Error::metadata("missing cacheTimePerFrame/@TimePerFrame"))?;
        let time_per_frame: i64 = time_per_frame
            .trim()
            .parse()
            .map_err(|_| Error::metadata(format!("TimePerFrame '{}' is not an integer", time_per_frame)))?;
        if time_per_frame != TIME_PER_FRAME {
            return Err(Error::metadata(format!(
                "non-standard TimePerFrame {} (expected {})",
                time_per_frame, TIME_PER_FRAME
            )));
        }

        let cache_type_el = root
            .find("cacheType")
            .ok_or_else(|| Error::metadata("missing cacheType"))?;
        let cache_type = cache_type_el.attr("Type").unwrap_or_default().to_string();
        if cache_type != CACHE_TYPE {
            return Err(Error::metadata(format!("cache type '{}' is not {}", cache_type, CACHE_TYPE)));
        }
        let cache_format = cache_type_el.attr("Format").unwrap_or_default().to_string();
        if cache_format != CACHE_FORMAT {
            return Err(Error::metadata(format!("cache format '{}' is not {}", cache_format, CACHE_FORMAT)));
        }

        let time_range = match root.find("time").and_then(|e| e.attr("Range")) {
            Some(range) => Some(parse_range(range)?),
            None => None,
        };

        let mut extra: BTreeMap<String, BTreeMap<String, ExtraValue>> = BTreeMap::new();
        for element in root.find_all("extra") {
            let text = element.text();
            let Some(caps) = extra_pattern().captures(&text) else {
                continue;
            };
            let key = &caps[2];
            if !GEOMETRY_KEYS.contains(&key) {
                continue;
            }
            extra
                .entry(caps[1].to_string())
                .or_default()
                .insert(key.to_string(), ExtraValue::parse(&caps[3]));
        }

        let mut shape_specs = BTreeMap::new();
        for (name, values) in &extra {
            shape_specs.insert(name.clone(), Arc::new(ShapeSpec::from_extra(name, values)?));
        }

        let mut channel_specs = BTreeMap::new();
        if let Some(channels) = root.find("Channels") {
            for element in channels.elements() {
                let spec = ChannelSpec::from_element(element)?;
                if !shape_specs.contains_key(spec.shape_name()) {
                    return Err(Error::UnknownShape {
                        channel: spec.name().to_string(),
                        shape: spec.shape_name().to_string(),
                    });
                }
                channel_specs.insert(spec.name().to_string(), spec);
            }
        }

        tracing::debug!(
            shapes = shape_specs.len(),
            channels = channel_specs.len(),
            "parsed cache metadata"
        );

        Ok(Self {
            document,
            time_per_frame,
            cache_type,
            cache_format,
            time_range,
            extra,
            shape_specs,
            channel_specs,
        })
    }

    #[inline]
    pub fn time_per_frame(&self) -> i64 {
        self.time_per_frame
    }

    #[inline]
    pub fn cache_type(&self) -> &str {
        &self.cache_type
    }

    #[inline]
    pub fn cache_format(&self) -> &str {
        &self.cache_format
    }

    /// `time/@Range` as `(min, max)`, if present.
    #[inline]
    pub fn time_range(&self) -> Option<(i64, i64)> {
        self.time_range
    }

    /// Retained geometry `extra` values by shape, then key.
    pub fn extra(&self) -> &BTreeMap<String, BTreeMap<String, ExtraValue>> {
        &self.extra
    }

    pub fn shape_specs(&self) -> &BTreeMap<String, Arc<ShapeSpec>> {
        &self.shape_specs
    }

    pub fn shape_spec(&self, name: &str) -> Option<&Arc<ShapeSpec>> {
        self.shape_specs.get(name)
    }

    pub fn channel_specs(&self) -> &BTreeMap<String, ChannelSpec> {
        &self.channel_specs
    }

    pub fn channel_spec(&self, name: &str) -> Option<&ChannelSpec> {
        self.channel_specs.get(name)
    }

    pub fn document(&self) -> &XmlDocument {
        &self.document
    }

    /// Set the time range and mark every channel as irregularly sampled
    /// over it.
    pub fn update_time_range(&mut self, min: i64, max: i64) {
        let root = self.document.root_mut();
        match root.find_mut("time") {
            Some(time) => time.set_attr("Range", format!("{}-{}", min, max)),
            None => {
                let mut time = XmlElement::new("time");
                time.set_attr("Range", format!("{}-{}", min, max));
                root.push(super::xml::XmlNode::Element(time));
            }
        }
        if let Some(channels) = root.find_mut("Channels") {
            for channel in channels.elements_mut() {
                channel.set_attr("SamplingType", "Irregular");
                channel.set_attr("StartTime", min.to_string());
                channel.set_attr("EndTime", max.to_string());
            }
        }
        self.time_range = Some((min, max));
    }

    /// Serialize the (possibly updated) sidecar.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        self.document.write(path)
    }
}

/// Parse `"<min>-<max>"`. Either bound may itself be negative.
fn parse_range(range: &str) -> Result<(i64, i64)> {
    let bad = || Error::metadata(format!("bad time range '{}'", range));
    let range = range.trim();
    let split = range
        .char_indices()
        .skip(1)
        .find(|&(_, c)| c == '-')
        .map(|(i, _)| i)
        .ok_or_else(bad)?;
    let min = range[..split].trim().parse().map_err(|_| bad())?;
    let max = range[split + 1..].trim().parse().map_err(|_| bad())?;
    Ok((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sidecar(time_per_frame: i64) -> String {
        format!(
            r#"<?xml version="1.0"?>
<Autodesk_Cache_File>
  <cacheType Type="OneFilePerFrame" Format="mcc"/>
  <time Range="250-500"/>
  <cacheTimePerFrame TimePerFrame="{time_per_frame}"/>
  <cacheVersion Version="2.0"/>
  <extra>fluid1.dimensionsW=10</extra>
  <extra>fluid1.dimensionsH=10.0</extra>
  <extra>fluid1.dimensionsD=10</extra>
  <extra>fluid1.resolutionW=5</extra>
  <extra>fluid1.resolutionH=5</extra>
  <extra>fluid1.resolutionD=5</extra>
  <extra>fluid1.autoResize=True</extra>
  <extra>not an extra line</extra>
  <Channels>
    <channel0 ChannelName="fluid1_density" ChannelType="FloatArray" ChannelInterpretation="density" SamplingType="Regular" SamplingRate="250" StartTime="250" EndTime="500"/>
    <channel1 ChannelName="fluid1_velocity" ChannelType="FloatArray" ChannelInterpretation="velocity" SamplingType="Regular" SamplingRate="250" StartTime="250" EndTime="500"/>
  </Channels>
</Autodesk_Cache_File>
"#
        )
    }

    #[test]
    fn test_parse_sidecar() -> Result<()> {
        let meta = CacheMetadata::parse(&sidecar(250))?;
        assert_eq!(meta.time_per_frame(), 250);
        assert_eq!(meta.cache_type(), "OneFilePerFrame");
        assert_eq!(meta.cache_format(), "mcc");
        assert_eq!(meta.time_range(), Some((250, 500)));

        let spec = meta.shape_spec("fluid1").expect("fluid1 spec");
        assert_eq!(spec.dimensions(), DVec3::splat(10.0));
        assert_eq!(spec.resolution(), UVec3::splat(5));
        assert_eq!(spec.unit_size(), DVec3::splat(2.0));
        assert!(!meta.extra()["fluid1"].contains_key("autoResize"));

        let density = meta.channel_spec("fluid1_density").expect("density spec");
        assert_eq!(density.shape_name(), "fluid1");
        assert_eq!(density.interpretation(), &Interpretation::Density);
        assert_eq!(density.interpretation().data_size(), Some(1));

        let velocity = meta.channel_spec("fluid1_velocity").expect("velocity spec");
        assert_eq!(velocity.interpretation().data_size(), Some(3));
        Ok(())
    }

    #[test]
    fn test_rejects_time_per_frame() {
        for tpf in [0, 125, 251, 6000] {
            let err = CacheMetadata::parse(&sidecar(tpf)).unwrap_err();
            assert!(matches!(err, Error::InvalidMetadata(_)), "{tpf}: {err:?}");
        }
    }

    #[test]
    fn test_rejects_type_and_format() {
        let text = sidecar(250).replace("OneFilePerFrame", "OneFile");
        assert!(matches!(CacheMetadata::parse(&text), Err(Error::InvalidMetadata(_))));

        let text = sidecar(250).replace("Format=\"mcc\"", "Format=\"mcx\"");
        assert!(matches!(CacheMetadata::parse(&text), Err(Error::InvalidMetadata(_))));
    }

    #[test]
    fn test_channel_for_unknown_shape() {
        let text = sidecar(250).replace("fluid1_velocity", "fluid2_velocity");
        let err = CacheMetadata::parse(&text).unwrap_err();
        assert!(matches!(err, Error::UnknownShape { ref shape, .. } if shape == "fluid2"));
    }

    #[test]
    fn test_missing_geometry_key() {
        let text = sidecar(250).replace("<extra>fluid1.resolutionD=5</extra>", "");
        assert!(matches!(CacheMetadata::parse(&text), Err(Error::InvalidMetadata(_))));
    }

    #[test]
    fn test_channel_name_split() -> Result<()> {
        let spec = ChannelSpec::parse("fluid_shape_1_density")?;
        assert_eq!(spec.shape_name(), "fluid_shape_1");
        assert_eq!(spec.interpretation(), &Interpretation::Density);
        assert!(ChannelSpec::parse("nounderscore").is_err());
        assert!(ChannelSpec::parse("trailing_").is_err());
        Ok(())
    }

    #[test]
    fn test_extra_literals() {
        assert_eq!(ExtraValue::parse("10"), ExtraValue::Int(10));
        assert_eq!(ExtraValue::parse("2.5"), ExtraValue::Float(2.5));
        assert_eq!(ExtraValue::parse("-1e3"), ExtraValue::Float(-1000.0));
        assert_eq!(ExtraValue::parse("True"), ExtraValue::Bool(true));
        assert_eq!(ExtraValue::parse("'abc'"), ExtraValue::Str("abc".into()));
        assert_eq!(ExtraValue::parse("inf"), ExtraValue::Str("inf".into()));
        assert_eq!(ExtraValue::parse("1.2.3"), ExtraValue::Str("1.2.3".into()));
    }

    #[test]
    fn test_update_time_range() -> Result<()> {
        let mut meta = CacheMetadata::parse(&sidecar(250))?;
        meta.update_time_range(-250, 1000);
        assert_eq!(meta.time_range(), Some((-250, 1000)));

        let reparsed = CacheMetadata::parse(&meta.document().to_xml_string()?)?;
        assert_eq!(reparsed.time_range(), Some((-250, 1000)));
        let channels = reparsed.document().root().find("Channels").expect("channels");
        for channel in channels.elements() {
            assert_eq!(channel.attr("SamplingType"), Some("Irregular"));
            assert_eq!(channel.attr("StartTime"), Some("-250"));
            assert_eq!(channel.attr("EndTime"), Some("1000"));
        }
        Ok(())
    }

    #[test]
    fn test_parse_range() -> Result<()> {
        assert_eq!(parse_range("250-500")?, (250, 500));
        assert_eq!(parse_range("-250--100")?, (-250, -100));
        assert!(parse_range("250").is_err());
        Ok(())
    }
}
