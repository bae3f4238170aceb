//! Integration tests: sidecar + frame files on disk, decoding, sampling,
//! writing and blending.

use std::path::Path;

use fluidcache::chunk::{ChunkTree, Tag};
use fluidcache::fluid::{BlendEngine, Cache, CacheMetadata, Channel, Frame, FrameIndex, FrameState, Interpretation};
use fluidcache::util::{DVec3, UVec3};
use fluidcache::Error;

use tempfile::TempDir;

const SIDECAR: &str = r#"<?xml version="1.0"?>
<Autodesk_Cache_File>
  <cacheType Type="OneFilePerFrame" Format="mcc"/>
  <time Range="250-750"/>
  <cacheTimePerFrame TimePerFrame="250"/>
  <cacheVersion Version="2.0"/>
  <extra>fluid1.dimensionsW=4</extra>
  <extra>fluid1.dimensionsH=4</extra>
  <extra>fluid1.dimensionsD=4</extra>
  <extra>fluid1.resolutionW=2</extra>
  <extra>fluid1.resolutionH=2</extra>
  <extra>fluid1.resolutionD=2</extra>
  <Channels>
    <channel0 ChannelName="fluid1_density" ChannelType="FloatArray" ChannelInterpretation="density" SamplingType="Regular" SamplingRate="250" StartTime="250" EndTime="750"/>
    <channel1 ChannelName="fluid1_velocity" ChannelType="FloatVectorArray" ChannelInterpretation="velocity" SamplingType="Regular" SamplingRate="250" StartTime="250" EndTime="750"/>
  </Channels>
</Autodesk_Cache_File>
"#;

fn density() -> Vec<f64> {
    (0..8).map(|i| i as f64 * 0.5).collect()
}

fn velocity() -> Vec<f64> {
    // 2x2x2 grid: 12 x-faces, 12 y-faces, 12 z-faces
    (0..36).map(|i| i as f64 * 0.5).collect()
}

/// Encode a frame the way the simulator writes it: velocity as `FVCA`
/// with SIZE counting vectors.
fn frame_bytes(start: i64, end: i64, channels: &[(&str, Tag, Vec<f64>)]) -> Vec<u8> {
    let mut tree = ChunkTree::new();
    let header = tree.add_group(Tag::CACH);
    header.add_chunk(Tag::VRSN).set_string("0.1").unwrap();
    header.add_chunk(Tag::STIM).set_ints(&[start]).unwrap();
    header.add_chunk(Tag::ETIM).set_ints(&[end]).unwrap();

    let group = tree.add_group(Tag::MYCH);
    for (name, tag, data) in channels {
        let size = if *tag == Tag::FVCA { data.len() / 3 } else { data.len() };
        group.add_chunk(Tag::CHNM).set_string(*name).unwrap();
        group.add_chunk(Tag::SIZE).set_ints(&[size as i64]).unwrap();
        group.add_chunk(*tag).set_floats(data.clone()).unwrap();
    }
    tree.to_bytes().unwrap()
}

fn standard_frame(start: i64) -> Vec<u8> {
    frame_bytes(
        start,
        start,
        &[
            ("fluid1_density", Tag::FBCA, density()),
            ("fluid1_velocity", Tag::FVCA, velocity()),
        ],
    )
}

/// Write `smoke.xml` plus frames 1, 1 tick 5 and 2 into a fresh directory.
fn write_cache() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let xml = dir.path().join("smoke.xml");
    std::fs::write(&xml, SIDECAR).unwrap();
    std::fs::write(dir.path().join("smokeFrame2.mc"), standard_frame(500)).unwrap();
    std::fs::write(dir.path().join("smokeFrame1Tick5.mc"), standard_frame(300)).unwrap();
    std::fs::write(dir.path().join("smokeFrame1.mc"), standard_frame(250)).unwrap();
    // Not frames of this cache
    std::fs::write(dir.path().join("otherFrame1.mc"), standard_frame(250)).unwrap();
    std::fs::write(dir.path().join("smokeFrame3.mcx"), b"junk").unwrap();
    std::fs::write(dir.path().join("smokeFrame\u{0663}.mc"), standard_frame(750)).unwrap();
    (dir, xml)
}

fn file_name(path: Option<&Path>) -> String {
    path.and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[test]
fn test_load_and_scan_frames() {
    let (_dir, xml) = write_cache();
    let mut cache = Cache::load(&xml).expect("Failed to load cache");

    assert_eq!(cache.base_name(), Some("smoke"));
    assert_eq!(cache.metadata().time_range(), Some((250, 750)));
    let spec = cache.metadata().shape_spec("fluid1").expect("fluid1 spec");
    assert_eq!(spec.resolution(), UVec3::splat(2));
    assert_eq!(spec.unit_size(), DVec3::splat(2.0));

    let frames = cache.frames().unwrap();
    let names: Vec<String> = frames.iter().map(|f| file_name(f.path())).collect();
    assert_eq!(names, ["smokeFrame1.mc", "smokeFrame1Tick5.mc", "smokeFrame2.mc"]);
    assert_eq!(frames[1].index(), Some(FrameIndex { frame: 1, tick: 5 }));
    assert!(frames.iter().all(|f| f.state() == FrameState::Unloaded));
}

#[test]
fn test_load_errors() {
    let dir = TempDir::new().unwrap();

    let missing = Cache::load(dir.path().join("nothing.xml")).unwrap_err();
    assert!(matches!(missing, Error::FileNotFound(_)), "{missing:?}");

    let xml = dir.path().join("slow.xml");
    std::fs::write(&xml, SIDECAR.replace("TimePerFrame=\"250\"", "TimePerFrame=\"6000\"")).unwrap();
    let err = Cache::load(&xml).unwrap_err();
    assert!(matches!(err, Error::InvalidMetadata(_)), "{err:?}");
}

#[test]
fn test_headers_before_channels() {
    let (_dir, xml) = write_cache();
    let mut cache = Cache::load(&xml).unwrap();
    let frame = &mut cache.frames().unwrap()[1];

    assert_eq!(frame.start_time().unwrap(), 300);
    assert_eq!(frame.headers().unwrap().version.as_deref(), Some("0.1"));
    assert_eq!(frame.state(), FrameState::HeadersParsed);

    assert_eq!(frame.channels().unwrap().len(), 2);
    assert_eq!(frame.state(), FrameState::FullyDecoded);
    assert_eq!(frame.end_time().unwrap(), 300);
}

#[test]
fn test_sample_density_and_velocity() {
    let (_dir, xml) = write_cache();
    let mut cache = Cache::load(&xml).unwrap();
    let frame = &mut cache.frames().unwrap()[0];
    let view = frame.shape_view("fluid1").unwrap();

    let shape = view.shape();
    assert_eq!(shape.resolution(), UVec3::splat(2));
    assert_eq!(shape.bb_min(), DVec3::splat(-2.0));
    assert_eq!(shape.bb_max(), DVec3::splat(2.0));

    let d = view.sample(&Interpretation::Density, DVec3::new(1.0, -1.0, -1.0), false).unwrap();
    assert_eq!(d.as_slice(), &[0.5]);
    let d = view.sample(&Interpretation::Density, DVec3::splat(1.0), true).unwrap();
    assert_eq!(d.as_slice(), &[3.5]);
    let outside = view.sample(&Interpretation::Density, DVec3::splat(10.0), true).unwrap();
    assert_eq!(outside.as_slice(), &[0.0]);

    assert_eq!(view.velocity(DVec3::splat(-1.0)).unwrap(), DVec3::new(0.0, 7.0, 14.0));
    assert_eq!(view.velocity(DVec3::splat(1.0)).unwrap(), DVec3::new(5.0, 11.5, 17.5));
    assert_eq!(view.velocity(DVec3::splat(-3.0)).unwrap(), DVec3::ZERO);

    // Staggered velocity cannot be read as a cell-centered sample
    let err = view.sample(&Interpretation::Velocity, DVec3::ZERO, false).unwrap_err();
    assert!(matches!(err, Error::WrongLayout { .. }), "{err:?}");
}

#[test]
fn test_live_offset_and_resolution() {
    let (dir, xml) = write_cache();
    std::fs::write(
        dir.path().join("smokeFrame1.mc"),
        frame_bytes(
            250,
            250,
            &[
                ("fluid1_resolution", Tag::FBCA, vec![1.0, 2.0, 4.0]),
                ("fluid1_offset", Tag::FBCA, vec![1.0, 0.0, 0.5]),
                ("fluid1_density", Tag::FBCA, density()),
            ],
        ),
    )
    .unwrap();

    let mut cache = Cache::load(&xml).unwrap();
    let frame = &mut cache.frames().unwrap()[0];
    let shape = frame.shape_view("fluid1").unwrap().shape();
    assert_eq!(shape.resolution(), UVec3::new(1, 2, 4));
    assert_eq!(shape.offset(), DVec3::new(1.0, 0.0, 0.5));
    assert_eq!(shape.bb_min(), DVec3::new(0.0, -2.0, -3.5));
    assert_eq!(shape.bb_max(), DVec3::new(2.0, 2.0, 4.5));
}

#[test]
fn test_bad_frames_are_scoped() {
    let (dir, xml) = write_cache();

    // Declared size disagrees with the array
    let mut bytes = frame_bytes(250, 250, &[("fluid1_density", Tag::FBCA, density())]);
    let size_pos = bytes.windows(4).position(|w| w == b"SIZE").unwrap() + 8;
    bytes[size_pos..size_pos + 4].copy_from_slice(&9i32.to_be_bytes());
    std::fs::write(dir.path().join("smokeFrame1.mc"), bytes).unwrap();

    // Cut off in the middle of the channel group
    let full = standard_frame(500);
    std::fs::write(dir.path().join("smokeFrame2.mc"), &full[..full.len() - 40]).unwrap();

    let mut cache = Cache::load(&xml).unwrap();
    let results = cache.decode_all().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[1].is_ok());

    let size_err = results[0].as_ref().unwrap_err();
    assert!(matches!(size_err, Error::Frame { .. }));
    assert!(matches!(size_err.root_cause(), Error::ChannelSize { expected: 9, actual: 8, .. }));

    let truncated = results[2].as_ref().unwrap_err();
    assert!(truncated.to_string().contains("smokeFrame2.mc"));

    let frames = cache.frames().unwrap();
    assert_eq!(frames[1].state(), FrameState::FullyDecoded);
    // Headers of the truncated frame were still readable
    assert_eq!(frames[2].state(), FrameState::HeadersParsed);
}

#[test]
fn test_channel_for_undeclared_shape() {
    let (dir, xml) = write_cache();
    std::fs::write(
        dir.path().join("smokeFrame1.mc"),
        frame_bytes(250, 250, &[("fluid9_density", Tag::FBCA, density())]),
    )
    .unwrap();

    let mut cache = Cache::load(&xml).unwrap();
    let err = cache.frames().unwrap()[0].ensure_decoded().unwrap_err();
    assert!(matches!(err.root_cause(), Error::UnknownShape { shape, .. } if shape == "fluid9"), "{err:?}");
}

#[test]
fn test_write_and_reread_frame() {
    let (dir, xml) = write_cache();
    let mut cache = Cache::load(&xml).unwrap();
    let out = dir.path().join("copy.mc");

    let written = cache.frames().unwrap()[2].write(&out).unwrap();
    assert_eq!(written, std::fs::metadata(&out).unwrap().len());

    let mut copy = Frame::open(cache.metadata().clone(), &out, None);
    assert_eq!(copy.start_time().unwrap(), 500);
    assert_eq!(copy.channel("fluid1_density").unwrap().unwrap().data(), density().as_slice());
    // Velocity comes back as a flat float array of the same values
    assert_eq!(copy.channel("fluid1_velocity").unwrap().unwrap().data(), velocity().as_slice());

    let original = cache.frames().unwrap()[2].summary().unwrap();
    let reread = copy.summary().unwrap();
    assert_eq!(original.shapes, reread.shapes);
}

#[test]
fn test_written_frame_matches_memory() {
    let (dir, xml) = write_cache();
    let mut cache = Cache::load(&xml).unwrap();
    let out = dir.path().join("tenths.mc");

    let frame = &mut cache.frames().unwrap()[0];
    frame
        .insert_channel(Channel::new("fluid1_density", "fluid1", Interpretation::Density, vec![0.1; 8]))
        .unwrap();
    let in_memory = frame.channel("fluid1_density").unwrap().unwrap().data().to_vec();
    assert_eq!(in_memory, vec![f64::from(0.1f32); 8]);
    frame.write(&out).unwrap();

    let mut copy = Frame::open(cache.metadata().clone(), &out, None);
    assert_eq!(copy.channel("fluid1_density").unwrap().unwrap().data(), in_memory.as_slice());

    let frame = &mut cache.frames().unwrap()[0];
    let err = frame
        .insert_channel(Channel::new("fluid1_density", "fluid1", Interpretation::Density, vec![1e300; 8]))
        .unwrap_err();
    assert!(matches!(err, Error::NotRepresentable { tag: Tag::FBCA, .. }));
}

#[test]
fn test_free_releases_frames() {
    let (_dir, xml) = write_cache();
    let mut cache = Cache::load(&xml).unwrap();
    cache.decode_all().unwrap();

    cache.free();
    cache.free();
    let frame = &mut cache.frames().unwrap()[0];
    assert_eq!(frame.state(), FrameState::Freed);
    assert!(matches!(frame.channels(), Err(Error::FrameFreed(_))));
    assert!(matches!(frame.start_time(), Err(Error::FrameFreed(_))));
}

#[test]
fn test_update_time_range_roundtrip() {
    let (dir, xml) = write_cache();
    let mut cache = Cache::load(&xml).unwrap();
    cache.update_time_range(-250, 1000);

    let out = dir.path().join("retimed.xml");
    cache.write_metadata(&out).unwrap();

    let meta = CacheMetadata::read(&out).unwrap();
    assert_eq!(meta.time_range(), Some((-250, 1000)));
    let channels = meta.document().root().find("Channels").unwrap();
    for channel in channels.elements() {
        assert_eq!(channel.attr("SamplingType"), Some("Irregular"));
        assert_eq!(channel.attr("StartTime"), Some("-250"));
        assert_eq!(channel.attr("EndTime"), Some("1000"));
    }
    assert_eq!(meta.channel_specs().len(), 2);
}

#[test]
fn test_blend_into_new_cache() {
    let (dir, xml) = write_cache();
    let mut a = Cache::load(&xml).unwrap();
    let mut b = Cache::load(&xml).unwrap();

    let mix_xml = dir.path().join("mix.xml");
    let mut out = a.clone();
    out.set_path(&mix_xml).unwrap();
    assert_eq!(out.base_name(), Some("mix"));

    let fa = &mut a.frames().unwrap()[0];
    let fb = &mut b.frames().unwrap()[0];
    fa.ensure_decoded().unwrap();
    fb.ensure_decoded().unwrap();

    let mut frame = out.synthetic_frame();
    BlendEngine::setup(&mut frame, "fluid1", &*fa, &*fb)
        .unwrap()
        .blend(0.5, false)
        .unwrap();
    frame.set_times(250, 250).unwrap();
    let path = out.frame_path(FrameIndex { frame: 1, tick: 0 }).unwrap();
    frame.write(&path).unwrap();
    out.update_time_range(250, 250);
    out.write_metadata(&mix_xml).unwrap();

    let mut mix = Cache::load(&mix_xml).unwrap();
    assert_eq!(mix.metadata().time_range(), Some((250, 250)));
    assert_eq!(mix.frame_count().unwrap(), 1);

    let frame = &mut mix.frames().unwrap()[0];
    assert_eq!(file_name(frame.path()), "mixFrame1.mc");
    let view = frame.shape_view("fluid1").unwrap();
    assert_eq!(view.shape().resolution(), UVec3::splat(2));
    assert_eq!(view.shape().offset(), DVec3::ZERO);
    // Identical sources blend to themselves
    assert_eq!(view.require(&Interpretation::Density).unwrap().data(), density().as_slice());
    assert!(view.channel(&Interpretation::Velocity).is_none());
}
