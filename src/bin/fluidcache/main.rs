//! fluidcache CLI - Tool for inspecting and blending fluid caches.

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fluidcache::fluid::{BlendEngine, Cache, Frame, FrameSummary};

const BUILD_DATE: &str = env!("FLUIDCACHE_BUILD_DATE");

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "warn",
            _ => filtered_args.push(arg),
        }
    }
    init_tracing(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        // Info command - sidecar summary
        "info" | "i" => match filtered_args.get(1) {
            Some(path) => cmd_info(path, has_flag(&filtered_args, "--json")),
            None => Err(anyhow!("missing file argument\nUsage: fluidcache info <cache.xml> [--json]")),
        },

        // Frames command - per-frame headers and shape bounds
        "frames" | "f" => match filtered_args.get(1) {
            Some(path) => cmd_frames(path, has_flag(&filtered_args, "--json")),
            None => Err(anyhow!("missing file argument\nUsage: fluidcache frames <cache.xml> [--json]")),
        },

        // Blend command - pairwise frame blend into a new cache
        "blend" | "b" => parse_blend(&filtered_args[1..]).and_then(|opts| cmd_blend(&opts)),

        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        "version" | "--version" => {
            println!("fluidcache {} ({})", env!("CARGO_PKG_VERSION"), BUILD_DATE);
            Ok(())
        }

        // Passing a sidecar directly is the same as `info`
        path if path.ends_with(".xml") => cmd_info(path, has_flag(&filtered_args, "--json")),

        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env("FLUIDCACHE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn has_flag(args: &[&str], flag: &str) -> bool {
    args.iter().any(|&a| a == flag)
}

fn print_help() {
    println!("fluidcache - fluid simulation cache toolkit");
    println!();
    println!("USAGE:");
    println!("    fluidcache [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    i, info   <cache.xml> [--json]        Show sidecar settings and shape specs");
    println!("    f, frames <cache.xml> [--json]        Decode every frame, show times and bounds");
    println!("    b, blend  <a.xml> <b.xml> <out.xml>   Blend two caches frame by frame");
    println!("              --factor F [--no-advect]");
    println!("    version                               Show version and build date");
    println!("    h, help                               Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Show debug output");
    println!("    -vv, --trace     Show trace output (very verbose)");
    println!("    -q, --quiet      Only show warnings and errors");
    println!();
    println!("ENVIRONMENT:");
    println!("    FLUIDCACHE_LOG, RUST_LOG    Log filter, overrides -v/-q");
    println!();
    println!("EXAMPLES:");
    println!("    fluidcache info smoke.xml");
    println!("    fluidcache frames smoke.xml --json");
    println!("    fluidcache blend takeA.xml takeB.xml mix.xml --factor 0.5");
}

fn cmd_info(path: &str, json_mode: bool) -> anyhow::Result<()> {
    tracing::debug!("Loading cache: {}", path);
    let mut cache = Cache::load(path).with_context(|| format!("failed to load {}", path))?;
    let frame_count = cache.frame_count()?;
    let summary = cache.summary();

    if json_mode {
        let shapes: Vec<serde_json::Value> = summary
            .shapes
            .iter()
            .map(|s| {
                serde_json::json!({
                    "name": s.name,
                    "dimensions": s.dimensions.to_array(),
                    "resolution": s.resolution.to_array(),
                    "unit_size": s.unit_size.to_array(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "path": summary.xml_path,
                "time_per_frame": summary.time_per_frame,
                "cache_type": summary.cache_type,
                "cache_format": summary.cache_format,
                "time_range": summary.time_range,
                "shapes": shapes,
                "channels": summary.channels,
                "frames": frame_count,
            }))?
        );
        return Ok(());
    }

    print!("{}", summary);
    println!("\tframes on disk: {}", frame_count);
    Ok(())
}

#[derive(Serialize)]
struct ShapeReport {
    name: String,
    resolution: [u32; 3],
    offset: [f64; 3],
    bb_min: [f64; 3],
    bb_max: [f64; 3],
    channels: Vec<String>,
}

#[derive(Serialize)]
struct FrameReport {
    path: Option<PathBuf>,
    frame: Option<u64>,
    tick: Option<u32>,
    start_time: Option<i64>,
    end_time: Option<i64>,
    shapes: Vec<ShapeReport>,
    error: Option<String>,
}

impl FrameReport {
    fn from_summary(summary: FrameSummary) -> Self {
        Self {
            path: summary.path,
            frame: summary.index.map(|i| i.frame),
            tick: summary.index.map(|i| i.tick),
            start_time: summary.start_time,
            end_time: summary.end_time,
            shapes: summary
                .shapes
                .into_iter()
                .map(|s| ShapeReport {
                    name: s.name,
                    resolution: s.resolution.to_array(),
                    offset: s.offset.to_array(),
                    bb_min: s.bb_min.to_array(),
                    bb_max: s.bb_max.to_array(),
                    channels: s.channels.iter().map(|c| c.to_string()).collect(),
                })
                .collect(),
            error: None,
        }
    }

    fn failed(frame: &Frame, error: &fluidcache::Error) -> Self {
        Self {
            path: frame.path().map(PathBuf::from),
            frame: frame.index().map(|i| i.frame),
            tick: frame.index().map(|i| i.tick),
            start_time: None,
            end_time: None,
            shapes: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

fn cmd_frames(path: &str, json_mode: bool) -> anyhow::Result<()> {
    let mut cache = Cache::load(path).with_context(|| format!("failed to load {}", path))?;
    let mut reports = Vec::new();
    let mut failed = 0usize;

    for frame in cache.frames()? {
        match frame.summary() {
            Ok(summary) => {
                if !json_mode {
                    if let Some(index) = summary.index {
                        println!("[{}]", index);
                    }
                    print!("{}", summary);
                }
                reports.push(FrameReport::from_summary(summary));
            }
            Err(e) => {
                tracing::error!("{}", e);
                failed += 1;
                reports.push(FrameReport::failed(frame, &e));
            }
        }
        frame.free();
    }

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if failed > 0 {
        bail!("{} of {} frames failed to decode", failed, reports.len());
    }
    Ok(())
}

struct BlendOptions<'a> {
    a: &'a str,
    b: &'a str,
    out: &'a str,
    factor: f64,
    advect: bool,
}

fn parse_blend<'a>(args: &[&'a str]) -> anyhow::Result<BlendOptions<'a>> {
    let usage = "Usage: fluidcache blend <a.xml> <b.xml> <out.xml> --factor F [--no-advect]";
    let mut positional = Vec::new();
    let mut factor = None;
    let mut advect = true;
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        match arg {
            "--factor" | "-f" => {
                let value = iter.next().ok_or_else(|| anyhow!("--factor needs a value\n{}", usage))?;
                factor = Some(
                    value
                        .parse::<f64>()
                        .with_context(|| format!("invalid blend factor '{}'", value))?,
                );
            }
            "--no-advect" => advect = false,
            _ => positional.push(arg),
        }
    }
    let [a, b, out] = positional[..] else {
        bail!("expected three cache paths\n{}", usage);
    };
    let factor = factor.ok_or_else(|| anyhow!("missing --factor\n{}", usage))?;
    if !(0.0..=1.0).contains(&factor) {
        tracing::warn!("blend factor {} is outside [0, 1], results are extrapolated", factor);
    }
    Ok(BlendOptions { a, b, out, factor, advect })
}

fn cmd_blend(opts: &BlendOptions<'_>) -> anyhow::Result<()> {
    let mut cache_a = Cache::load(opts.a).with_context(|| format!("failed to load {}", opts.a))?;
    let mut cache_b = Cache::load(opts.b).with_context(|| format!("failed to load {}", opts.b))?;

    let mut output = cache_a.clone();
    output.set_path(opts.out)?;
    let shape_names: Vec<String> = output.metadata().shape_specs().keys().cloned().collect();

    let frames_a = cache_a.frames()?;
    let frames_b = cache_b.frames()?;
    if frames_a.len() != frames_b.len() {
        tracing::warn!(
            "frame counts differ ({} vs {}), blending the first {}",
            frames_a.len(),
            frames_b.len(),
            frames_a.len().min(frames_b.len())
        );
    }

    let mut range: Option<(i64, i64)> = None;
    let mut failed = 0usize;
    for (fa, fb) in frames_a.iter_mut().zip(frames_b.iter_mut()) {
        match blend_pair(&output, fa, fb, &shape_names, opts) {
            Ok((start, end)) => {
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(start), hi.max(end)),
                    None => (start, end),
                });
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                failed += 1;
            }
        }
        fa.free();
        fb.free();
    }

    let (min, max) = range.ok_or_else(|| anyhow!("no frames were blended"))?;
    output.update_time_range(min, max);
    output.write_metadata(opts.out)?;
    tracing::info!("Wrote {}", opts.out);

    if failed > 0 {
        bail!("{} frame pairs failed to blend", failed);
    }
    Ok(())
}

fn blend_pair(
    output: &Cache,
    fa: &mut Frame,
    fb: &mut Frame,
    shape_names: &[String],
    opts: &BlendOptions<'_>,
) -> anyhow::Result<(i64, i64)> {
    let (start, end) = (fa.start_time()?, fa.end_time()?);
    let index = fa.index().unwrap_or_default();
    let path = output
        .frame_path(index)
        .context("output cache has no location")?;

    let mut frame = output.synthetic_frame();
    for name in shape_names {
        let mut engine = BlendEngine::setup(&mut frame, name, &mut *fa, &mut *fb)?;
        engine.blend(opts.factor, opts.advect)?;
    }
    frame.set_times(start, end)?;
    frame.write(&path)?;
    tracing::info!("Blended frame {} -> {}", index, path.display());
    Ok((start, end))
}
