// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{ArgAction, Parser};
use env_logger;
use image::ImageReader;
use imageproc::rect::Rect;
use log::{info, warn};

use maxima_segmentation::batch::{run_batch, BatchOptions, SliceInput,
                                 DEFAULT_MAX_CONCURRENCY};
use maxima_segmentation::pipeline::SliceParameters;
use maxima_segmentation::plane::extract_channel;
use maxima_segmentation::region_mask::RegionMask;

/// Finds maxima in image(s) and segments each image into one region per
/// maximum.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Path of the file or directory to process.
    #[arg(short, long)]
    input: String,

    /// Directory where output file(s) are written.
    #[arg(short, long)]
    output: Option<String>,

    /// Median filter radius applied before detection. 0 disables.
    #[arg(long, default_value_t = 0.0)]
    despeckle_radius: f64,

    /// Mean filter radius applied after despeckling. 0 disables.
    #[arg(long, default_value_t = 0.0)]
    smooth_radius: f64,

    /// Colour channel maxima are found on.
    #[arg(short, long, default_value_t = 0)]
    channel: u8,

    /// Colour channel to segment. Defaults to the maxima channel.
    #[arg(long)]
    segmentation_channel: Option<u8>,

    /// Minimum saddle depth separating two maxima.
    #[arg(short, long, default_value_t = 10.0)]
    tolerance: f64,

    /// Only pixels brighter than this can be maxima.
    #[arg(long, default_value_t = 0.0)]
    threshold: f64,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    exclude_maxima_on_edges: std::primitive::bool,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    exclude_segments_on_edges: std::primitive::bool,

    /// Input is a Euclidean distance map.
    #[arg(long, default_value_t = false)]
    is_edm: std::primitive::bool,

    /// Particles are brighter than the background.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    particles_white: std::primitive::bool,

    /// Output the maxima only; skip segmentation.
    #[arg(long, default_value_t = false)]
    maxima_only: std::primitive::bool,

    /// Keep only maxima inside this rectangle, given as x,y,w,h.
    #[arg(long, value_parser = parse_rect)]
    roi_rect: Option<Rect>,

    /// Keep only maxima inside the ellipse bounded by x,y,w,h.
    #[arg(long, value_parser = parse_rect, conflicts_with = "roi_rect")]
    roi_ellipse: Option<Rect>,

    /// Number of images processed at once.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,
}

fn parse_rect(arg: &str) -> Result<Rect, String> {
    let fields: Vec<&str> = arg.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(format!("expected x,y,w,h, got '{}'", arg));
    }
    let x = fields[0].parse::<i32>().map_err(|e| e.to_string())?;
    let y = fields[1].parse::<i32>().map_err(|e| e.to_string())?;
    let w = fields[2].parse::<u32>().map_err(|e| e.to_string())?;
    let h = fields[3].parse::<u32>().map_err(|e| e.to_string())?;
    if w == 0 || h == 0 {
        return Err(format!("rectangle '{}' is empty", arg));
    }
    Ok(Rect::at(x, y).of_size(w, h))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let params = SliceParameters{
        despeckle_radius: args.despeckle_radius,
        smooth_radius: args.smooth_radius,
        detection_channel: args.channel,
        segmentation_channel: args.segmentation_channel,
        tolerance: args.tolerance,
        threshold: args.threshold,
        exclude_maxima_on_edges: args.exclude_maxima_on_edges,
        exclude_segments_on_edges: args.exclude_segments_on_edges,
        is_edm: args.is_edm,
        light_background: !args.particles_white,
        maxima_only: args.maxima_only,
    };
    params.validate()?;

    let input_metadata = fs::metadata(&args.input).map_err(|e| {
        format!("Input file/dir '{}' does not exist? {}", args.input, e)
    })?;
    let output_dir = match &args.output {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            Some(PathBuf::from(dir))
        },
        None => None,
    };
    let mut files = Vec::<PathBuf>::new();
    if input_metadata.is_dir() {
        for entry in fs::read_dir(&args.input)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
    } else {
        files.push(PathBuf::from(&args.input));
    }

    let load_start = Instant::now();
    let mut slices = Vec::<SliceInput>::new();
    for file in &files {
        if let Some(slice) = load_slice(file, &params, &args)? {
            slices.push(slice);
        }
    }
    info!("Loaded {} images in {:?}", slices.len(), load_start.elapsed());

    let options = BatchOptions{max_concurrency: args.max_concurrency,
                               output_dir,
                               ..Default::default()};
    let outcome = run_batch(slices, params, options).await;
    for (key, output) in &outcome.outputs {
        info!("{}: {} maxima", key, output.count);
        for e in &output.errors {
            warn!("{}: {}", key, e);
        }
    }
    if !outcome.success {
        return Err("No image produced output".into());
    }
    Ok(())
}

// Returns None for files that are not decodable images.
fn load_slice(file: &Path, params: &SliceParameters, args: &Args)
              -> Result<Option<SliceInput>, Box<dyn std::error::Error>> {
    let img = match ImageReader::open(file)?.with_guessed_format()?.decode() {
        Ok(img) => img,
        Err(e) => {
            warn!("Skipping {:?} due to: {:?}", file, e);
            return Ok(None);
        },
    };
    let plane = extract_channel(&img, params.detection_channel).ok_or_else(|| {
        format!("{:?} has no channel {}", file, params.detection_channel)
    })?;
    let seg_plane = if params.separate_segmentation_channel() && !params.maxima_only {
        let channel = params.segmentation_channel();
        Some(extract_channel(&img, channel).ok_or_else(|| {
            format!("{:?} has no channel {}", file, channel)
        })?)
    } else {
        None
    };
    let key = file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string_lossy().into_owned());
    Ok(Some(SliceInput{key, plane, seg_plane, mask: region_mask(args)}))
}

fn region_mask(args: &Args) -> Option<RegionMask> {
    args.roi_rect.map(RegionMask::Rectangle)
        .or(args.roi_ellipse.map(RegionMask::Ellipse))
}
