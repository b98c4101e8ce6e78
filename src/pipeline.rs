// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Processing of one 2D slice: pre-filtering, maxima detection, region
//! mask filtering, and segmentation seeded from the maxima.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::error::SliceError;
use crate::export::PointRecord;
use crate::maxima::{find_maxima, DetectionParams, MaximaSet};
use crate::plane::FloatImage;
use crate::rank_filter::{RankFilter, RankMode};
use crate::region_mask::RegionMask;
use crate::segment::{excluded_edge_maxima, segment_excluding, LabelImage};

#[derive(Clone, Debug, PartialEq)]
pub struct SliceParameters {
    /// Median filter radius applied before detection. 0 disables.
    pub despeckle_radius: f64,
    /// Mean filter radius applied after despeckling. 0 disables.
    pub smooth_radius: f64,
    /// Colour channel maxima are detected on.
    pub detection_channel: u8,
    /// Colour channel that is segmented. None means the detection channel.
    pub segmentation_channel: Option<u8>,
    pub tolerance: f64,
    pub threshold: f64,
    pub exclude_maxima_on_edges: bool,
    pub exclude_segments_on_edges: bool,
    pub is_edm: bool,
    /// Particles are darker than the background.
    pub light_background: bool,
    /// Skip segmentation.
    pub maxima_only: bool,
}

impl Default for SliceParameters {
    fn default() -> Self {
        SliceParameters{
            despeckle_radius: 0.0,
            smooth_radius: 0.0,
            detection_channel: 0,
            segmentation_channel: None,
            tolerance: 10.0,
            threshold: 0.0,
            exclude_maxima_on_edges: true,
            exclude_segments_on_edges: false,
            is_edm: false,
            light_background: false,
            maxima_only: false,
        }
    }
}

impl SliceParameters {
    pub fn validate(&self) -> Result<(), SliceError> {
        for (name, value) in [("despeckle_radius", self.despeckle_radius),
                              ("smooth_radius", self.smooth_radius),
                              ("tolerance", self.tolerance),
                              ("threshold", self.threshold)] {
            if !value.is_finite() || value < 0.0 {
                return Err(SliceError::InvalidInput(format!(
                    "{} must be a non-negative number, got {}", name, value)));
            }
        }
        Ok(())
    }

    pub fn segmentation_channel(&self) -> u8 {
        self.segmentation_channel.unwrap_or(self.detection_channel)
    }

    /// True if segmentation runs on a different plane than detection.
    pub fn separate_segmentation_channel(&self) -> bool {
        self.segmentation_channel() != self.detection_channel
    }

    pub fn detection_params(&self, exclude_on_edges: bool) -> DetectionParams {
        DetectionParams{tolerance: self.tolerance,
                        threshold: self.threshold,
                        exclude_on_edges,
                        is_edm: self.is_edm,
                        light_background: self.light_background}
    }
}

/// Number of [Progress::advance()] calls [process()] makes for one slice.
pub fn step_count(params: &SliceParameters, has_seg_plane: bool) -> usize {
    if params.maxima_only {
        4
    } else if has_seg_plane {
        8
    } else {
        5
    }
}

/// Cooperative cancellation shared between a run and its slices.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SliceError> {
        if self.is_cancelled() {
            Err(SliceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives one call per completed processing step.
pub trait Progress: Send + Sync {
    fn advance(&self);
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn advance(&self) {}
}

#[derive(Clone, Debug)]
pub struct SliceOutput {
    /// Maxima found on the detection plane, restricted to the region mask.
    pub points: MaximaSet,
    pub count: usize,
    /// Absent for maxima-only runs.
    pub label: Option<LabelImage>,
    /// Point listing for persistence; empty for maxima-only runs.
    pub export: Vec<PointRecord>,
    /// Segmentation seeds were detected again under the segmentation edge
    /// rule instead of reusing the detected maxima.
    pub seeds_recomputed: bool,
    /// Non-fatal problems, such as failed writes.
    pub errors: Vec<String>,
}

/// Processes one slice. `plane` is the detection plane; `seg_plane`, if
/// given, is segmented instead of the (filtered) detection plane and is
/// filtered the same way. Both planes are consumed since filters overwrite
/// them.
///
/// Segmentation seeds are the maxima of the whole detection plane (the
/// region mask only restricts the reported points). They are reused when
/// the segmentation edge rule equals the detection edge rule and detected
/// again otherwise.
///
/// Returns `Err(Cancelled)` as soon as `cancel` is observed at a step
/// boundary; nothing of the slice is kept.
pub fn process(mut plane: FloatImage, seg_plane: Option<FloatImage>,
               params: &SliceParameters, mask: Option<&RegionMask>,
               filter: &dyn RankFilter, cancel: &CancelFlag,
               progress: &dyn Progress) -> Result<SliceOutput, SliceError> {
    let process_start = Instant::now();
    params.validate()?;
    let (width, height) = plane.dimensions();
    if width == 0 || height == 0 {
        return Err(SliceError::InvalidInput("Detection plane is empty".to_string()));
    }
    if let Some(seg) = &seg_plane {
        if seg.dimensions() != (width, height) {
            return Err(SliceError::InvalidInput(format!(
                "Segmentation plane is {}x{}, detection plane is {}x{}",
                seg.width(), seg.height(), width, height)));
        }
    } else if params.separate_segmentation_channel() && !params.maxima_only {
        return Err(SliceError::InvalidInput(format!(
            "Segmentation channel {} requested but no segmentation plane given",
            params.segmentation_channel())));
    }
    if let Some(m) = mask {
        if m.is_line() {
            return Err(SliceError::InvalidInput(
                "Region mask is a line and encloses no pixels".to_string()));
        }
    }

    cancel.check()?;
    progress.advance();
    filter.rank(&mut plane, params.despeckle_radius, RankMode::Median);
    cancel.check()?;
    progress.advance();
    filter.rank(&mut plane, params.smooth_radius, RankMode::Mean);
    cancel.check()?;
    progress.advance();

    let detection = params.detection_params(params.exclude_maxima_on_edges);
    let maxima = find_maxima(&plane, &detection, None);
    let points = match mask {
        Some(m) => maxima.within(m),
        None => maxima.clone(),
    };
    let count = points.len();
    debug!("{} maxima, {} within mask", maxima.len(), count);

    if params.maxima_only {
        progress.advance();
        info!("Slice {}x{}: {} maxima in {:?}",
              width, height, count, process_start.elapsed());
        return Ok(SliceOutput{points, count, label: None, export: Vec::new(),
                              seeds_recomputed: false, errors: Vec::new()});
    }

    let to_segment = match seg_plane {
        Some(mut seg) => {
            cancel.check()?;
            progress.advance();
            filter.rank(&mut seg, params.despeckle_radius, RankMode::Median);
            cancel.check()?;
            progress.advance();
            filter.rank(&mut seg, params.smooth_radius, RankMode::Mean);
            cancel.check()?;
            progress.advance();
            seg
        },
        None => plane.clone(),
    };

    cancel.check()?;
    let segmentation = params.detection_params(params.exclude_segments_on_edges);
    let seeds_recomputed =
        params.exclude_segments_on_edges != params.exclude_maxima_on_edges;
    let seeds = if seeds_recomputed {
        debug!("Detecting seeds again with exclude_on_edges={}",
               params.exclude_segments_on_edges);
        find_maxima(&plane, &segmentation, None)
    } else {
        maxima
    };
    let excluded = excluded_edge_maxima(&plane, &seeds, &segmentation);
    let label = segment_excluding(&to_segment, &seeds, &excluded, &segmentation);
    cancel.check()?;
    progress.advance();

    let export = points.points.iter().map(PointRecord::from).collect();
    progress.advance();
    info!("Slice {}x{}: {} maxima, {} basins in {:?}",
          width, height, count, label.num_basins(), process_start.elapsed());
    Ok(SliceOutput{points, count, label: Some(label), export,
                   seeds_recomputed, errors: Vec::new()})
}
