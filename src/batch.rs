// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Runs the slice pipeline over many slices in parallel.
//!
//! Slices are independent. Each one runs on tokio's blocking pool, at most
//! `max_concurrency` at a time, and results are gathered by slice key so
//! the aggregate order does not depend on completion order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::SliceError;
use crate::export::{save_label_image, write_counts_csv, write_points_csv};
use crate::pipeline::{process, step_count, CancelFlag, Progress, SliceOutput,
                      SliceParameters};
use crate::plane::FloatImage;
use crate::rank_filter::{CircularRankFilter, RankFilter};
use crate::region_mask::RegionMask;

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// One unit of work.
pub struct SliceInput {
    /// Identifies the slice in outputs and file names.
    pub key: String,
    pub plane: FloatImage,
    /// Separate plane to segment; see [process()].
    pub seg_plane: Option<FloatImage>,
    pub mask: Option<RegionMask>,
}

/// Receives the overall completion percentage, 0..=100.
pub type PercentSink = Arc<dyn Fn(u32) + Send + Sync>;

pub struct BatchOptions {
    pub max_concurrency: usize,
    /// If set, per-slice point listings and label images plus a run-level
    /// `counts.csv` are written here.
    pub output_dir: Option<PathBuf>,
    pub cancel: CancelFlag,
    pub progress: Option<PercentSink>,
    pub filter: Arc<dyn RankFilter>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions{max_concurrency: DEFAULT_MAX_CONCURRENCY,
                     output_dir: None,
                     cancel: CancelFlag::new(),
                     progress: None,
                     filter: Arc::new(CircularRankFilter)}
    }
}

pub struct BatchOutcome {
    /// False if no slice produced output or the input was invalid.
    pub success: bool,
    pub outputs: BTreeMap<String, SliceOutput>,
}

struct RunProgress {
    completed: AtomicUsize,
    total: usize,
    sink: Option<PercentSink>,
}

impl Progress for RunProgress {
    fn advance(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let percent = (100 * completed / self.total.max(1)).min(100) as u32;
        if let Some(sink) = &self.sink {
            sink(percent);
        }
    }
}

/// Processes every slice with the same `params`.
///
/// An invalid slice (bad parameters, missing plane, line mask) aborts the
/// whole run: remaining slices are cancelled and no outputs are returned.
/// A slice that fails otherwise, or panics, is logged and skipped.
/// Cancellation through `options.cancel` stops the remaining slices; slices
/// already finished are kept.
pub async fn run_batch(slices: Vec<SliceInput>, params: SliceParameters,
                       options: BatchOptions) -> BatchOutcome {
    let run_start = Instant::now();
    let num_slices = slices.len();
    let progress = Arc::new(RunProgress{
        completed: AtomicUsize::new(0),
        total: slices.iter().map(|s| step_count(&params, s.seg_plane.is_some())).sum(),
        sink: options.progress.clone(),
    });
    let params = Arc::new(params);
    let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
    let cancel = options.cancel.clone();

    let mut join_set = JoinSet::new();
    for slice in slices {
        let semaphore = semaphore.clone();
        let params = params.clone();
        let filter = options.filter.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        let output_dir = options.output_dir.clone();
        join_set.spawn(async move {
            let key = slice.key.clone();
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (key, Err(SliceError::Computation(e.to_string()))),
            };
            let task_key = key.clone();
            let handle = tokio::task::spawn_blocking(move || -> Result<SliceOutput, SliceError> {
                let mut output = process(slice.plane, slice.seg_plane, &params,
                                         slice.mask.as_ref(), filter.as_ref(),
                                         &cancel, progress.as_ref())?;
                if let Some(dir) = output_dir {
                    persist_slice(&dir, &task_key, &mut output);
                }
                Ok(output)
            });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(SliceError::Computation(format!("slice task failed: {}", e))),
            };
            (key, result)
        });
    }

    let mut outputs = BTreeMap::<String, SliceOutput>::new();
    let mut invalid_input = false;
    while let Some(joined) = join_set.join_next().await {
        let (key, result) = match joined {
            Ok(keyed) => keyed,
            Err(e) => {
                warn!("Slice task lost: {}", e);
                continue;
            },
        };
        match result {
            Ok(output) => {
                outputs.insert(key, output);
            },
            Err(SliceError::InvalidInput(msg)) => {
                error!("Slice {}: invalid input: {}; aborting run", key, msg);
                invalid_input = true;
                cancel.cancel();
            },
            Err(SliceError::Cancelled) => {
                debug!("Slice {} cancelled", key);
            },
            Err(e) => {
                warn!("Slice {} skipped: {}", key, e);
            },
        }
    }
    if invalid_input {
        outputs.clear();
    }
    if let Some(dir) = &options.output_dir {
        if !outputs.is_empty() {
            let path = dir.join("counts.csv");
            if let Err(e) = write_counts_csv(
                &path, outputs.iter().map(|(k, o)| (k.as_str(), o.count))) {
                error!("Could not write {:?}: {}", path, e);
            }
        }
    }
    let success = !outputs.is_empty();
    info!("Processed {} of {} slices in {:?}{}", outputs.len(), num_slices,
          run_start.elapsed(), if success { "" } else { "; run failed" });
    BatchOutcome{success, outputs}
}

// Write failures are recorded on the slice; its points and count are kept.
fn persist_slice(dir: &Path, key: &str, output: &mut SliceOutput) {
    let Some(label) = &output.label else {
        return;
    };
    let label_path = dir.join(format!("{}_segmentation.png", key));
    if let Err(e) = save_label_image(&label_path, label) {
        error!("Failed to write segmented image {:?}: {}", label_path, e);
        output.errors.push(format!("{:?}: {}", label_path, e));
    }
    let points_path = dir.join(format!("{}_points.csv", key));
    if let Err(e) = write_points_csv(&points_path, &output.export) {
        error!("Failed to write point list {:?}: {}", points_path, e);
        output.errors.push(format!("{:?}: {}", points_path, e));
    }
}
