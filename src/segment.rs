// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use image::{GrayImage, Luma};
use log::{info, warn};

use crate::maxima::{find_maxima, DetectionParams, MaximaSet};
use crate::plane::{invert, FloatImage};

pub const BACKGROUND: u32 = 0;
pub const BOUNDARY: u32 = u32::MAX;

/// Result of a seeded segmentation. Each pixel holds [BACKGROUND],
/// [BOUNDARY], or the 1-based index of the seed whose basin it joined.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelImage {
    width: u32,
    height: u32,
    labels: Vec<u32>,
    num_basins: u32,
}

impl LabelImage {
    pub fn new_background(width: u32, height: u32) -> LabelImage {
        LabelImage{width, height,
                   labels: vec![BACKGROUND; (width * height) as usize],
                   num_basins: 0}
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn label(&self, x: u32, y: u32) -> u32 {
        self.labels[(y * self.width + x) as usize]
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Number of seeds the segmentation was grown from.
    pub fn num_basins(&self) -> u32 {
        self.num_basins
    }

    /// Pixel count of each basin; element 0 is basin 1.
    pub fn basin_areas(&self) -> Vec<u32> {
        let mut areas = vec![0_u32; self.num_basins as usize];
        for label in &self.labels {
            if *label != BACKGROUND && *label != BOUNDARY {
                areas[*label as usize - 1] += 1;
            }
        }
        areas
    }

    /// Byte rendering: background 0, boundary 255, basins cycle through
    /// 1..=254.
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([match self.label(x, y) {
                BACKGROUND => 0,
                BOUNDARY => 255,
                basin => ((basin - 1) % 254 + 1) as u8,
            }])
        })
    }

    /// Basin pixels 255, boundary and background 0.
    pub fn to_binary_mask(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([match self.label(x, y) {
                BACKGROUND | BOUNDARY => 0,
                _ => 255,
            }])
        })
    }
}

/// Detects maxima on `plane` using `params` and segments the same plane
/// from them.
pub fn segment(plane: &FloatImage, params: &DetectionParams) -> LabelImage {
    let seeds = find_maxima(plane, params, None);
    let excluded = excluded_edge_maxima(plane, &seeds, params);
    segment_excluding(plane, &seeds, &excluded, params)
}

/// Maxima of `plane` that `params.exclude_on_edges` dropped from `seeds`.
/// Empty when edge maxima are not excluded.
pub fn excluded_edge_maxima(plane: &FloatImage, seeds: &MaximaSet,
                            params: &DetectionParams) -> MaximaSet {
    if !params.exclude_on_edges {
        return MaximaSet::default();
    }
    let all = find_maxima(plane, &DetectionParams{exclude_on_edges: false, ..*params},
                          None);
    let points = all.points.into_iter()
        .filter(|p| !seeds.points.iter().any(|s| s.x == p.x && s.y == p.y))
        .collect();
    MaximaSet{points, exclude_on_edges: false}
}

#[derive(Copy, Clone, Debug)]
struct QueueEntry {
    value: f32,
    index: usize,
}

// Max-heap order: brighter first, then lower pixel index first.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.total_cmp(&other.value)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

/// Grows one basin per seed over `plane` by priority flood. Pixels are
/// claimed brightest first; a pixel bordering two or more basins becomes
/// [BOUNDARY], and so does any qualifying pixel reachable only through
/// boundary pixels. Pixels that do not exceed the threshold (for distance
/// maps: that are not positive) stay [BACKGROUND].
///
/// `params.threshold`, `params.is_edm` and `params.light_background` are
/// honored; the seeds are used as given.
pub fn segment_with_seeds(plane: &FloatImage, seeds: &MaximaSet,
                          params: &DetectionParams) -> LabelImage {
    segment_excluding(plane, seeds, &MaximaSet::default(), params)
}

/// Like [segment_with_seeds], but `excluded` maxima also grow basins that
/// compete for pixels and are then reset to [BACKGROUND]. Objects owned by
/// an excluded maximum thus stay unsegmented instead of being absorbed by
/// a neighbouring basin. Only `seeds` count toward
/// [LabelImage::num_basins].
pub fn segment_excluding(plane: &FloatImage, seeds: &MaximaSet,
                         excluded: &MaximaSet, params: &DetectionParams)
                         -> LabelImage {
    let segment_start = Instant::now();
    let (width, height) = plane.dimensions();
    let mut label_image = LabelImage::new_background(width, height);
    if seeds.is_empty() {
        info!("No seeds; segmentation is all background");
        return label_image;
    }
    let values = if params.light_background {
        invert(plane).into_raw()
    } else {
        plane.as_raw().clone()
    };
    let threshold = params.threshold as f32;
    let qualifies = |i: usize| {
        if params.is_edm { values[i] > 0.0 } else { values[i] > threshold }
    };
    let (w, h) = (width as i64, height as i64);
    let neighbors = |i: usize| {
        let (x, y) = ((i % width as usize) as i64, (i / width as usize) as i64);
        (-1_i64..=1).flat_map(move |dy| (-1_i64..=1).map(move |dx| (dx, dy)))
            .filter(|(dx, dy)| *dx != 0 || *dy != 0)
            .filter_map(move |(dx, dy)| {
                let (x2, y2) = (x + dx, y + dy);
                if x2 < 0 || y2 < 0 || x2 >= w || y2 >= h {
                    None
                } else {
                    Some((y2 * w + x2) as usize)
                }
            })
    };

    let labels = &mut label_image.labels;
    let mut queued = vec![false; labels.len()];
    let mut queue = BinaryHeap::<QueueEntry>::new();
    let mut seed_pixels = Vec::<usize>::with_capacity(seeds.len() + excluded.len());
    let mut num_labels = 0_u32;
    let mut num_basins = 0_u32;
    for (set, counted) in [(seeds, true), (excluded, false)] {
        for seed in &set.points {
            if seed.x >= width || seed.y >= height {
                warn!("Seed ({}, {}) outside {}x{} plane", seed.x, seed.y, width, height);
                continue;
            }
            let i = (seed.y * width + seed.x) as usize;
            if queued[i] {
                continue;
            }
            num_labels += 1;
            if counted {
                num_basins = num_labels;
            }
            labels[i] = num_labels;
            queued[i] = true;
            seed_pixels.push(i);
        }
    }
    for &i in &seed_pixels {
        for n in neighbors(i) {
            if !queued[n] && qualifies(n) {
                queued[n] = true;
                queue.push(QueueEntry{value: values[n], index: n});
            }
        }
    }

    // Popped before any basin reached them; requeued if one does later.
    let mut stranded = Vec::<usize>::new();
    while let Some(entry) = queue.pop() {
        let i = entry.index;
        // Distinct basins already touching this pixel.
        let mut basin = BACKGROUND;
        let mut contested = false;
        for n in neighbors(i) {
            let l = labels[n];
            if l == BACKGROUND || l == BOUNDARY {
                continue;
            }
            if basin == BACKGROUND {
                basin = l;
            } else if basin != l {
                contested = true;
                break;
            }
        }
        if basin == BACKGROUND {
            queued[i] = false;
            stranded.push(i);
            continue;
        }
        labels[i] = if contested { BOUNDARY } else { basin };
        for n in neighbors(i) {
            if !queued[n] && qualifies(n) {
                queued[n] = true;
                queue.push(QueueEntry{value: values[n], index: n});
            }
        }
    }

    // Qualifying pixels reachable only through boundary pixels.
    while let Some(i) = stranded.pop() {
        if labels[i] != BACKGROUND {
            continue;
        }
        labels[i] = BOUNDARY;
        for n in neighbors(i) {
            if labels[n] == BACKGROUND && qualifies(n) {
                stranded.push(n);
            }
        }
    }
    let mut boundary_count = 0;
    for label in labels.iter_mut() {
        if *label == BOUNDARY {
            boundary_count += 1;
        } else if *label > num_basins {
            *label = BACKGROUND;
        }
    }
    label_image.num_basins = num_basins;
    info!("Segmented {} basins ({} boundary pixels, {} excluded maxima) in {:?}",
          num_basins, boundary_count, num_labels - num_basins,
          segment_start.elapsed());
    label_image
}

#[cfg(test)]
mod tests {
    use crate::maxima::Point;
    use crate::plane::uniform_plane;
    use super::*;

    fn params(tolerance: f64) -> DetectionParams {
        DetectionParams{tolerance, threshold: 0.0, exclude_on_edges: true,
                        is_edm: false, light_background: false}
    }

    // Two pyramids of heights 50 and 40 with apexes at (2, 2) and (6, 2).
    fn two_hills() -> FloatImage {
        FloatImage::from_fn(9, 5, |x, y| {
            let hill = |cx: i32, cy: i32, top: f32| {
                let d = i32::max((x as i32 - cx).abs(), (y as i32 - cy).abs());
                top - 8.0 * d as f32
            };
            Luma([f32::max(hill(2, 2, 50.0), hill(6, 2, 40.0)).max(0.0)])
        })
    }

    fn assert_basins_not_adjacent(labels: &LabelImage) {
        let (width, height) = labels.dimensions();
        for y in 0..height {
            for x in 0..width {
                let l = labels.label(x, y);
                if l == BACKGROUND || l == BOUNDARY {
                    continue;
                }
                for y2 in y.saturating_sub(1)..u32::min(y + 2, height) {
                    for x2 in x.saturating_sub(1)..u32::min(x + 2, width) {
                        let l2 = labels.label(x2, y2);
                        assert!(l2 == l || l2 == BACKGROUND || l2 == BOUNDARY,
                                "basins {} and {} touch at ({}, {})", l, l2, x, y);
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_seeds_is_background() {
        let plane = uniform_plane(4, 3, 7.0);
        let labels = segment(&plane, &params(1.0));
        assert_eq!(labels.num_basins(), 0);
        assert!(labels.labels().iter().all(|l| *l == BACKGROUND));
        assert!(labels.to_gray_image().as_raw().iter().all(|v| *v == 0));
    }

    #[test]
    fn test_single_peak() {
        let mut plane = uniform_plane(5, 5, 0.0);
        plane.put_pixel(2, 2, Luma([100.0]));
        let labels = segment(&plane, &params(10.0));
        assert_eq!(labels.num_basins(), 1);
        for y in 0..5 {
            for x in 0..5 {
                let expected = if (x, y) == (2, 2) { 1 } else { BACKGROUND };
                assert_eq!(labels.label(x, y), expected);
            }
        }
    }

    #[test]
    fn test_two_basins_with_boundary() {
        let plane = two_hills();
        let seeds = find_maxima(&plane, &params(5.0), None);
        assert_eq!(seeds.len(), 2);
        let labels = segment_with_seeds(&plane, &seeds, &params(5.0));
        assert_eq!(labels.num_basins(), 2);
        assert_eq!(labels.label(2, 2), 1);
        assert_eq!(labels.label(6, 2), 2);
        assert!(labels.labels().iter().any(|l| *l == BOUNDARY));
        assert_basins_not_adjacent(&labels);
        let areas = labels.basin_areas();
        assert_eq!(areas.len(), 2);
        assert!(areas[0] > areas[1]);
        // Every positive pixel is claimed by a basin or a boundary.
        for (i, label) in labels.labels().iter().enumerate() {
            if plane.as_raw()[i] > 0.0 {
                assert_ne!(*label, BACKGROUND, "pixel {} unclaimed", i);
            }
        }
    }

    #[test]
    fn test_merged_peaks_make_one_basin() {
        let plane = two_hills();
        let seeds = find_maxima(&plane, &params(10.0), None);
        assert_eq!(seeds.len(), 1);
        let labels = segment_with_seeds(&plane, &seeds, &params(10.0));
        assert_eq!(labels.num_basins(), 1);
        assert!(labels.labels().iter().all(|l| *l != BOUNDARY));
        assert_eq!(labels.label(6, 2), 1);
    }

    #[test]
    fn test_threshold_limits_basins() {
        let plane = two_hills();
        let mut high = params(5.0);
        high.threshold = 30.0;
        let labels = segment(&plane, &high);
        for (i, label) in labels.labels().iter().enumerate() {
            if plane.as_raw()[i] <= 30.0 {
                assert_eq!(*label, BACKGROUND);
            }
        }
        assert_eq!(labels.label(2, 2), 1);
    }

    #[test]
    fn test_light_background_segmentation() {
        let mut plane = uniform_plane(7, 7, 200.0);
        plane.put_pixel(3, 3, Luma([20.0]));
        plane.put_pixel(2, 3, Luma([60.0]));
        let mut dark = params(10.0);
        dark.light_background = true;
        // The reflected background sits at 20.
        dark.threshold = 50.0;
        let labels = segment(&plane, &dark);
        assert_eq!(labels.num_basins(), 1);
        assert_eq!(labels.label(3, 3), 1);
        assert_eq!(labels.label(2, 3), 1);
        assert_eq!(labels.label(0, 0), BACKGROUND);
    }

    #[test]
    fn test_seed_outside_plane_is_skipped() {
        let plane = uniform_plane(3, 3, 5.0);
        let seeds = MaximaSet{points: vec![Point{id: 0, x: 9, y: 9}],
                              exclude_on_edges: false};
        let labels = segment_with_seeds(&plane, &seeds, &params(1.0));
        assert_eq!(labels.num_basins(), 0);
    }

    // Corridor 50..10..50 along row 2 with a dim spur hanging below the
    // saddle at x = 5.
    fn corridor_with_spur() -> FloatImage {
        let row = [0.0, 50.0, 40.0, 30.0, 20.0, 10.0, 20.0, 30.0, 40.0, 50.0, 0.0];
        FloatImage::from_fn(11, 8, |x, y| {
            if y == 2 {
                Luma([row[x as usize]])
            } else if x == 5 && (3..=6).contains(&y) {
                Luma([5.0])
            } else {
                Luma([0.0])
            }
        })
    }

    #[test]
    fn test_pixels_behind_boundary_are_boundary() {
        let plane = corridor_with_spur();
        let labels = segment(&plane, &params(5.0));
        assert_eq!(labels.num_basins(), 2);
        assert_eq!(labels.label(1, 2), 1);
        assert_eq!(labels.label(9, 2), 2);
        for y in 2..=6 {
            assert_eq!(labels.label(5, y), BOUNDARY, "at (5, {})", y);
        }
        for (x, y, v) in plane.enumerate_pixels() {
            if v.0[0] > 0.0 {
                assert_ne!(labels.label(x, y), BACKGROUND, "({}, {}) unclaimed", x, y);
            }
        }
        assert_basins_not_adjacent(&labels);
    }

    // Interior peak 60 at (3, 2) and edge peak 50 at (10, 2) on a ridge of 20.
    fn interior_and_edge_peaks() -> FloatImage {
        FloatImage::from_fn(11, 5, |x, y| {
            Luma([match (x, y) {
                (3, 2) => 60.0,
                (10, 2) => 50.0,
                (1..=9, 2) => 20.0,
                _ => 0.0,
            }])
        })
    }

    #[test]
    fn test_excluded_edge_object_stays_background() {
        let plane = interior_and_edge_peaks();
        let p = params(10.0);
        let seeds = find_maxima(&plane, &p, None);
        assert_eq!(seeds.len(), 1);
        let excluded = excluded_edge_maxima(&plane, &seeds, &p);
        assert_eq!(excluded.len(), 1);
        assert_eq!((excluded.points[0].x, excluded.points[0].y), (10, 2));

        let labels = segment(&plane, &p);
        assert_eq!(labels.num_basins(), 1);
        assert_eq!(labels.label(3, 2), 1);
        assert_eq!(labels.label(10, 2), BACKGROUND);
        assert_eq!(labels.label(9, 2), BOUNDARY);
        let (width, height) = labels.dimensions();
        for y in 0..height {
            for x in 0..width {
                if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
                    assert_ne!(labels.label(x, y), 1, "basin on border at ({}, {})", x, y);
                }
            }
        }
        assert_eq!(labels.basin_areas(), vec![8]);
    }

    #[test]
    fn test_edge_object_segmented_when_kept() {
        let plane = interior_and_edge_peaks();
        let p = DetectionParams{exclude_on_edges: false, ..params(10.0)};
        assert!(excluded_edge_maxima(&plane, &find_maxima(&plane, &p, None), &p)
                .is_empty());
        let labels = segment(&plane, &p);
        assert_eq!(labels.num_basins(), 2);
        assert_eq!(labels.label(10, 2), 2);
        assert_basins_not_adjacent(&labels);
    }

    #[test]
    fn test_gray_rendering() {
        let mut labels = LabelImage::new_background(3, 1);
        labels.labels = vec![1, BOUNDARY, 256];
        labels.num_basins = 256;
        let gray = labels.to_gray_image();
        assert_eq!(gray.as_raw(), &vec![1, 255, 2]);
        assert_eq!(labels.to_binary_mask().as_raw(), &vec![255, 0, 255]);
    }
}
