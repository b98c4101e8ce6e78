// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Local maxima detection with noise tolerance.
//!
//! A local maximum is accepted only if the flood of pixels reachable from it
//! without dropping more than `tolerance` below its height never meets a
//! higher pixel or a region already claimed by an earlier (higher) maximum.
//! Two peaks separated by a saddle no deeper than `tolerance` below the lower
//! peak are thus reported once, as the higher peak.

use std::f32::consts::SQRT_2;
use std::time::Instant;

use log::{debug, info};

use crate::plane::{invert, min_max_of, FloatImage};
use crate::region_mask::RegionMask;

/// A pixel location with an identifier that reflects creation order within
/// one list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Point {
    pub id: u32,
    pub x: u32,
    pub y: u32,
}

/// Accepted maxima, in acceptance order. Records the edge rule it was
/// computed under.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaximaSet {
    pub points: Vec<Point>,
    pub exclude_on_edges: bool,
}

impl MaximaSet {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Returns the points contained in `mask`, with identifiers re-assigned
    /// in order. An empty mask keeps every point.
    pub fn within(&self, mask: &RegionMask) -> MaximaSet {
        if mask.is_empty() {
            return self.clone();
        }
        let points = self.points.iter()
            .filter(|p| mask.contains(p.x, p.y))
            .enumerate()
            .map(|(id, p)| Point{id: id as u32, x: p.x, y: p.y})
            .collect();
        MaximaSet{points, exclude_on_edges: self.exclude_on_edges}
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DetectionParams {
    /// Minimum saddle depth separating two distinct maxima.
    pub tolerance: f64,
    /// Only pixels brighter than this can be maxima.
    pub threshold: f64,
    pub exclude_on_edges: bool,
    /// The plane is a Euclidean distance map.
    pub is_edm: bool,
    /// Objects are darker than the background.
    pub light_background: bool,
}

// Per-pixel state flags.
const LISTED: u8 = 2;  // In the current flood list.
const PROCESSED: u8 = 4;  // Claimed by an earlier flood.
const EQUAL: u8 = 16;  // Same height as the current flood's start.

// Neighbor directions, clockwise from up.
const DIR_X: [i64; 8] = [0, 1, 1, 1, 0, -1, -1, -1];
const DIR_Y: [i64; 8] = [-1, -1, 0, 1, 1, 1, 0, -1];

/// Finds the maxima of `plane`. If `mask` is given, the maxima are detected
/// over the whole plane and then only those inside the mask are kept.
pub fn find_maxima(plane: &FloatImage, params: &DetectionParams,
                   mask: Option<&RegionMask>) -> MaximaSet {
    let maxima = MaximumFinder::new(plane, params).run();
    match mask {
        Some(m) => maxima.within(m),
        None => maxima,
    }
}

// Working state for one detection call. Pixels are addressed by row-major
// index.
struct MaximumFinder {
    width: usize,
    height: usize,
    // Intensities after polarity correction.
    values: Vec<f32>,
    // Heights used for ordering and comparison. Same as `values` except for
    // distance maps.
    heights: Vec<f32>,
    types: Vec<u8>,
    params: DetectionParams,
    global_min: f32,
    global_max: f32,
}

impl MaximumFinder {
    fn new(plane: &FloatImage, params: &DetectionParams) -> MaximumFinder {
        let (width, height) = (plane.width() as usize, plane.height() as usize);
        let values = if params.light_background {
            invert(plane).into_raw()
        } else {
            plane.as_raw().clone()
        };
        let (global_min, global_max) = min_max_of(&values);
        let mut finder = MaximumFinder{
            width, height,
            heights: Vec::new(),
            types: vec![0; values.len()],
            values,
            params: *params,
            global_min,
            global_max,
        };
        finder.heights = if params.is_edm {
            (0..finder.values.len()).map(|i| finder.true_edm_height(i)).collect()
        } else {
            finder.values.clone()
        };
        finder
    }

    fn run(mut self) -> MaximaSet {
        let start = Instant::now();
        let candidates = self.sorted_candidates();
        let points = self.analyse_and_mark(&candidates);
        info!("Found {} maxima from {} candidates in {:?}",
              points.len(), candidates.len(), start.elapsed());
        MaximaSet{points, exclude_on_edges: self.params.exclude_on_edges}
    }

    fn is_edge(&self, x: usize, y: usize) -> bool {
        x == 0 || y == 0 || x == self.width - 1 || y == self.height - 1
    }

    // Index of the neighbor of (x, y) in direction `d`, if inside the plane.
    fn neighbor(&self, x: usize, y: usize, d: usize) -> Option<usize> {
        let x2 = x as i64 + DIR_X[d];
        let y2 = y as i64 + DIR_Y[d];
        if x2 < 0 || y2 < 0 || x2 >= self.width as i64 || y2 >= self.height as i64 {
            return None;
        }
        Some(y2 as usize * self.width + x2 as usize)
    }

    // Height of a distance map pixel after correcting for the integer
    // quantization of the map: ridge pixels are interpolated from their
    // opposite neighbors, so flat ridges do not produce runs of spurious
    // maxima.
    fn true_edm_height(&self, i: usize) -> f32 {
        let (x, y) = (i % self.width, i / self.width);
        let v = self.values[i];
        if self.is_edge(x, y) || v == 0.0 {
            return v;
        }
        let mut true_height = v + 0.5 * SQRT_2;
        let mut ridge_or_max = false;
        for d in 0..4 {
            // Interior pixel, so both neighbors exist.
            let v1 = self.values[self.neighbor(x, y, d).unwrap_or(i)];
            let v2 = self.values[self.neighbor(x, y, d + 4).unwrap_or(i)];
            let mut h = if v >= v1 && v >= v2 {
                ridge_or_max = true;
                (v1 + v2) / 2.0
            } else {
                f32::min(v1, v2)
            };
            h += if d % 2 == 0 { 1.0 } else { SQRT_2 };
            true_height = f32::min(true_height, h);
        }
        if !ridge_or_max {
            true_height = v;
        }
        true_height
    }

    // Local maxima above threshold, highest first. Equal heights are ordered
    // by ascending pixel index.
    fn sorted_candidates(&mut self) -> Vec<usize> {
        let exclude_edges = self.params.exclude_on_edges;
        let threshold = self.params.threshold as f32;
        let mut candidates = Vec::<usize>::new();
        for y in 0..self.height {
            for x in 0..self.width {
                let i = y * self.width + x;
                let v = self.values[i];
                if v == self.global_min || v <= threshold {
                    continue;
                }
                if exclude_edges && self.is_edge(x, y) {
                    continue;
                }
                let h = self.heights[i];
                let is_max = (0..8).all(|d| match self.neighbor(x, y, d) {
                    Some(n) => !(self.values[n] > v && self.heights[n] > h),
                    None => true,
                });
                if is_max {
                    candidates.push(i);
                }
            }
        }
        candidates.sort_by(|a, b| {
            self.heights[*b].total_cmp(&self.heights[*a]).then(a.cmp(b))
        });
        candidates
    }

    fn analyse_and_mark(&mut self, candidates: &[usize]) -> Vec<Point> {
        let tolerance = self.params.tolerance as f32;
        let exclude_edges = self.params.exclude_on_edges;
        let max_sorting_error = if self.params.is_edm {
            1.1 * SQRT_2 / 2.0
        } else {
            1.1 * (self.global_max - self.global_min) / 2e9
        };
        let mut accepted = Vec::<Point>::new();
        let mut list = Vec::<usize>::with_capacity(self.values.len());

        for &candidate in candidates {
            if self.types[candidate] & PROCESSED != 0 {
                continue;
            }
            let mut start = candidate;
            let mut v0 = self.heights[start];
            loop {
                list.clear();
                list.push(start);
                self.types[start] |= EQUAL | LISTED;
                let (x0, y0) = (start % self.width, start / self.width);
                let mut is_edge_maximum = self.is_edge(x0, y0);
                let mut sorting_error = false;
                let mut max_possible = true;
                let (mut x_equal, mut y_equal, mut n_equal) = (x0 as f64, y0 as f64, 1);

                let mut list_index = 0;
                while list_index < list.len() {
                    let offset = list[list_index];
                    let (x, y) = (offset % self.width, offset / self.width);
                    for d in 0..8 {
                        let Some(offset2) = self.neighbor(x, y, d) else {
                            continue;
                        };
                        if self.types[offset2] & LISTED != 0 {
                            continue;
                        }
                        if self.params.is_edm && self.values[offset2] <= 0.0 {
                            continue;  // Background of the distance map.
                        }
                        if self.types[offset2] & PROCESSED != 0 {
                            // Claimed by an earlier maximum.
                            max_possible = false;
                            break;
                        }
                        let v2 = self.heights[offset2];
                        if v2 > v0 + max_sorting_error {
                            // Reached a higher point.
                            max_possible = false;
                            break;
                        }
                        if v2 < v0 - tolerance {
                            continue;
                        }
                        if v2 > v0 {
                            // This point should have been the start.
                            sorting_error = true;
                            start = offset2;
                            v0 = v2;
                        }
                        list.push(offset2);
                        self.types[offset2] |= LISTED;
                        let (x2, y2) = (offset2 % self.width, offset2 / self.width);
                        if self.is_edge(x2, y2) {
                            is_edge_maximum = true;
                            if exclude_edges {
                                max_possible = false;
                                break;
                            }
                        }
                        if v2 == v0 {
                            self.types[offset2] |= EQUAL;
                            x_equal += x2 as f64;
                            y_equal += y2 as f64;
                            n_equal += 1;
                        }
                    }
                    list_index += 1;
                }

                if sorting_error {
                    debug!("Restarting flood from higher point {} (was {})",
                           start, candidate);
                    for &offset in &list {
                        self.types[offset] = 0;
                    }
                    continue;
                }

                let reset_mask = if max_possible { !LISTED } else { !(LISTED | EQUAL) };
                x_equal /= n_equal as f64;
                y_equal /= n_equal as f64;
                let mut min_dist2 = f64::MAX;
                let mut nearest = list[0];
                for &offset in &list {
                    self.types[offset] &= reset_mask;
                    self.types[offset] |= PROCESSED;
                    if max_possible {
                        if self.types[offset] & EQUAL != 0 {
                            let dx = x_equal - (offset % self.width) as f64;
                            let dy = y_equal - (offset / self.width) as f64;
                            let dist2 = dx * dx + dy * dy;
                            if dist2 < min_dist2 {
                                min_dist2 = dist2;
                                nearest = offset;
                            }
                        }
                    }
                }
                if max_possible {
                    if !(exclude_edges && is_edge_maximum) {
                        let (x, y) = (nearest % self.width, nearest / self.width);
                        debug!("Maximum at ({}, {}) height {} area {}",
                               x, y, v0, list.len());
                        accepted.push(Point{id: accepted.len() as u32,
                                            x: x as u32, y: y as u32});
                    }
                }
                break;
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use imageproc::rect::Rect;
    use crate::plane::uniform_plane;
    use super::*;

    fn plane_from_rows(rows: &[&[f32]]) -> FloatImage {
        let height = rows.len() as u32;
        let width = rows[0].len() as u32;
        let samples: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        FloatImage::from_raw(width, height, samples).unwrap()
    }

    fn params(tolerance: f64, exclude_on_edges: bool) -> DetectionParams {
        DetectionParams{tolerance, threshold: 0.0, exclude_on_edges,
                        is_edm: false, light_background: false}
    }

    fn coords(maxima: &MaximaSet) -> Vec<(u32, u32)> {
        maxima.points.iter().map(|p| (p.x, p.y)).collect()
    }

    #[test]
    fn test_nothing_above_threshold() {
        let plane = uniform_plane(6, 5, 3.0);
        assert!(find_maxima(&plane, &params(1.0, false), None).is_empty());

        let mut plane = uniform_plane(6, 5, 0.0);
        plane.put_pixel(2, 2, Luma([4.0]));
        let mut high_threshold = params(1.0, false);
        high_threshold.threshold = 4.0;
        assert!(find_maxima(&plane, &high_threshold, None).is_empty());
        high_threshold.threshold = 3.9;
        assert_eq!(find_maxima(&plane, &high_threshold, None).len(), 1);
    }

    #[test]
    fn test_single_peak() {
        let mut plane = uniform_plane(5, 5, 0.0);
        plane.put_pixel(2, 2, Luma([100.0]));
        let maxima = find_maxima(&plane, &params(10.0, true), None);
        assert_eq!(maxima.points, vec![Point{id: 0, x: 2, y: 2}]);
        assert!(maxima.exclude_on_edges);
    }

    #[test]
    fn test_flood_clears_listed_state() {
        let mut plane = uniform_plane(7, 5, 0.0);
        plane.put_pixel(2, 2, Luma([100.0]));
        plane.put_pixel(5, 2, Luma([60.0]));
        plane.put_pixel(6, 2, Luma([55.0]));
        let mut finder = MaximumFinder::new(&plane, &params(10.0, true));
        let candidates = finder.sorted_candidates();
        assert_eq!(candidates, vec![16, 19]);
        let points = finder.analyse_and_mark(&candidates);
        assert_eq!(points, vec![Point{id: 0, x: 2, y: 2}]);
        assert_eq!(finder.types[16], PROCESSED | EQUAL);
        // The flood from 60 reached the edge; it keeps only the processed mark.
        assert_eq!(finder.types[19], PROCESSED);
        assert_eq!(finder.types[20], PROCESSED);
        assert!(finder.types.iter().all(|t| t & LISTED == 0));
    }

    #[test]
    fn test_saddle_depth_decides_merging() {
        // Peaks of 100 and 80 joined by a saddle at 65, i.e. 15 below the
        // lower peak.
        let row: &[f32] = &[0.0, 100.0, 90.0, 65.0, 70.0, 80.0, 0.0];
        let zeros: &[f32] = &[0.0; 7];
        let plane = plane_from_rows(&[zeros, row, zeros]);

        let distinct = find_maxima(&plane, &params(14.0, false), None);
        assert_eq!(coords(&distinct), vec![(1, 1), (5, 1)]);

        let merged = find_maxima(&plane, &params(15.0, false), None);
        assert_eq!(coords(&merged), vec![(1, 1)]);

        let merged = find_maxima(&plane, &params(30.0, false), None);
        assert_eq!(coords(&merged), vec![(1, 1)]);
    }

    #[test]
    fn test_acceptance_order_is_by_height() {
        let mut plane = uniform_plane(9, 5, 0.0);
        plane.put_pixel(1, 2, Luma([10.0]));
        plane.put_pixel(4, 2, Luma([30.0]));
        plane.put_pixel(7, 2, Luma([20.0]));
        let maxima = find_maxima(&plane, &params(5.0, true), None);
        assert_eq!(maxima.points, vec![Point{id: 0, x: 4, y: 2},
                                       Point{id: 1, x: 7, y: 2},
                                       Point{id: 2, x: 1, y: 2}]);
    }

    #[test]
    fn test_equal_peaks_ordered_by_index() {
        let mut plane = uniform_plane(7, 7, 0.0);
        plane.put_pixel(5, 1, Luma([50.0]));
        plane.put_pixel(1, 5, Luma([50.0]));
        plane.put_pixel(2, 3, Luma([50.0]));
        let maxima = find_maxima(&plane, &params(5.0, true), None);
        assert_eq!(coords(&maxima), vec![(5, 1), (2, 3), (1, 5)]);
    }

    #[test]
    fn test_edge_exclusion() {
        let mut plane = uniform_plane(7, 5, 0.0);
        plane.put_pixel(3, 0, Luma([40.0]));
        plane.put_pixel(3, 3, Luma([60.0]));
        let kept = find_maxima(&plane, &params(5.0, false), None);
        assert_eq!(coords(&kept), vec![(3, 3), (3, 0)]);
        let excluded = find_maxima(&plane, &params(5.0, true), None);
        assert_eq!(coords(&excluded), vec![(3, 3)]);
    }

    #[test]
    fn test_flood_touching_edge_is_excluded() {
        // Peak sits one pixel in from the border but its tolerance region
        // reaches the border.
        let mut plane = uniform_plane(6, 6, 0.0);
        plane.put_pixel(1, 2, Luma([50.0]));
        plane.put_pixel(0, 2, Luma([45.0]));
        assert_eq!(find_maxima(&plane, &params(10.0, true), None).len(), 0);
        assert_eq!(find_maxima(&plane, &params(10.0, false), None).len(), 1);
        assert_eq!(find_maxima(&plane, &params(2.0, true), None).len(), 1);
    }

    #[test]
    fn test_plateau_representative() {
        // A flat 3 pixel plateau yields a single maximum at its center.
        let mut plane = uniform_plane(7, 5, 0.0);
        for x in 2..5 {
            plane.put_pixel(x, 2, Luma([20.0]));
        }
        let maxima = find_maxima(&plane, &params(1.0, true), None);
        assert_eq!(coords(&maxima), vec![(3, 2)]);

        // Two-pixel plateau: both are equally near the centroid; the first
        // reached wins.
        let mut plane = uniform_plane(6, 5, 0.0);
        plane.put_pixel(2, 2, Luma([20.0]));
        plane.put_pixel(3, 2, Luma([20.0]));
        let maxima = find_maxima(&plane, &params(1.0, true), None);
        assert_eq!(coords(&maxima), vec![(2, 2)]);
    }

    #[test]
    fn test_light_background() {
        let mut plane = uniform_plane(5, 5, 100.0);
        plane.put_pixel(2, 2, Luma([10.0]));
        let mut dark = params(10.0, true);
        dark.light_background = true;
        assert_eq!(coords(&find_maxima(&plane, &dark, None)), vec![(2, 2)]);
        // Without inversion, the bright background touches the edges.
        assert!(find_maxima(&plane, &params(10.0, true), None).is_empty());
    }

    #[test]
    fn test_distance_map_ridge() {
        // Quantized ridge of a distance map: alternating 2.2 / 2.0 values.
        let zeros: &[f32] = &[0.0; 9];
        let ones: &[f32] = &[0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let ridge: &[f32] = &[0.0, 1.0, 2.2, 2.0, 2.2, 2.0, 2.2, 1.0, 0.0];
        let plane = plane_from_rows(&[zeros, ones, ridge, ones, zeros]);

        let plain = find_maxima(&plane, &params(0.1, true), None);
        assert_eq!(coords(&plain), vec![(2, 2), (4, 2), (6, 2)]);

        let mut edm = params(0.1, true);
        edm.is_edm = true;
        assert_eq!(coords(&find_maxima(&plane, &edm, None)), vec![(4, 2)]);
    }

    #[test]
    fn test_mask_filters_after_detection() {
        let mut plane = uniform_plane(9, 5, 0.0);
        plane.put_pixel(1, 2, Luma([10.0]));
        plane.put_pixel(4, 2, Luma([30.0]));
        plane.put_pixel(7, 2, Luma([20.0]));
        let all = find_maxima(&plane, &params(5.0, true), None);
        let mask = RegionMask::Rectangle(Rect::at(3, 0).of_size(6, 5));
        let inside = find_maxima(&plane, &params(5.0, true), Some(&mask));
        assert_eq!(inside.points, vec![Point{id: 0, x: 4, y: 2},
                                       Point{id: 1, x: 7, y: 2}]);
        assert!(inside.points.iter().all(
            |p| all.points.iter().any(|q| (q.x, q.y) == (p.x, p.y))));

        let empty = RegionMask::Polygon(Vec::new());
        assert_eq!(all.within(&empty), all);
    }
}
