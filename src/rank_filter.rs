// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use log::debug;

use crate::plane::FloatImage;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RankMode {
    Median,
    Mean,
}

/// Image filter service used for pre-detection despeckling and smoothing.
/// Implementations overwrite `plane` in place. A `radius` of zero (or less)
/// must leave the plane untouched.
pub trait RankFilter: Send + Sync {
    fn rank(&self, plane: &mut FloatImage, radius: f64, mode: RankMode);
}

/// Rank filter over a circular neighborhood. Out-of-image samples take the
/// value of the nearest edge pixel.
#[derive(Copy, Clone, Debug, Default)]
pub struct CircularRankFilter;

impl RankFilter for CircularRankFilter {
    fn rank(&self, plane: &mut FloatImage, radius: f64, mode: RankMode) {
        if radius <= 0.0 {
            return;
        }
        let filter_start = Instant::now();
        let line_radii = make_line_radii(radius);
        let k_radius = (line_radii.len() / 2) as i64;
        let (width, height) = plane.dimensions();
        let source = plane.as_raw().clone();
        let mut values = Vec::<f32>::new();
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                values.clear();
                for (line, dx) in line_radii.iter().enumerate() {
                    let sy = (y + line as i64 - k_radius)
                        .clamp(0, height as i64 - 1) as usize;
                    let row = &source[sy * width as usize..(sy + 1) * width as usize];
                    for sx in x - dx..=x + dx {
                        values.push(row[sx.clamp(0, width as i64 - 1) as usize]);
                    }
                }
                let result = match mode {
                    RankMode::Mean => {
                        values.iter().map(|v| *v as f64).sum::<f64>() as f32 /
                            values.len() as f32
                    },
                    RankMode::Median => {
                        let mid = values.len() / 2;
                        *values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b)).1
                    },
                };
                plane.put_pixel(x as u32, y as u32, image::Luma([result]));
            }
        }
        debug!("{:?} filter radius {} on {}x{} in {:?}",
               mode, radius, width, height, filter_start.elapsed());
    }
}

// Half widths of the kernel rows, top to bottom. Radii just above 1.5 and 2.5
// are widened slightly to get rounder kernels.
fn make_line_radii(radius: f64) -> Vec<i64> {
    let radius = if (1.5..1.75).contains(&radius) {
        1.75
    } else if (2.5..2.85).contains(&radius) {
        2.85
    } else {
        radius
    };
    let r2 = (radius * radius) as i64 + 1;
    let k_radius = ((r2 as f64 + 1e-10).sqrt()) as i64;
    (-k_radius..=k_radius)
        .map(|dy| ((r2 - dy * dy) as f64 + 1e-10).sqrt() as i64)
        .collect()
}
