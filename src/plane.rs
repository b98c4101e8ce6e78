// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{DynamicImage, ImageBuffer, Luma};

/// A single-channel floating point intensity plane, row-major.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Returns a `width` x `height` plane with every sample set to `value`.
pub fn uniform_plane(width: u32, height: u32, value: f32) -> FloatImage {
    FloatImage::from_pixel(width, height, Luma([value]))
}

/// Number of colour channels of `image` that [extract_channel()] accepts.
pub fn channel_count(image: &DynamicImage) -> u8 {
    image.color().channel_count()
}

/// Converts one colour channel of a decoded image to a float plane. Sample
/// values keep their native scale (0..255 for 8 bit, 0..65535 for 16 bit,
/// unscaled for float images). Returns None if `channel` does not exist.
pub fn extract_channel(image: &DynamicImage, channel: u8) -> Option<FloatImage> {
    let num_channels = channel_count(image);
    if channel >= num_channels {
        return None;
    }
    let (width, height) = (image.width(), image.height());
    let stride = num_channels as usize;
    let offset = channel as usize;
    let samples: Vec<f32> = match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_) |
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) =>
            image.as_bytes().iter().skip(offset).step_by(stride)
            .map(|v| *v as f32).collect(),
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) |
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) => {
            let wide = image.to_rgba16();
            let rgba_offset = if num_channels <= 2 && offset == 1 { 3 } else { offset };
            wide.as_raw().iter().skip(rgba_offset).step_by(4)
                .map(|v| *v as f32).collect()
        },
        _ => {
            let float = image.to_rgba32f();
            let rgba_offset = if num_channels <= 2 && offset == 1 { 3 } else { offset };
            float.as_raw().iter().skip(rgba_offset).step_by(4).copied().collect()
        },
    };
    FloatImage::from_raw(width, height, samples)
}

/// Returns (min, max) over all samples. An empty plane yields (0, 0).
pub fn min_max(plane: &FloatImage) -> (f32, f32) {
    min_max_of(plane.as_raw())
}

pub fn min_max_of(samples: &[f32]) -> (f32, f32) {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for v in samples {
        min = f32::min(min, *v);
        max = f32::max(max, *v);
    }
    if min > max {
        return (0.0, 0.0);
    }
    (min, max)
}

/// Reflects the intensities about the middle of their range, so that dark
/// features become bright ones: `v' = max + min - v`. The value range is
/// unchanged.
pub fn invert(plane: &FloatImage) -> FloatImage {
    let (min, max) = min_max(plane);
    let mut inverted = plane.clone();
    for v in inverted.iter_mut() {
        *v = max + min - *v;
    }
    inverted
}
