// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Maxima segmentation locates local intensity maxima in a 2D image and
//! grows one region per maximum from them, yielding a point list, a count
//! and a labeled segmentation for each slice.
//!
//! Detection tolerates noise: two peaks whose connecting saddle lies no
//! more than `tolerance` below the lower one count as a single maximum.
//! Plateaus produce one representative point. Maxima can be restricted to a
//! region mask, kept off the image border, and found on dark-on-light
//! images or on Euclidean distance maps.
//!
//! See [pipeline::process()] for one slice and [batch::run_batch()] for many.

pub mod batch;
pub mod error;
pub mod export;
pub mod maxima;
pub mod pipeline;
pub mod plane;
pub mod rank_filter;
pub mod region_mask;
pub mod segment;
