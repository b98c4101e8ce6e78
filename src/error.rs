// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use thiserror::Error;

/// Why a slice produced no output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SliceError {
    /// Missing or unusable input, including a degenerate region mask. Fails
    /// the whole run.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Unexpected failure while processing one slice. The run continues.
    #[error("computation failed: {0}")]
    Computation(String),
    #[error("cancelled")]
    Cancelled,
}

/// Failure writing a slice's outputs. The slice's points and count survive.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),
}
