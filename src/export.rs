// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;

use log::debug;

use crate::error::PersistenceError;
use crate::maxima::Point;
use crate::segment::LabelImage;

/// One row of a point listing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PointRecord {
    pub id: u32,
    pub x: u32,
    pub y: u32,
}

impl From<&Point> for PointRecord {
    fn from(p: &Point) -> Self {
        PointRecord{id: p.id, x: p.x, y: p.y}
    }
}

/// Writes `records` as CSV with header `ID,X,Y`.
pub fn write_points_csv(path: &Path, records: &[PointRecord])
                        -> Result<(), PersistenceError> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["ID", "X", "Y"])?;
    for r in records {
        wtr.write_record(&[r.id.to_string(), r.x.to_string(), r.y.to_string()])?;
    }
    wtr.flush()?;
    debug!("Wrote {} points to {:?}", records.len(), path);
    Ok(())
}

/// Writes one `Slice,Count` row per slice, in the given order.
pub fn write_counts_csv<'a, I>(path: &Path, counts: I) -> Result<(), PersistenceError>
where I: IntoIterator<Item = (&'a str, usize)>
{
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["Slice", "Count"])?;
    for (slice, count) in counts {
        wtr.write_record(&[slice.to_string(), count.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Saves the byte rendering of `label` (see [LabelImage::to_gray_image()]).
/// The format follows the file extension.
pub fn save_label_image(path: &Path, label: &LabelImage) -> Result<(), PersistenceError> {
    label.to_gray_image().save(path)?;
    debug!("Wrote segmentation to {:?}", path);
    Ok(())
}
