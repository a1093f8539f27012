//! Conversion of arbitrary-range sample planes into 8-bit grayscale PNGs.

use std::io::Cursor;

use image::{GrayImage, ImageBuffer, ImageFormat, Luma};
use ndarray::ArrayView2;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("slice of {rows}x{columns} samples does not fit an image buffer")]
    Shape { rows: usize, columns: usize },

    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// VOI lookup table supplied by the source file.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupDescriptor {
    /// Sample value mapped to the first table entry
    pub first_mapped: i32,
    /// Bit depth of the table entries
    pub bits: u16,
    pub entries: Vec<u16>,
}

impl LookupDescriptor {
    #[inline]
    fn map(&self, value: f32) -> u8 {
        let Some(last) = self.entries.len().checked_sub(1) else {
            return 0;
        };
        let offset = if value.is_finite() {
            (value - self.first_mapped as f32).floor()
        } else {
            0.0
        };
        let index = offset.clamp(0.0, last as f32) as usize;
        let max_entry = ((1u32 << self.bits.clamp(1, 16)) - 1) as f32;
        (self.entries[index] as f32 * 255.0 / max_entry).clamp(0.0, 255.0) as u8
    }
}

#[derive(Debug, Clone, Copy)]
struct MinMax {
    min: f32,
    max: f32,
}

impl MinMax {
    fn of(slice: &ArrayView2<'_, f32>) -> Option<Self> {
        slice
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<MinMax>, v| match acc {
                None => Some(MinMax { min: v, max: v }),
                Some(m) => Some(MinMax {
                    min: m.min.min(v),
                    max: m.max.max(v),
                }),
            })
    }

    #[inline]
    fn normalize(&self, value: f32) -> u8 {
        // Constant planes would divide by zero
        if self.max == self.min || !value.is_finite() {
            return 0;
        }
        ((value - self.min) / (self.max - self.min) * 255.0).clamp(0.0, 255.0) as u8
    }
}

/// Map a plane onto 0..=255, through `lookup` when present, min-max otherwise.
pub fn render_luma(slice: ArrayView2<'_, f32>, lookup: Option<&LookupDescriptor>) -> Result<GrayImage, RenderError> {
    let (rows, columns) = slice.dim();
    let range = MinMax::of(&slice);

    let pixel_data: Vec<u8> = (0..rows)
        .into_par_iter()
        .flat_map_iter(|row| {
            let row = slice.row(row);
            (0..columns).map(move |column| {
                let value = row[column];
                match (lookup, range) {
                    (Some(lookup), _) => lookup.map(value),
                    (None, Some(range)) => range.normalize(value),
                    (None, None) => 0,
                }
            })
        })
        .collect();

    ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(columns as u32, rows as u32, pixel_data)
        .ok_or(RenderError::Shape { rows, columns })
}

pub fn encode_png(image: &GrayImage) -> Result<Vec<u8>, RenderError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

pub fn render_png(slice: ArrayView2<'_, f32>, lookup: Option<&LookupDescriptor>) -> Result<Vec<u8>, RenderError> {
    encode_png(&render_luma(slice, lookup)?)
}
