use std::io::Cursor;

use crate::{
    detector::DetectedPayload,
    enums::{Dimensionality, SourceFormat},
    record::PlaneExtent,
    renderer::LookupDescriptor,
    volume::{AxisConvention, Volume},
};

use dicom::{
    object::DefaultDicomObject,
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use image::{DynamicImage, ImageReader};
use nifti::{NiftiObject, volume::ndarray::IntoNdArray};
use ndarray::{Array2, ArrayD, Axis, Ix2, Ix3, IxDyn};
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{format} pixel data could not be decoded: {reason}")]
    Decode { format: SourceFormat, reason: String },

    #[error("{format} sample array has unusable shape {shape:?}")]
    DegenerateShape { format: SourceFormat, shape: Vec<usize> },
}

#[derive(Debug)]
pub enum Samples {
    Plane(Array2<f32>),
    Volume(Volume),
}

#[derive(Debug)]
pub struct Extracted {
    pub format: SourceFormat,
    pub samples: Samples,
    pub lookup: Option<LookupDescriptor>,
}

impl Extracted {
    /// Shape of the sample array in its source order.
    pub fn shape(&self) -> Vec<usize> {
        match &self.samples {
            Samples::Plane(plane) => plane.shape().to_vec(),
            Samples::Volume(volume) => volume.data().shape().to_vec(),
        }
    }

    pub fn dimensionality(&self) -> Dimensionality {
        match self.samples {
            Samples::Plane(_) => Dimensionality::TwoD,
            Samples::Volume(_) => Dimensionality::ThreeD,
        }
    }
}

/// Pull a dense sample array out of a classified payload.
///
/// `bytes` is only read for raster payloads; the structured formats were
/// already parsed during detection.
pub fn extract(payload: DetectedPayload, bytes: &[u8]) -> Result<Extracted, ExtractError> {
    match payload {
        DetectedPayload::StructuredMetadata(object) => extract_structured_metadata(&object),
        DetectedPayload::Volumetric(object) => extract_volumetric(*object),
        DetectedPayload::Raster => extract_raster(bytes),
    }
}

fn number_of_frames(object: &DefaultDicomObject) -> u32 {
    object
        .element(tags::NUMBER_OF_FRAMES)
        .ok()
        .and_then(|element| element.to_int::<u32>().ok())
        .unwrap_or(1)
}

fn voi_lookup(object: &DefaultDicomObject) -> Option<LookupDescriptor> {
    let item = object.element(tags::VOILUT_SEQUENCE).ok()?.items()?.first()?;
    let descriptor = item
        .element(tags::LUT_DESCRIPTOR)
        .ok()?
        .to_multi_int::<i32>()
        .ok()?;
    let entries = item.element(tags::LUT_DATA).ok()?.to_multi_int::<u16>().ok()?;
    let (&first_mapped, &bits) = (descriptor.get(1)?, descriptor.get(2)?);
    if entries.is_empty() {
        return None;
    }
    Some(LookupDescriptor {
        first_mapped,
        bits: bits.clamp(1, 16) as u16,
        entries,
    })
}

fn extract_structured_metadata(object: &DefaultDicomObject) -> Result<Extracted, ExtractError> {
    let format = SourceFormat::StructuredMetadata;
    let decode_error = |reason: String| ExtractError::Decode { format, reason };

    let pixel_data = object
        .decode_pixel_data()
        .map_err(|e| decode_error(e.to_string()))?;
    let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
    // (frame, row, column, sample)
    let samples = pixel_data
        .to_ndarray_with_options::<f32>(&options)
        .map_err(|e| decode_error(e.to_string()))?;

    let shape = samples.shape().to_vec();
    if shape.iter().any(|&extent| extent == 0) {
        return Err(ExtractError::DegenerateShape { format, shape });
    }

    let frames = samples.index_axis_move(Axis(3), 0);
    let lookup = voi_lookup(object);
    let multi_frame = number_of_frames(object) > 1;
    debug!(?shape, multi_frame, has_lookup = lookup.is_some(), "decoded DICOM pixel data");

    let samples = if multi_frame {
        let volume = Volume::new(frames, AxisConvention::FrameRowColumn)
            .map_err(|_| ExtractError::DegenerateShape { format, shape })?;
        Samples::Volume(volume)
    } else {
        Samples::Plane(frames.index_axis_move(Axis(0), 0))
    };

    Ok(Extracted {
        format,
        samples,
        lookup,
    })
}

fn extract_volumetric(object: nifti::InMemNiftiObject) -> Result<Extracted, ExtractError> {
    let format = SourceFormat::Volumetric;
    let voxels = object
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| ExtractError::Decode {
            format,
            reason: e.to_string(),
        })?;

    // nifti links its own ndarray release; rebuild in ours, logical order.
    let shape = voxels.shape().to_vec();
    let flat: Vec<f32> = voxels.iter().copied().collect();
    let degenerate = || ExtractError::DegenerateShape {
        format,
        shape: shape.clone(),
    };
    if shape.len() < 2 || shape.iter().any(|&extent| extent == 0) {
        return Err(degenerate());
    }
    let mut voxels = ArrayD::from_shape_vec(IxDyn(&shape), flat).map_err(|_| degenerate())?;

    // Anything past (x, y, z) is time or components: keep the first volume.
    while voxels.ndim() > 3 {
        let last = voxels.ndim() - 1;
        voxels = voxels.index_axis_move(Axis(last), 0);
    }
    debug!(?shape, "decoded NIfTI voxels");

    let samples = if voxels.ndim() == 3 {
        let voxels = voxels.into_dimensionality::<Ix3>().map_err(|_| degenerate())?;
        let volume = Volume::new(voxels, AxisConvention::ColumnMajorXyz).map_err(|_| degenerate())?;
        Samples::Volume(volume)
    } else {
        // (x, y) → (y, x): a 2D plane shares the row/column layout of an axial slice
        let plane = voxels.into_dimensionality::<Ix2>().map_err(|_| degenerate())?;
        Samples::Plane(plane.reversed_axes().as_standard_layout().into_owned())
    };

    Ok(Extracted {
        format,
        samples,
        lookup: None,
    })
}

fn raster_reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, ExtractError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ExtractError::Decode {
            format: SourceFormat::Raster,
            reason: e.to_string(),
        })
}

/// Width and height of a raster payload, read from its header only.
pub fn raster_extent(bytes: &[u8]) -> Result<PlaneExtent, ExtractError> {
    let (width, height) = raster_reader(bytes)?
        .into_dimensions()
        .map_err(|e| ExtractError::Decode {
            format: SourceFormat::Raster,
            reason: e.to_string(),
        })?;
    Ok(PlaneExtent {
        width: width as usize,
        height: height as usize,
    })
}

/// Channel 0 of interleaved `raw` samples, divided by `full_scale`.
fn first_channel<T>(raw: &[T], channels: usize, full_scale: f32) -> Vec<f32>
where
    T: Copy + Into<f32> + Sync,
{
    raw.par_chunks_exact(channels).map(|pixel| Into::<f32>::into(pixel[0]) / full_scale).collect()
}

fn extract_raster(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let format = SourceFormat::Raster;
    let image = raster_reader(bytes)?.decode().map_err(|e| ExtractError::Decode {
        format,
        reason: e.to_string(),
    })?;
    let (width, height) = (image.width() as usize, image.height() as usize);
    if width == 0 || height == 0 {
        return Err(ExtractError::DegenerateShape {
            format,
            shape: vec![height, width],
        });
    }

    const U8: f32 = u8::MAX as f32;
    const U16: f32 = u16::MAX as f32;
    let samples = match &image {
        DynamicImage::ImageLuma8(buffer) => first_channel(buffer.as_raw(), 1, U8),
        DynamicImage::ImageLumaA8(buffer) => first_channel(buffer.as_raw(), 2, U8),
        DynamicImage::ImageRgb8(buffer) => first_channel(buffer.as_raw(), 3, U8),
        DynamicImage::ImageRgba8(buffer) => first_channel(buffer.as_raw(), 4, U8),
        DynamicImage::ImageLuma16(buffer) => first_channel(buffer.as_raw(), 1, U16),
        DynamicImage::ImageLumaA16(buffer) => first_channel(buffer.as_raw(), 2, U16),
        DynamicImage::ImageRgb16(buffer) => first_channel(buffer.as_raw(), 3, U16),
        DynamicImage::ImageRgba16(buffer) => first_channel(buffer.as_raw(), 4, U16),
        DynamicImage::ImageRgb32F(buffer) => first_channel(buffer.as_raw(), 3, 1.0),
        DynamicImage::ImageRgba32F(buffer) => first_channel(buffer.as_raw(), 4, 1.0),
        other => first_channel(other.to_rgba32f().as_raw(), 4, 1.0),
    };
    let plane = Array2::from_shape_vec((height, width), samples).map_err(|_| {
        ExtractError::DegenerateShape {
            format,
            shape: vec![height, width],
        }
    })?;

    Ok(Extracted {
        format,
        samples: Samples::Plane(plane),
        lookup: None,
    })
}
