//! Classification of uploaded bytes into DICOM, NIfTI or opaque raster.
//!
//! Each format is tried in turn by a function returning an [`Attempt`], DICOM
//! first unless the filename suggests NIfTI; a payload nobody claims is a
//! raster. A payload that carries a
//! format's signature but fails to parse is reported as corrupt instead of
//! being passed on to the next attempt.

use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use dicom::object::DefaultDicomObject;
use flate2::read::GzDecoder;
use nifti::{InMemNiftiObject, ReaderOptions};
use thiserror::Error;
use tracing::{debug, trace};

use crate::enums::SourceFormat;

const DICOM_PREAMBLE_LEN: usize = 128;
const DICOM_MAGIC: &[u8; 4] = b"DICM";
const NIFTI1_HEADER_LEN: usize = 348;
const NIFTI1_SINGLE_FILE_MAGIC: &[u8; 4] = b"n+1\0";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
#[error("{format} payload could not be parsed: {reason}")]
pub struct DetectError {
    pub format: SourceFormat,
    pub reason: String,
}

/// Outcome of trying one format against a payload.
#[derive(Debug)]
pub enum Attempt<T> {
    Parsed(T),
    /// The payload does not carry this format's signature
    Absent(String),
    /// The signature is present but the content is malformed
    Corrupt(String),
}

impl<T> Attempt<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Parsed(value) => Attempt::Parsed(f(value)),
            Attempt::Absent(reason) => Attempt::Absent(reason),
            Attempt::Corrupt(reason) => Attempt::Corrupt(reason),
        }
    }
}

pub enum DetectedPayload {
    StructuredMetadata(Box<DefaultDicomObject>),
    Volumetric(Box<InMemNiftiObject>),
    Raster,
}

impl DetectedPayload {
    pub fn format(&self) -> SourceFormat {
        match self {
            DetectedPayload::StructuredMetadata(_) => SourceFormat::StructuredMetadata,
            DetectedPayload::Volumetric(_) => SourceFormat::Volumetric,
            DetectedPayload::Raster => SourceFormat::Raster,
        }
    }
}

impl std::fmt::Debug for DetectedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DetectedPayload({})", self.format())
    }
}

/// Classify `bytes`. Temporary files needed by the NIfTI reader are created
/// inside `scratch_dir`, which the caller owns and removes.
///
/// `filename_hint` only reorders the attempts: a `.nii`/`.nii.gz` name tries
/// NIfTI first. Signatures alone decide the format.
pub fn detect(bytes: &Arc<[u8]>, filename_hint: Option<&str>, scratch_dir: &Path) -> Result<DetectedPayload, DetectError> {
    let order = if hints_volumetric(filename_hint) {
        [SourceFormat::Volumetric, SourceFormat::StructuredMetadata]
    } else {
        [SourceFormat::StructuredMetadata, SourceFormat::Volumetric]
    };

    for format in order {
        let attempt = match format {
            SourceFormat::StructuredMetadata => {
                try_structured_metadata(bytes).map(|object| DetectedPayload::StructuredMetadata(Box::new(object)))
            }
            _ => try_volumetric(bytes, scratch_dir).map(|object| DetectedPayload::Volumetric(Box::new(object))),
        };
        match attempt {
            Attempt::Parsed(payload) => return Ok(payload),
            Attempt::Corrupt(reason) => return Err(corrupt(format, reason)),
            Attempt::Absent(reason) => trace!(%format, %reason, "format not claimed"),
        }
    }

    debug!(len = bytes.len(), hint = ?filename_hint, "no structured format claimed payload, treating as raster");
    Ok(DetectedPayload::Raster)
}

fn hints_volumetric(filename_hint: Option<&str>) -> bool {
    filename_hint.is_some_and(|name| {
        let name = name.to_ascii_lowercase();
        name.ends_with(".nii") || name.ends_with(".nii.gz")
    })
}

fn corrupt(format: SourceFormat, reason: String) -> DetectError {
    debug!(%format, %reason, "payload claims format but does not parse");
    DetectError { format, reason }
}

/// Offset of the `DICM` magic, with or without the 128-byte preamble.
fn dicom_magic_offset(bytes: &[u8]) -> Option<usize> {
    let at = |offset: usize| bytes.get(offset..offset + DICOM_MAGIC.len()) == Some(&DICOM_MAGIC[..]);
    if at(DICOM_PREAMBLE_LEN) {
        Some(DICOM_PREAMBLE_LEN)
    } else if at(0) {
        Some(0)
    } else {
        None
    }
}

pub fn try_structured_metadata(bytes: &Arc<[u8]>) -> Attempt<DefaultDicomObject> {
    let Some(offset) = dicom_magic_offset(bytes) else {
        return Attempt::Absent("no DICM magic code".to_owned());
    };
    let mut source = Cursor::new(Arc::clone(bytes));
    source.set_position(offset as u64);
    match dicom::object::from_reader(source) {
        Ok(object) => Attempt::Parsed(object),
        Err(e) => Attempt::Corrupt(e.to_string()),
    }
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// First 348 bytes of the (possibly gzip-compressed) payload.
fn nifti_header(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut header = vec![0u8; NIFTI1_HEADER_LEN];
    if is_gzip(bytes) {
        GzDecoder::new(bytes).read_exact(&mut header).ok()?;
    } else {
        header.copy_from_slice(bytes.get(..NIFTI1_HEADER_LEN)?);
    }
    Some(header)
}

fn has_nifti1_signature(header: &[u8]) -> bool {
    let sizeof_hdr = [header[0], header[1], header[2], header[3]];
    let sized = i32::from_le_bytes(sizeof_hdr) == NIFTI1_HEADER_LEN as i32
        || i32::from_be_bytes(sizeof_hdr) == NIFTI1_HEADER_LEN as i32;
    sized && &header[344..348] == NIFTI1_SINGLE_FILE_MAGIC
}

pub fn try_volumetric(bytes: &[u8], scratch_dir: &Path) -> Attempt<InMemNiftiObject> {
    let Some(header) = nifti_header(bytes) else {
        return Attempt::Absent("shorter than a NIfTI-1 header".to_owned());
    };
    if !has_nifti1_signature(&header) {
        return Attempt::Absent("no NIfTI-1 single-file signature".to_owned());
    }

    // The reader picks decompression from the file suffix.
    let suffix = if is_gzip(bytes) { ".nii.gz" } else { ".nii" };
    let scratch = tempfile::Builder::new()
        .prefix("volume-")
        .suffix(suffix)
        .tempfile_in(scratch_dir)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.flush()?;
            Ok(file)
        });
    let scratch = match scratch {
        Ok(file) => file,
        Err(e) => return Attempt::Corrupt(format!("could not stage payload: {e}")),
    };

    match ReaderOptions::new().read_file(scratch.path()) {
        Ok(object) => Attempt::Parsed(object),
        Err(e) => Attempt::Corrupt(e.to_string()),
    }
}
