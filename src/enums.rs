use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Anatomical slicing direction through a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn as_str(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    /// Plane name used when labelling generated slices.
    pub fn orientation(self) -> &'static str {
        match self {
            Axis::X => "sagittal",
            Axis::Y => "coronal",
            Axis::Z => "axial",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Axis {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            other => Err(UnknownVariant::new("axis", other)),
        }
    }
}

/// Container family an uploaded file was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceFormat {
    /// DICOM
    #[serde(rename = "dicom")]
    StructuredMetadata,
    /// NIfTI-1
    #[serde(rename = "nii")]
    Volumetric,
    /// Anything else, stored as-is
    #[serde(rename = "picture")]
    Raster,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::StructuredMetadata => "dicom",
            SourceFormat::Volumetric => "nii",
            SourceFormat::Raster => "picture",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dicom" => Ok(SourceFormat::StructuredMetadata),
            "nii" => Ok(SourceFormat::Volumetric),
            "picture" => Ok(SourceFormat::Raster),
            other => Err(UnknownVariant::new("format", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimensionality {
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "3D")]
    ThreeD,
}

impl Dimensionality {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimensionality::TwoD => "2D",
            Dimensionality::ThreeD => "3D",
        }
    }
}

impl FromStr for Dimensionality {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2D" => Ok(Dimensionality::TwoD),
            "3D" => Ok(Dimensionality::ThreeD),
            other => Err(UnknownVariant::new("dimensionality", other)),
        }
    }
}

/// Clinical modality tag supplied by the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    #[serde(rename = "X-ray")]
    XRay,
    #[serde(rename = "CT")]
    Ct,
    #[serde(rename = "MRI")]
    Mri,
    #[serde(rename = "PET")]
    Pet,
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "Other")]
    Other,
}

impl ImageType {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageType::XRay => "X-ray",
            ImageType::Ct => "CT",
            ImageType::Mri => "MRI",
            ImageType::Pet => "PET",
            ImageType::Us => "US",
            ImageType::Other => "Other",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "X-ray" => Ok(ImageType::XRay),
            "CT" => Ok(ImageType::Ct),
            "MRI" => Ok(ImageType::Mri),
            "PET" => Ok(ImageType::Pet),
            "US" => Ok(ImageType::Us),
            "Other" => Ok(ImageType::Other),
            other => Err(UnknownVariant::new("image type", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}
