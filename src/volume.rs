use crate::enums::Axis;

use ndarray::{Array3, ArrayView2};
use serde::{Deserialize, Serialize};

/// How the dimensions of a sample array map onto anatomical axes.
///
/// The two source families disagree: DICOM multi-frame pixel data is stored
/// (frame, row, column), i.e. (z, y, x), while NIfTI volumes are indexed
/// (x, y, z). Slices taken from either convention come out with the same
/// row/column meaning:
///
/// | axis | rows | columns |
/// |------|------|---------|
/// | x    | z    | y       |
/// | y    | z    | x       |
/// | z    | y    | x       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisConvention {
    /// (frame, row, column) → (z, y, x)
    FrameRowColumn,
    /// (dim0, dim1, dim2) → (x, y, z)
    ColumnMajorXyz,
}

impl AxisConvention {
    /// Array dimension holding `axis`.
    pub const fn array_dim(self, axis: Axis) -> usize {
        match (self, axis) {
            (AxisConvention::FrameRowColumn, Axis::X) => 2,
            (AxisConvention::FrameRowColumn, Axis::Y) => 1,
            (AxisConvention::FrameRowColumn, Axis::Z) => 0,
            (AxisConvention::ColumnMajorXyz, Axis::X) => 0,
            (AxisConvention::ColumnMajorXyz, Axis::Y) => 1,
            (AxisConvention::ColumnMajorXyz, Axis::Z) => 2,
        }
    }

    /// Whether the two remaining dimensions come out as (column, row) and
    /// must be swapped.
    pub const fn transposes_slices(self) -> bool {
        matches!(self, AxisConvention::ColumnMajorXyz)
    }
}

/// Number of slices along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceCounts {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl SliceCounts {
    pub fn along(&self, axis: Axis) -> usize {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn total(&self) -> usize {
        self.x + self.y + self.z
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceKey {
    pub axis: Axis,
    pub index: usize,
}

pub struct VolumeSlice<'a> {
    pub axis: Axis,
    pub index: usize,
    pub view: ArrayView2<'a, f32>,
}

#[derive(Debug, thiserror::Error)]
#[error("volume has a zero-length dimension: {shape:?}")]
pub struct EmptyVolume {
    pub shape: (usize, usize, usize),
}

#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    convention: AxisConvention,
}

impl Volume {
    pub fn new(data: Array3<f32>, convention: AxisConvention) -> Result<Self, EmptyVolume> {
        let shape = data.dim();
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(EmptyVolume { shape });
        }
        Ok(Self { data, convention })
    }

    /// Get the dimensions of the underlying array, in array order
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn convention(&self) -> AxisConvention {
        self.convention
    }

    pub fn slice_counts(&self) -> SliceCounts {
        let shape = self.data.shape();
        let extent = |axis| shape[self.convention.array_dim(axis)];
        SliceCounts {
            x: extent(Axis::X),
            y: extent(Axis::Y),
            z: extent(Axis::Z),
        }
    }

    /// Cross-section with `axis` fixed at `index`, or `None` when out of range.
    pub fn slice(&self, axis: Axis, index: usize) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(axis, index) {
            return None;
        }
        let dim = ndarray::Axis(self.convention.array_dim(axis));
        let view = self.data.index_axis(dim, index);
        if self.convention.transposes_slices() {
            Some(view.reversed_axes())
        } else {
            Some(view)
        }
    }

    /// Every (axis, index) pair, x first, indices ascending.
    pub fn slice_keys(&self) -> impl Iterator<Item = SliceKey> + use<> {
        let counts = self.slice_counts();
        Axis::ALL
            .into_iter()
            .flat_map(move |axis| (0..counts.along(axis)).map(move |index| SliceKey { axis, index }))
    }

    pub fn slices(&self) -> impl Iterator<Item = VolumeSlice<'_>> {
        self.slice_keys().filter_map(|key| {
            self.slice(key.axis, key.index).map(|view| VolumeSlice {
                axis: key.axis,
                index: key.index,
                view,
            })
        })
    }

    fn is_valid_index(&self, axis: Axis, index: usize) -> bool {
        index < self.slice_counts().along(axis)
    }
}
