//! Image records and the per-request record graph.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    enums::{Axis, Dimensionality, ImageType, SourceFormat},
    volume::SliceCounts,
};

/// Optional associations of a root with entities owned by the CRUD layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Linkage {
    pub patient_id: Option<i64>,
    pub department_id: Option<i64>,
    pub case_id: Option<i64>,
}

impl Linkage {
    pub fn is_empty(&self) -> bool {
        self.patient_id.is_none() && self.department_id.is_none() && self.case_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlicePosition {
    pub axis: Axis,
    pub index: usize,
}

/// In-plane size of a 2D root, when it could be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaneExtent {
    pub width: usize,
    pub height: usize,
}

/// A record before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewImageRecord {
    pub name: String,
    pub format: SourceFormat,
    pub image_type: ImageType,
    pub dim: Dimensionality,
    pub creator_id: i64,
    pub linkage: Linkage,
    pub note: Option<String>,
    pub storage_key: String,
    pub size_bytes: u64,
    pub slice: Option<SlicePosition>,
    pub slice_counts: Option<SliceCounts>,
    pub extent: Option<PlaneExtent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
    pub id: i64,
    pub name: String,
    pub format: SourceFormat,
    pub image_type: ImageType,
    pub dim: Dimensionality,
    pub creator_id: i64,
    pub linkage: Linkage,
    pub note: Option<String>,
    pub storage_key: String,
    pub size_bytes: u64,
    pub parent_id: Option<i64>,
    pub slice: Option<SlicePosition>,
    pub slice_counts: Option<SliceCounts>,
    pub extent: Option<PlaneExtent>,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }
}

/// Root plus generated children of one ingestion request.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGraph {
    pub root: NewImageRecord,
    pub children: Vec<NewImageRecord>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("inconsistent record graph: {0}")]
pub struct GraphViolation(pub String);

impl RecordGraph {
    pub fn storage_keys(&self) -> Vec<String> {
        std::iter::once(&self.root)
            .chain(&self.children)
            .map(|record| record.storage_key.clone())
            .collect()
    }

    pub fn check_invariants(&self) -> Result<(), GraphViolation> {
        let violation = |msg: String| Err(GraphViolation(msg));
        let root = &self.root;

        if root.slice.is_some() {
            return violation("root carries a slice position".into());
        }
        for child in &self.children {
            if !child.linkage.is_empty() || child.note.is_some() || child.slice_counts.is_some() {
                return violation(format!("child {} carries root-only fields", child.name));
            }
            if child.dim != Dimensionality::TwoD {
                return violation(format!("child {} is not 2D", child.name));
            }
        }

        let mut keys = HashSet::new();
        for key in std::iter::once(&root.storage_key).chain(self.children.iter().map(|c| &c.storage_key)) {
            if !keys.insert(key) {
                return violation(format!("storage key {key} used twice"));
            }
        }

        match (root.dim, root.format) {
            (Dimensionality::ThreeD, _) => {
                let Some(counts) = root.slice_counts else {
                    return violation("3D root without slice counts".into());
                };
                let mut seen = HashSet::new();
                for child in &self.children {
                    let Some(position) = child.slice else {
                        return violation(format!("child {} of a volume has no slice position", child.name));
                    };
                    if position.index >= counts.along(position.axis) || !seen.insert(position) {
                        return violation(format!("slice {}:{} out of range or repeated", position.axis, position.index));
                    }
                }
                if seen.len() != counts.total() {
                    return violation(format!("{} slices for counts {:?}", seen.len(), counts));
                }
            }
            (Dimensionality::TwoD, SourceFormat::Raster) => {
                if !self.children.is_empty() {
                    return violation("raster root with children".into());
                }
            }
            (Dimensionality::TwoD, _) => {
                if root.slice_counts.is_some() {
                    return violation("2D root with slice counts".into());
                }
                if self.children.len() != 1 || self.children[0].slice.is_some() {
                    return violation("2D root needs exactly one preview child".into());
                }
            }
        }
        Ok(())
    }
}
