//! # Medical image ingestion library
//!
//! This crate takes a single uploaded medical image, figures out what it is and
//! turns it into a set of stored, browsable artifacts:
//!
//!  - DICOM (single or multi-frame) and NIfTI-1 (`.nii`, `.nii.gz`) payloads
//!    are decoded into dense sample arrays with the dicom-rs and nifti-rs
//!    ecosystems
//!  - Anything else is stored as an opaque raster picture
//!
//! A 2D payload gets one grayscale PNG preview. A 3D payload is decomposed
//! into every slice along the three medical axes:
//!  - Sagittal (x)
//!  - Coronal (y)
//!  - Axial (z)
//!
//! Each slice is min-max normalized (or mapped through the file's VOI lookup
//! table), encoded as PNG and uploaded concurrently. The original and all
//! generated slices are then recorded as a parent/child graph in one
//! transaction. A request either commits its whole graph or leaves neither
//! records nor objects behind.
//!
//! # Examples
//!
//! ## Ingesting a file
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use medimg_ingest::{
//! #     enums::ImageType, ingest::{IngestRequest, IngestSettings, Ingestor, UploadedFile},
//! #     record::Linkage, repository::SqliteRecordStore,
//! #     storage::{FilesystemBlobStore, KeyGenerator, StorageSink},
//! # };
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteRecordStore::open("data/images.db".as_ref()).await?);
//! let sink = StorageSink::new(Arc::new(FilesystemBlobStore::new("data/blobs")), KeyGenerator::default());
//! let ingestor = Ingestor::new(sink, store, IngestSettings::default());
//!
//! let graph = ingestor
//!     .ingest(IngestRequest {
//!         file: Some(UploadedFile::new(std::fs::read("head.nii.gz")?, Some("head.nii.gz".into()))),
//!         name: "head".into(),
//!         image_type: ImageType::Mri,
//!         creator_id: 7,
//!         linkage: Linkage::default(),
//!         note: None,
//!     })
//!     .await?;
//! println!("root {} with {} slices", graph.root.id, graph.children.len());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod detector;
pub mod enums;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod record;
pub mod renderer;
pub mod repository;
pub mod storage;
pub mod volume;

pub use error::{ErrorKind, IngestError};
pub use ingest::{IngestRequest, Ingestor};
