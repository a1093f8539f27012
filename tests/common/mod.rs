//! Shared fixtures for the integration tests
//!
//! - In-memory DICOM, NIfTI-1 and PNG payloads
//! - A wired [`Harness`] over an in-memory record store and blob store
//! - Stores that fail on demand
#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dicom::core::{DataElement, PrimitiveValue, VR, value::DataSetSequence};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, mem::InMemElement};
use dicom_dictionary_std::{tags, uids};
use flate2::{Compression, write::GzEncoder};
use image::{GrayImage, ImageFormat, Luma};

use medimg_ingest::{
    enums::{Axis, ImageType},
    ingest::{IngestRequest, IngestSettings, Ingestor, UploadedFile},
    record::{ImageRecord, Linkage, RecordGraph},
    repository::{CommittedGraph, LinkedEntity, RecordStore, SqliteRecordStore, StoreError},
    storage::{BlobStore, KeyGenerator, MemoryBlobStore, StorageError, StorageSink},
};

/// 16-bit MONOCHROME2 DICOM file; `samples` are frame-major, then row-major.
/// `NumberOfFrames` is only written for more than one frame.
pub fn dicom_bytes(frames: usize, rows: usize, columns: usize, samples: &[u16], extra: Vec<InMemElement>) -> Vec<u8> {
    assert_eq!(samples.len(), frames * rows * columns);
    let mut elements: Vec<InMemElement> = vec![
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.826.0.1.3680043.2.1125.7")),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2")),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows as u16)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns as u16)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
    ];
    if frames > 1 {
        elements.push(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from(frames.to_string()),
        ));
    }
    elements.extend(extra);
    elements.push(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::U16(samples.iter().copied().collect()),
    ));

    let file = InMemDicomObject::from_element_iter(elements)
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.7"),
        )
        .expect("valid file meta");
    let mut out = Vec::new();
    file.write_all(&mut out).expect("DICOM serialization");
    out
}

/// VOI LUT Sequence with a single table starting at `first_mapped`.
pub fn voi_lut_sequence(first_mapped: u16, bits: u16, entries: &[u16]) -> InMemElement {
    let item = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::LUT_DESCRIPTOR,
            VR::US,
            PrimitiveValue::U16([entries.len() as u16, first_mapped, bits].into_iter().collect()),
        ),
        DataElement::new(tags::LUT_DATA, VR::US, PrimitiveValue::U16(entries.iter().copied().collect())),
    ]);
    DataElement::new(tags::VOILUT_SEQUENCE, VR::SQ, DataSetSequence::from(vec![item]))
}

/// Single-file NIfTI-1 with float32 samples given in (x fastest) order.
pub fn nifti_bytes(shape: &[usize], samples: &[f32]) -> Vec<u8> {
    assert!((1..=7).contains(&shape.len()));
    assert_eq!(samples.len(), shape.iter().product::<usize>());

    let mut out = vec![0u8; 352];
    out[0..4].copy_from_slice(&348_i32.to_le_bytes());
    let mut dim = [1_i16; 8];
    dim[0] = shape.len() as i16;
    for (i, &extent) in shape.iter().enumerate() {
        dim[i + 1] = extent as i16;
    }
    for (i, d) in dim.iter().enumerate() {
        out[40 + 2 * i..42 + 2 * i].copy_from_slice(&d.to_le_bytes());
    }
    out[70..72].copy_from_slice(&16_i16.to_le_bytes());
    out[72..74].copy_from_slice(&32_i16.to_le_bytes());
    for i in 0..8 {
        out[76 + 4 * i..80 + 4 * i].copy_from_slice(&1.0_f32.to_le_bytes());
    }
    out[108..112].copy_from_slice(&352.0_f32.to_le_bytes());
    out[112..116].copy_from_slice(&1.0_f32.to_le_bytes());
    out[344..348].copy_from_slice(b"n+1\0");
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

pub fn nifti_volume(nx: usize, ny: usize, nz: usize, voxel: impl Fn(usize, usize, usize) -> f32) -> Vec<u8> {
    let mut samples = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                samples.push(voxel(x, y, z));
            }
        }
    }
    nifti_bytes(&[nx, ny, nz], &samples)
}

pub fn nifti_plane(nx: usize, ny: usize, pixel: impl Fn(usize, usize) -> f32) -> Vec<u8> {
    let mut samples = Vec::with_capacity(nx * ny);
    for y in 0..ny {
        for x in 0..nx {
            samples.push(pixel(x, y));
        }
    }
    nifti_bytes(&[nx, ny], &samples)
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = GrayImage::from_fn(width, height, |x, y| Luma([(x * 10 + y) as u8]));
    let mut out = std::io::Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn decode_png(bytes: &[u8]) -> GrayImage {
    image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .expect("stored preview is a PNG")
        .to_luma8()
}

pub fn request(bytes: Vec<u8>, filename: &str, name: &str) -> IngestRequest {
    IngestRequest {
        file: Some(UploadedFile::new(bytes, Some(filename.to_owned()))),
        name: name.to_owned(),
        image_type: ImageType::Ct,
        creator_id: 7,
        linkage: Linkage::default(),
        note: None,
    }
}

pub fn children_along(graph: &CommittedGraph, axis: Axis) -> Vec<&ImageRecord> {
    graph
        .children
        .iter()
        .filter(|child| child.slice.is_some_and(|s| s.axis == axis))
        .collect()
}

pub struct Harness {
    pub blobs: Arc<MemoryBlobStore>,
    pub store: Arc<SqliteRecordStore>,
    pub ingestor: Ingestor,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(IngestSettings::default()).await
    }

    pub async fn with_settings(settings: IngestSettings) -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(SqliteRecordStore::in_memory().await.unwrap());
        let sink = StorageSink::new(blobs.clone(), KeyGenerator::default());
        let ingestor = Ingestor::new(sink, store.clone(), settings);
        Self {
            blobs,
            store,
            ingestor,
        }
    }

    pub async fn image_count(&self) -> i64 {
        image_count(&self.store).await
    }

    pub fn blob(&self, key: &str) -> Vec<u8> {
        self.blobs.get(key).expect("blob stored").to_vec()
    }
}

pub async fn image_count(store: &SqliteRecordStore) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM image")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

pub async fn insert_linked(store: &SqliteRecordStore, table: &str, id: i64) {
    sqlx::query(&format!("INSERT INTO {table} (id) VALUES (?)"))
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();
}

/// Memory store whose `fail_on`-th put (1-based) is rejected.
pub struct FailingBlobStore {
    pub inner: MemoryBlobStore,
    fail_on: usize,
    delay: Option<Duration>,
    puts: AtomicUsize,
    in_flight: AtomicUsize,
}

impl FailingBlobStore {
    pub fn new(fail_on: usize) -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            fail_on,
            delay: None,
            puts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Every put sleeps for `delay` before it resolves.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Puts that started but never resolved; a dropped put stays counted.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = if n == self.fail_on {
            Err(StorageError::Rejected {
                key: key.to_owned(),
                reason: "injected failure".to_owned(),
            })
        } else {
            self.inner.put(key, bytes).await
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

/// Record store that refuses every commit and otherwise delegates.
pub struct RefusingCommitStore {
    pub inner: SqliteRecordStore,
}

#[async_trait]
impl RecordStore for RefusingCommitStore {
    async fn linked_entity_exists(&self, entity: LinkedEntity, id: i64) -> Result<bool, StoreError> {
        self.inner.linked_entity_exists(entity, id).await
    }

    async fn commit(&self, _graph: &RecordGraph) -> Result<CommittedGraph, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn get(&self, id: i64) -> Result<Option<ImageRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn children(&self, parent_id: i64, axis: Option<Axis>) -> Result<Vec<ImageRecord>, StoreError> {
        self.inner.children(parent_id, axis).await
    }

    async fn roots_by_creator(&self, creator_id: i64) -> Result<Vec<ImageRecord>, StoreError> {
        self.inner.roots_by_creator(creator_id).await
    }

    async fn update_note(&self, id: i64, note: Option<&str>) -> Result<(), StoreError> {
        self.inner.update_note(id, note).await
    }

    async fn delete_root(&self, id: i64) -> Result<u64, StoreError> {
        self.inner.delete_root(id).await
    }
}
