//! Ingestion of one uploaded file into a committed record graph.
//!
//! ```text
//! Validating → Detecting → Extracting ─┬─ DirectStore         (raster)
//!                                      ├─ SingleSlicePreview  (2D DICOM / NIfTI)
//!                                      └─ Decomposing         (3D DICOM / NIfTI)
//!                                           → Committing → Done
//! ```
//!
//! Any step may end in `Failed`. Nothing is committed unless every upload
//! succeeded, and every key allocated for a failed request is discarded.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{StreamExt, future, stream};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    detector,
    enums::{Axis, Dimensionality, ImageType, SourceFormat},
    error::{IngestError, ValidationError},
    extractor::{self, Extracted, Samples},
    record::{Linkage, NewImageRecord, PlaneExtent, RecordGraph, SlicePosition},
    renderer::{self, LookupDescriptor},
    repository::{CommittedGraph, LinkedEntity, RecordStore},
    storage::{StorageError, StorageSink, StoredBlob},
    volume::{SliceKey, Volume},
};

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub bytes: Arc<[u8]>,
    /// Client-side name; a detection hint and the source of raster extensions.
    pub filename: Option<String>,
}

impl UploadedFile {
    pub fn new(bytes: impl Into<Arc<[u8]>>, filename: Option<String>) -> Self {
        Self {
            bytes: bytes.into(),
            filename,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub file: Option<UploadedFile>,
    pub name: String,
    pub image_type: ImageType,
    pub creator_id: i64,
    pub linkage: Linkage,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Upper bound on concurrent render + upload jobs per request
    pub upload_concurrency: usize,
    /// Parent of per-request scratch directories; the system default when unset
    pub scratch_dir: Option<PathBuf>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            scratch_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Validating,
    Detecting,
    Extracting,
    DirectStore,
    SingleSlicePreview,
    Decomposing,
    Committing,
}

/// Request after validation; downstream code does not re-check it.
struct Validated {
    file: UploadedFile,
    name: String,
    image_type: ImageType,
    creator_id: i64,
    linkage: Linkage,
    note: Option<String>,
}

impl Validated {
    fn root(&self, format: SourceFormat, dim: Dimensionality, key: String) -> NewImageRecord {
        NewImageRecord {
            name: self.name.clone(),
            format,
            image_type: self.image_type,
            dim,
            creator_id: self.creator_id,
            linkage: self.linkage,
            note: self.note.clone(),
            storage_key: key,
            size_bytes: self.file.bytes.len() as u64,
            slice: None,
            slice_counts: None,
            extent: None,
        }
    }

    fn child(&self, name: String, key: String, size_bytes: u64, slice: Option<SlicePosition>) -> NewImageRecord {
        NewImageRecord {
            name,
            format: SourceFormat::Raster,
            image_type: self.image_type,
            dim: Dimensionality::TwoD,
            creator_id: self.creator_id,
            linkage: Linkage::default(),
            note: None,
            storage_key: key,
            size_bytes,
            slice,
            slice_counts: None,
            extent: None,
        }
    }
}

/// What the CPU-bound half of a request decided to store.
enum Plan {
    DirectStore {
        extent: Option<PlaneExtent>,
    },
    SingleSlicePreview {
        format: SourceFormat,
        preview: Vec<u8>,
        extent: PlaneExtent,
    },
    Decomposing {
        format: SourceFormat,
        volume: Arc<Volume>,
        lookup: Option<Arc<LookupDescriptor>>,
    },
}

/// Drives one upload through detection, slicing, storage and commit.
///
/// The sink and store are process-wide and shared across requests.
#[derive(Clone)]
pub struct Ingestor {
    sink: StorageSink,
    store: Arc<dyn RecordStore>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(sink: StorageSink, store: Arc<dyn RecordStore>, settings: IngestSettings) -> Self {
        Self {
            sink,
            store,
            settings,
        }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<CommittedGraph, IngestError> {
        let span = info_span!("ingest", name = %request.name, creator = request.creator_id);
        async move {
            let outcome = self.run(request).await;
            match &outcome {
                Ok(graph) => info!(
                    root_id = graph.root.id,
                    children = graph.children.len(),
                    "ingestion done"
                ),
                Err(e) => warn!(kind = ?e.kind(), error = %e, "ingestion failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: IngestRequest) -> Result<CommittedGraph, IngestError> {
        enter(State::Validating);
        let request = self.validate(request).await?;

        enter(State::Detecting);
        let plan = self.prepare(&request).await?;

        let mut keys = Vec::new();
        let staged = self.upload(&request, plan, &mut keys).await;
        let graph = match staged {
            Ok(graph) => graph,
            Err(e) => {
                self.sink.discard(&keys).await;
                return Err(e);
            }
        };

        enter(State::Committing);
        match self.store.commit(&graph).await {
            Ok(committed) => Ok(committed),
            Err(e) => {
                self.sink.discard(&keys).await;
                Err(IngestError::Persistence(e))
            }
        }
    }

    /// Cheap checks first; no parsing and no uploads before this passes.
    async fn validate(&self, request: IngestRequest) -> Result<Validated, IngestError> {
        let file = match request.file {
            Some(file) if !file.bytes.is_empty() => file,
            _ => return Err(ValidationError::MissingFile.into()),
        };
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingField("name").into());
        }

        let links = [
            (LinkedEntity::Patient, request.linkage.patient_id),
            (LinkedEntity::Department, request.linkage.department_id),
            (LinkedEntity::Case, request.linkage.case_id),
        ];
        for (entity, id) in links {
            let Some(id) = id else { continue };
            let exists = self
                .store
                .linked_entity_exists(entity, id)
                .await
                .map_err(IngestError::Persistence)?;
            if !exists {
                return Err(ValidationError::DanglingReference {
                    entity: entity.name(),
                    id,
                }
                .into());
            }
        }

        Ok(Validated {
            file,
            name: name.to_owned(),
            image_type: request.image_type,
            creator_id: request.creator_id,
            linkage: request.linkage,
            note: request.note,
        })
    }

    /// Detection, extraction and preview rendering, off the async runtime.
    ///
    /// The scratch directory lives exactly as long as this call.
    async fn prepare(&self, request: &Validated) -> Result<Plan, IngestError> {
        let bytes = Arc::clone(&request.file.bytes);
        let filename = request.file.filename.clone();
        let scratch_parent = self.settings.scratch_dir.clone();
        let span = tracing::Span::current();

        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let mut builder = tempfile::Builder::new();
            builder.prefix("ingest-");
            let scratch = match &scratch_parent {
                Some(parent) => builder.tempdir_in(parent),
                None => builder.tempdir(),
            }
            .map_err(|e| IngestError::Internal(format!("scratch directory: {e}")))?;

            let payload = detector::detect(&bytes, filename.as_deref(), scratch.path())?;
            let format = payload.format();
            debug!(%format, "payload classified");
            enter(State::Extracting);

            if format == SourceFormat::Raster {
                // Raster bytes are stored verbatim; only the header is read.
                let extent = match extractor::raster_extent(&bytes) {
                    Ok(extent) => Some(extent),
                    Err(e) => {
                        debug!(error = %e, "raster header not readable, storing without extent");
                        None
                    }
                };
                return Ok(Plan::DirectStore { extent });
            }

            let Extracted { samples, lookup, .. } = extractor::extract(payload, &bytes)?;
            match samples {
                Samples::Plane(plane) => {
                    let (height, width) = plane.dim();
                    let preview = renderer::render_png(plane.view(), lookup.as_ref())?;
                    Ok(Plan::SingleSlicePreview {
                        format,
                        preview,
                        extent: PlaneExtent { width, height },
                    })
                }
                Samples::Volume(volume) => Ok(Plan::Decomposing {
                    format,
                    volume: Arc::new(volume),
                    lookup: lookup.map(Arc::new),
                }),
            }
        })
        .await?
    }

    /// Upload every artifact of `plan`, recording each allocated key in
    /// `keys` before its upload starts.
    async fn upload(&self, request: &Validated, plan: Plan, keys: &mut Vec<String>) -> Result<RecordGraph, IngestError> {
        match plan {
            Plan::DirectStore { extent } => {
                enter(State::DirectStore);
                let key = self.allocate(keys, &raster_extension(request.file.filename.as_deref()));
                self.put(&key, &request.file.bytes, 1).await?;
                let mut root = request.root(SourceFormat::Raster, Dimensionality::TwoD, key);
                root.extent = extent;
                Ok(RecordGraph {
                    root,
                    children: Vec::new(),
                })
            }
            Plan::SingleSlicePreview {
                format,
                preview,
                extent,
            } => {
                enter(State::SingleSlicePreview);
                let root_key = self.allocate(keys, original_extension(format, &request.file.bytes));
                let preview_key = self.allocate(keys, ".png");
                self.put(&root_key, &request.file.bytes, 2).await?;
                let stored = self.put(&preview_key, &preview, 2).await?;

                let mut root = request.root(format, Dimensionality::TwoD, root_key);
                root.extent = Some(extent);
                let child = request.child(format!("{}_preview", request.name), stored.key, stored.size_bytes, None);
                Ok(RecordGraph {
                    root,
                    children: vec![child],
                })
            }
            Plan::Decomposing {
                format,
                volume,
                lookup,
            } => {
                enter(State::Decomposing);
                let counts = volume.slice_counts();
                let attempted = counts.total() + 1;
                debug!(x = counts.x, y = counts.y, z = counts.z, "decomposing volume");

                let root_key = self.allocate(keys, original_extension(format, &request.file.bytes));
                let jobs: Vec<(SliceKey, String)> = volume
                    .slice_keys()
                    .map(|slice| (slice, self.allocate(keys, ".png")))
                    .collect();

                self.put(&root_key, &request.file.bytes, attempted).await?;

                // After the first error no new job starts, but running uploads
                // settle before returning so `discard` sees every written key.
                let failed = AtomicBool::new(false);
                let mut uploads = stream::iter(jobs)
                    .take_while(|_| future::ready(!failed.load(Ordering::Acquire)))
                    .map(|(slice, key)| self.render_and_upload(request, &volume, lookup.clone(), slice, key, attempted))
                    .buffer_unordered(self.settings.upload_concurrency.max(1));
                let mut children: Vec<NewImageRecord> = Vec::with_capacity(counts.total());
                let mut first_error = None;
                while let Some(outcome) = uploads.next().await {
                    match outcome {
                        Ok(child) => children.push(child),
                        Err(e) => {
                            failed.store(true, Ordering::Release);
                            first_error.get_or_insert(e);
                        }
                    }
                }
                drop(uploads);
                if let Some(e) = first_error {
                    return Err(e);
                }
                children.sort_by_key(|child| child.slice);

                let mut root = request.root(format, Dimensionality::ThreeD, root_key);
                root.slice_counts = Some(counts);
                Ok(RecordGraph { root, children })
            }
        }
    }

    async fn render_and_upload(
        &self,
        request: &Validated,
        volume: &Arc<Volume>,
        lookup: Option<Arc<LookupDescriptor>>,
        slice: SliceKey,
        key: String,
        attempted: usize,
    ) -> Result<NewImageRecord, IngestError> {
        let volume = Arc::clone(volume);
        let png = tokio::task::spawn_blocking(move || {
            let view = volume
                .slice(slice.axis, slice.index)
                .ok_or_else(|| IngestError::Internal(format!("slice {}:{} out of range", slice.axis, slice.index)))?;
            Ok::<_, IngestError>(renderer::render_png(view, lookup.as_deref())?)
        })
        .await??;

        let stored = self.put(&key, &png, attempted).await?;
        Ok(request.child(
            slice_name(&request.name, slice.axis, slice.index),
            stored.key,
            stored.size_bytes,
            Some(SlicePosition {
                axis: slice.axis,
                index: slice.index,
            }),
        ))
    }

    fn allocate(&self, keys: &mut Vec<String>, extension: &str) -> String {
        let key = self.sink.allocate_key(extension);
        keys.push(key.clone());
        key
    }

    async fn put(&self, key: &str, bytes: &[u8], attempted: usize) -> Result<StoredBlob, IngestError> {
        self.sink
            .put(key, bytes)
            .await
            .map_err(|source: StorageError| IngestError::Storage { attempted, source })
    }
}

fn enter(state: State) {
    debug!(?state, "ingest state");
}

fn slice_name(name: &str, axis: Axis, index: usize) -> String {
    format!("{name}_{}_{index}", axis.orientation())
}

/// Extension of an original structured payload, from its content.
fn original_extension(format: SourceFormat, bytes: &[u8]) -> &'static str {
    match format {
        SourceFormat::StructuredMetadata => ".dcm",
        SourceFormat::Volumetric if bytes.starts_with(&[0x1f, 0x8b]) => ".nii.gz",
        SourceFormat::Volumetric => ".nii",
        SourceFormat::Raster => "",
    }
}

/// Raster originals keep the extension the client gave them.
fn raster_extension(filename: Option<&str>) -> String {
    filename
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}
