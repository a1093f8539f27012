//! Read, annotate and delete operations on ingested roots.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{
    enums::{Axis, Dimensionality, SourceFormat},
    record::ImageRecord,
    repository::{RecordStore, StoreError},
    storage::PublicUrls,
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("image {0} does not exist")]
    NotFound(i64),

    #[error("image {0} is a generated child; only roots can be changed")]
    NotRoot(i64),

    #[error("image {id} belongs to another creator")]
    NotCreator { id: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlicePreview {
    pub id: i64,
    pub index: usize,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "dim")]
pub enum ImagePreview {
    #[serde(rename = "2D")]
    Plane {
        image: ImageRecord,
        source_url: String,
        preview_url: String,
    },
    #[serde(rename = "3D")]
    Volume {
        image: ImageRecord,
        source_url: String,
        axis: Axis,
        slices: Vec<SlicePreview>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RootSummary {
    pub image: ImageRecord,
    pub source_url: String,
    pub preview_url: String,
}

pub struct Catalog {
    store: Arc<dyn RecordStore>,
    urls: PublicUrls,
}

impl Catalog {
    pub fn new(store: Arc<dyn RecordStore>, urls: PublicUrls) -> Self {
        Self { store, urls }
    }

    /// Source and preview URLs of a record. Volumes list the slices along
    /// `axis` (axial by default) in index order.
    pub async fn preview(&self, id: i64, axis: Option<Axis>) -> Result<ImagePreview, CatalogError> {
        let image = self.store.get(id).await?.ok_or(CatalogError::NotFound(id))?;
        let source_url = self.urls.url_for(&image.storage_key);

        match image.dim {
            Dimensionality::ThreeD => {
                let axis = axis.unwrap_or(Axis::Z);
                let slices = self
                    .store
                    .children(image.id, Some(axis))
                    .await?
                    .into_iter()
                    .filter_map(|child| {
                        let position = child.slice?;
                        Some(SlicePreview {
                            id: child.id,
                            index: position.index,
                            url: self.urls.url_for(&child.storage_key),
                        })
                    })
                    .collect();
                Ok(ImagePreview::Volume {
                    image,
                    source_url,
                    axis,
                    slices,
                })
            }
            Dimensionality::TwoD => {
                let preview_url = self.plane_preview_url(&image).await?.unwrap_or_else(|| source_url.clone());
                Ok(ImagePreview::Plane {
                    image,
                    source_url,
                    preview_url,
                })
            }
        }
    }

    /// Roots created by `creator_id`, newest first.
    pub async fn list_roots(&self, creator_id: i64) -> Result<Vec<RootSummary>, CatalogError> {
        let roots = self.store.roots_by_creator(creator_id).await?;
        let mut summaries = Vec::with_capacity(roots.len());
        for image in roots {
            let source_url = self.urls.url_for(&image.storage_key);
            let preview_url = match image.dim {
                Dimensionality::ThreeD => self
                    .store
                    .children(image.id, None)
                    .await?
                    .first()
                    .map(|child| self.urls.url_for(&child.storage_key)),
                Dimensionality::TwoD => self.plane_preview_url(&image).await?,
            }
            .unwrap_or_else(|| source_url.clone());
            summaries.push(RootSummary {
                image,
                source_url,
                preview_url,
            });
        }
        Ok(summaries)
    }

    pub async fn update_note(&self, id: i64, creator_id: i64, note: Option<&str>) -> Result<ImageRecord, CatalogError> {
        self.owned_root(id, creator_id).await?;
        self.store.update_note(id, note).await?;
        self.store.get(id).await?.ok_or(CatalogError::NotFound(id))
    }

    /// Delete a root and its generated children. Stored objects are kept;
    /// only the records go.
    pub async fn delete_root(&self, id: i64, creator_id: i64) -> Result<u64, CatalogError> {
        self.owned_root(id, creator_id).await?;
        let removed = self.store.delete_root(id).await?;
        info!(id, removed, "image records deleted, blobs retained");
        Ok(removed)
    }

    async fn owned_root(&self, id: i64, creator_id: i64) -> Result<ImageRecord, CatalogError> {
        let image = self.store.get(id).await?.ok_or(CatalogError::NotFound(id))?;
        if !image.is_root() {
            return Err(CatalogError::NotRoot(id));
        }
        if image.creator_id != creator_id {
            return Err(CatalogError::NotCreator { id });
        }
        Ok(image)
    }

    /// Raster roots are their own preview.
    async fn plane_preview_url(&self, image: &ImageRecord) -> Result<Option<String>, CatalogError> {
        if image.format == SourceFormat::Raster {
            return Ok(None);
        }
        let children = self.store.children(image.id, None).await?;
        Ok(children.first().map(|child| self.urls.url_for(&child.storage_key)))
    }
}
