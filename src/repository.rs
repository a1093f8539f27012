//! Metadata store for image records.
//!
//! A request's record graph is written in a single transaction, so readers
//! see either the whole graph or nothing. Deleting a root removes its children
//! through the `parent_id` foreign key; blob objects are left alone.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    enums::{Axis, UnknownVariant},
    record::{
        GraphViolation, ImageRecord, Linkage, NewImageRecord, PlaneExtent, RecordGraph,
        SlicePosition,
    },
    volume::SliceCounts,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    InvalidGraph(#[from] GraphViolation),

    #[error("Stored row {id} is malformed: {reason}")]
    MalformedRow { id: i64, reason: String },
}

/// Entities a root may link to; owned by the surrounding CRUD layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkedEntity {
    Patient,
    Department,
    Case,
}

impl LinkedEntity {
    pub fn name(self) -> &'static str {
        match self {
            LinkedEntity::Patient => "patient",
            LinkedEntity::Department => "department",
            LinkedEntity::Case => "case",
        }
    }

    fn table(self) -> &'static str {
        match self {
            LinkedEntity::Patient => "patient",
            LinkedEntity::Department => "department",
            LinkedEntity::Case => "medical_case",
        }
    }
}

/// Committed root with its children, children in (axis, index) order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CommittedGraph {
    pub root: ImageRecord,
    pub children: Vec<ImageRecord>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn linked_entity_exists(&self, entity: LinkedEntity, id: i64) -> Result<bool, StoreError>;

    /// Persist root and children atomically.
    async fn commit(&self, graph: &RecordGraph) -> Result<CommittedGraph, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<ImageRecord>, StoreError>;

    /// Children of `parent_id`; ordered by slice index when `axis` is given,
    /// by id otherwise.
    async fn children(&self, parent_id: i64, axis: Option<Axis>) -> Result<Vec<ImageRecord>, StoreError>;

    /// Roots created by `creator_id`, newest first.
    async fn roots_by_creator(&self, creator_id: i64) -> Result<Vec<ImageRecord>, StoreError>;

    async fn update_note(&self, id: i64, note: Option<&str>) -> Result<(), StoreError>;

    /// Delete a record and, through the cascade, its children. Returns the
    /// number of records removed.
    async fn delete_root(&self, id: i64) -> Result<u64, StoreError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS patient (id INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS department (id INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS medical_case (id INTEGER PRIMARY KEY)",
    r#"
    CREATE TABLE IF NOT EXISTS image (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        format TEXT NOT NULL CHECK (format IN ('dicom', 'nii', 'picture')),
        image_type TEXT NOT NULL,
        dim TEXT NOT NULL CHECK (dim IN ('2D', '3D')),
        creator_id INTEGER NOT NULL,
        patient_id INTEGER REFERENCES patient(id) ON DELETE SET NULL,
        department_id INTEGER REFERENCES department(id) ON DELETE SET NULL,
        case_id INTEGER REFERENCES medical_case(id) ON DELETE SET NULL,
        note TEXT,
        storage_key TEXT NOT NULL UNIQUE,
        size_bytes INTEGER NOT NULL,
        parent_id INTEGER REFERENCES image(id) ON DELETE CASCADE,
        slice_axis TEXT CHECK (slice_axis IN ('x', 'y', 'z')),
        slice_index INTEGER,
        slice_x INTEGER,
        slice_y INTEGER,
        slice_z INTEGER,
        width INTEGER,
        height INTEGER,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS image_parent ON image (parent_id)",
    "CREATE INDEX IF NOT EXISTS image_creator ON image (creator_id, created_at)",
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS image_slice_position
        ON image (parent_id, slice_axis, slice_index)
        WHERE slice_axis IS NOT NULL
    "#,
];

const SELECT_IMAGE: &str = "SELECT id, name, format, image_type, dim, creator_id, patient_id, \
     department_id, case_id, note, storage_key, size_bytes, parent_id, slice_axis, slice_index, \
     slice_x, slice_y, slice_z, width, height, created_at FROM image";

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Open (creating if needed) the database file and its schema.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        info!("Opened image database: {}", db_path.display());
        Self::from_pool(pool).await
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        record: &NewImageRecord,
        parent_id: Option<i64>,
        created_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let counts = record.slice_counts;
        let result = sqlx::query(
            "INSERT INTO image (name, format, image_type, dim, creator_id, patient_id, \
             department_id, case_id, note, storage_key, size_bytes, parent_id, slice_axis, \
             slice_index, slice_x, slice_y, slice_z, width, height, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.name)
        .bind(record.format.as_str())
        .bind(record.image_type.as_str())
        .bind(record.dim.as_str())
        .bind(record.creator_id)
        .bind(record.linkage.patient_id)
        .bind(record.linkage.department_id)
        .bind(record.linkage.case_id)
        .bind(&record.note)
        .bind(&record.storage_key)
        .bind(record.size_bytes as i64)
        .bind(parent_id)
        .bind(record.slice.map(|s| s.axis.as_str()))
        .bind(record.slice.map(|s| s.index as i64))
        .bind(counts.map(|c| c.x as i64))
        .bind(counts.map(|c| c.y as i64))
        .bind(counts.map(|c| c.z as i64))
        .bind(record.extent.map(|e| e.width as i64))
        .bind(record.extent.map(|e| e.height as i64))
        .bind(created_at)
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn fetch_children(&self, parent_id: i64) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ImageRow>(&format!(
            "{SELECT_IMAGE} WHERE parent_id = ? ORDER BY slice_axis, slice_index, id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ImageRecord::try_from).collect()
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn linked_entity_exists(&self, entity: LinkedEntity, id: i64) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(&format!("SELECT id FROM {} WHERE id = ?", entity.table()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn commit(&self, graph: &RecordGraph) -> Result<CommittedGraph, StoreError> {
        graph.check_invariants()?;
        let created_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let root_id = Self::insert(&mut tx, &graph.root, None, created_at).await?;
        for child in &graph.children {
            Self::insert(&mut tx, child, Some(root_id), created_at).await?;
        }
        tx.commit().await?;
        debug!(root_id, children = graph.children.len(), "record graph committed");

        let root = self.get(root_id).await?.ok_or_else(|| StoreError::MalformedRow {
            id: root_id,
            reason: "committed root vanished".to_owned(),
        })?;
        let children = self.fetch_children(root_id).await?;
        Ok(CommittedGraph { root, children })
    }

    async fn get(&self, id: i64) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query_as::<_, ImageRow>(&format!("{SELECT_IMAGE} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ImageRecord::try_from).transpose()
    }

    async fn children(&self, parent_id: i64, axis: Option<Axis>) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = match axis {
            Some(axis) => {
                sqlx::query_as::<_, ImageRow>(&format!(
                    "{SELECT_IMAGE} WHERE parent_id = ? AND slice_axis = ? ORDER BY slice_index"
                ))
                .bind(parent_id)
                .bind(axis.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ImageRow>(&format!("{SELECT_IMAGE} WHERE parent_id = ? ORDER BY id"))
                    .bind(parent_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    async fn roots_by_creator(&self, creator_id: i64) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ImageRow>(&format!(
            "{SELECT_IMAGE} WHERE creator_id = ? AND parent_id IS NULL ORDER BY created_at DESC, id DESC"
        ))
        .bind(creator_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    async fn update_note(&self, id: i64, note: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE image SET note = ? WHERE id = ? AND parent_id IS NULL")
            .bind(note)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_root(&self, id: i64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image WHERE parent_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM image WHERE id = ? AND parent_id IS NULL")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if deleted == 0 {
            return Ok(0);
        }
        Ok(deleted + children as u64)
    }
}

#[derive(FromRow)]
struct ImageRow {
    id: i64,
    name: String,
    format: String,
    image_type: String,
    dim: String,
    creator_id: i64,
    patient_id: Option<i64>,
    department_id: Option<i64>,
    case_id: Option<i64>,
    note: Option<String>,
    storage_key: String,
    size_bytes: i64,
    parent_id: Option<i64>,
    slice_axis: Option<String>,
    slice_index: Option<i64>,
    slice_x: Option<i64>,
    slice_y: Option<i64>,
    slice_z: Option<i64>,
    width: Option<i64>,
    height: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = StoreError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let malformed = |e: UnknownVariant| StoreError::MalformedRow {
            id,
            reason: e.to_string(),
        };

        let slice = match (row.slice_axis, row.slice_index) {
            (Some(axis), Some(index)) => Some(SlicePosition {
                axis: axis.parse().map_err(malformed)?,
                index: index as usize,
            }),
            _ => None,
        };
        let slice_counts = match (row.slice_x, row.slice_y, row.slice_z) {
            (Some(x), Some(y), Some(z)) => Some(SliceCounts {
                x: x as usize,
                y: y as usize,
                z: z as usize,
            }),
            _ => None,
        };
        let extent = match (row.width, row.height) {
            (Some(width), Some(height)) => Some(PlaneExtent {
                width: width as usize,
                height: height as usize,
            }),
            _ => None,
        };

        Ok(ImageRecord {
            id,
            name: row.name,
            format: row.format.parse().map_err(malformed)?,
            image_type: row.image_type.parse().map_err(malformed)?,
            dim: row.dim.parse().map_err(malformed)?,
            creator_id: row.creator_id,
            linkage: Linkage {
                patient_id: row.patient_id,
                department_id: row.department_id,
                case_id: row.case_id,
            },
            note: row.note,
            storage_key: row.storage_key,
            size_bytes: row.size_bytes as u64,
            parent_id: row.parent_id,
            slice,
            slice_counts,
            extent,
            created_at: row.created_at,
        })
    }
}
