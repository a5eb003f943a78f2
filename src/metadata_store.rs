use crate::config::DatabaseConfig;
use crate::dataset::{DatasetIdentifier, DatasetRecord, DatasetStatus, FrameRecord, UploadType};
use crate::error::ImagingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, instrument};

/// Transactional metadata boundary for dataset and frame records.
///
/// `create_pending` must be backed by a uniqueness constraint on the dataset
/// identifier so that two processes racing to create the same dataset cannot
/// both win; `commit_dataset` is the atomicity boundary for metadata
/// visibility.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new dataset record in PENDING state. Fails with
    /// `DuplicateDataset` when a record for the identifier already exists.
    async fn create_pending(&self, record: &DatasetRecord) -> Result<(), ImagingError>;

    /// Reclaim a FAILED record for a fresh upload attempt by resetting it to
    /// PENDING. Fails with `DuplicateDataset` when the record is not FAILED.
    async fn reset_failed(&self, id: &DatasetIdentifier) -> Result<(), ImagingError>;

    /// In a single transaction, insert all frame records and transition the
    /// dataset from PENDING to COMPLETE. Partial metadata is never visible.
    async fn commit_dataset(
        &self,
        id: &DatasetIdentifier,
        global_metadata: &Value,
        frames: &[FrameRecord],
    ) -> Result<(), ImagingError>;

    /// Mark a dataset FAILED, preserving the record as an audit trail.
    async fn mark_failed(&self, id: &DatasetIdentifier) -> Result<(), ImagingError>;

    async fn find_dataset(
        &self,
        id: &DatasetIdentifier,
    ) -> Result<Option<DatasetRecord>, ImagingError>;

    /// Frame records for a dataset in ascending frame index order.
    async fn list_frames(&self, id: &DatasetIdentifier) -> Result<Vec<FrameRecord>, ImagingError>;

    async fn dataset_exists(&self, id: &DatasetIdentifier) -> Result<bool, ImagingError>;
}

#[derive(Debug, FromRow)]
struct DatasetRow {
    dataset_serial: String,
    upload_type: String,
    storage_prefix: String,
    status: String,
    description: Option<String>,
    global_metadata: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<DatasetRow> for DatasetRecord {
    type Error = ImagingError;

    fn try_from(row: DatasetRow) -> Result<Self, Self::Error> {
        let id = DatasetIdentifier::parse(&row.dataset_serial)
            .map_err(|e| ImagingError::Permanent(format!("corrupt dataset row: {}", e)))?;
        Ok(DatasetRecord {
            id,
            upload_type: row
                .upload_type
                .parse::<UploadType>()
                .map_err(|e| ImagingError::Permanent(format!("corrupt dataset row: {}", e)))?,
            storage_prefix: row.storage_prefix,
            status: row.status.parse::<DatasetStatus>()?,
            description: row.description,
            global_metadata: row.global_metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FrameRow {
    dataset_serial: String,
    frame_index: i32,
    storage_key: String,
    metadata: Value,
}

impl TryFrom<FrameRow> for FrameRecord {
    type Error = ImagingError;

    fn try_from(row: FrameRow) -> Result<Self, Self::Error> {
        let dataset_id = DatasetIdentifier::parse(&row.dataset_serial)
            .map_err(|e| ImagingError::Permanent(format!("corrupt frame row: {}", e)))?;
        Ok(FrameRecord {
            dataset_id,
            frame_index: row.frame_index as u32,
            storage_key: row.storage_key,
            metadata: row.metadata,
        })
    }
}

/// PostgreSQL-backed metadata store.
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Connect a pool with the configured limits.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, ImagingError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| ImagingError::Permanent("database URL is not configured".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), ImagingError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ImagingError::Permanent(format!("failed to run migrations: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, record), fields(dataset_id = %record.id))]
    async fn create_pending(&self, record: &DatasetRecord) -> Result<(), ImagingError> {
        let result = sqlx::query(
            r#"
            INSERT INTO datasets (
                dataset_serial, project_id, acquired_at, serial,
                upload_type, storage_prefix, status, description,
                global_metadata, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4,
                $5, $6, $7, $8,
                $9, NOW(), NOW()
            )
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.id.project_id())
        .bind(record.id.acquired_at())
        .bind(record.id.serial() as i32)
        .bind(record.upload_type.as_str())
        .bind(&record.storage_prefix)
        .bind(record.status.as_str())
        .bind(&record.description)
        .bind(&record.global_metadata)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(dataset_id = %record.id, "Dataset record created in pending state");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(ImagingError::DuplicateDataset(record.id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reset_failed(&self, id: &DatasetIdentifier) -> Result<(), ImagingError> {
        let result = sqlx::query(
            r#"
            UPDATE datasets
            SET status = 'pending', updated_at = NOW()
            WHERE dataset_serial = $1 AND status = 'failed'
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(dataset_id = %id, "Failed dataset reclaimed for a fresh attempt");
            Ok(())
        } else {
            Err(ImagingError::DuplicateDataset(id.to_string()))
        }
    }

    #[instrument(skip(self, global_metadata, frames), fields(dataset_id = %id, frames = frames.len()))]
    async fn commit_dataset(
        &self,
        id: &DatasetIdentifier,
        global_metadata: &Value,
        frames: &[FrameRecord],
    ) -> Result<(), ImagingError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE datasets
            SET status = 'complete', global_metadata = $2, updated_at = NOW()
            WHERE dataset_serial = $1 AND status = 'pending'
            "#,
        )
        .bind(id.to_string())
        .bind(global_metadata)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(ImagingError::Permanent(format!(
                "dataset {} is not in pending state",
                id
            )));
        }

        for frame in frames {
            sqlx::query(
                r#"
                INSERT INTO frames (
                    dataset_serial, frame_index, storage_key, metadata, created_at
                ) VALUES (
                    $1, $2, $3, $4, NOW()
                )
                "#,
            )
            .bind(frame.dataset_id.to_string())
            .bind(frame.frame_index as i32)
            .bind(&frame.storage_key)
            .bind(&frame.metadata)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(dataset_id = %id, "Dataset committed");
        Ok(())
    }

    #[instrument(skip(self), fields(dataset_id = %id))]
    async fn mark_failed(&self, id: &DatasetIdentifier) -> Result<(), ImagingError> {
        sqlx::query(
            r#"
            UPDATE datasets
            SET status = 'failed', updated_at = NOW()
            WHERE dataset_serial = $1
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_dataset(
        &self,
        id: &DatasetIdentifier,
    ) -> Result<Option<DatasetRecord>, ImagingError> {
        let row = sqlx::query_as::<_, DatasetRow>(
            r#"
            SELECT dataset_serial, upload_type, storage_prefix, status,
                   description, global_metadata, created_at
            FROM datasets
            WHERE dataset_serial = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DatasetRecord::try_from).transpose()
    }

    async fn list_frames(&self, id: &DatasetIdentifier) -> Result<Vec<FrameRecord>, ImagingError> {
        let rows = sqlx::query_as::<_, FrameRow>(
            r#"
            SELECT dataset_serial, frame_index, storage_key, metadata
            FROM frames
            WHERE dataset_serial = $1
            ORDER BY frame_index ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FrameRecord::try_from).collect()
    }

    async fn dataset_exists(&self, id: &DatasetIdentifier) -> Result<bool, ImagingError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM datasets WHERE dataset_serial = $1)")
                .bind(id.to_string())
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }
}

#[derive(Default)]
struct MemoryInner {
    datasets: HashMap<String, DatasetRecord>,
    frames: HashMap<String, Vec<FrameRecord>>,
}

/// In-memory metadata store mirroring the constraint behavior of the
/// PostgreSQL implementation, used by tests and local experimentation.
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_pending(&self, record: &DatasetRecord) -> Result<(), ImagingError> {
        let mut inner = self.inner.lock().unwrap();
        let key = record.id.to_string();
        if inner.datasets.contains_key(&key) {
            return Err(ImagingError::DuplicateDataset(key));
        }
        inner.datasets.insert(key, record.clone());
        Ok(())
    }

    async fn reset_failed(&self, id: &DatasetIdentifier) -> Result<(), ImagingError> {
        let mut inner = self.inner.lock().unwrap();
        let key = id.to_string();
        match inner.datasets.get_mut(&key) {
            Some(record) if record.status == DatasetStatus::Failed => {
                record.status = DatasetStatus::Pending;
                Ok(())
            }
            _ => Err(ImagingError::DuplicateDataset(key)),
        }
    }

    async fn commit_dataset(
        &self,
        id: &DatasetIdentifier,
        global_metadata: &Value,
        frames: &[FrameRecord],
    ) -> Result<(), ImagingError> {
        let mut inner = self.inner.lock().unwrap();
        let key = id.to_string();
        match inner.datasets.get_mut(&key) {
            Some(record) if record.status == DatasetStatus::Pending => {
                record.status = DatasetStatus::Complete;
                record.global_metadata = global_metadata.clone();
            }
            _ => {
                return Err(ImagingError::Permanent(format!(
                    "dataset {} is not in pending state",
                    id
                )))
            }
        }
        let mut frames = frames.to_vec();
        frames.sort_by_key(|f| f.frame_index);
        inner.frames.insert(key, frames);
        Ok(())
    }

    async fn mark_failed(&self, id: &DatasetIdentifier) -> Result<(), ImagingError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.datasets.get_mut(&id.to_string()) {
            record.status = DatasetStatus::Failed;
        }
        Ok(())
    }

    async fn find_dataset(
        &self,
        id: &DatasetIdentifier,
    ) -> Result<Option<DatasetRecord>, ImagingError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.datasets.get(&id.to_string()).cloned())
    }

    async fn list_frames(&self, id: &DatasetIdentifier) -> Result<Vec<FrameRecord>, ImagingError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.frames.get(&id.to_string()).cloned().unwrap_or_default())
    }

    async fn dataset_exists(&self, id: &DatasetIdentifier) -> Result<bool, ImagingError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.datasets.contains_key(&id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::UploadType;
    use serde_json::json;

    fn test_id() -> DatasetIdentifier {
        DatasetIdentifier::parse("ISP-2018-04-05-00-00-00-0001").unwrap()
    }

    fn pending_record() -> DatasetRecord {
        DatasetRecord::pending(test_id(), UploadType::Frames, None)
    }

    #[tokio::test]
    async fn test_create_pending_enforces_uniqueness() {
        let store = MemoryMetadataStore::new();
        assert!(!store.dataset_exists(&test_id()).await.unwrap());
        store.create_pending(&pending_record()).await.unwrap();
        assert!(store.dataset_exists(&test_id()).await.unwrap());

        let err = store.create_pending(&pending_record()).await.unwrap_err();
        assert!(matches!(err, ImagingError::DuplicateDataset(_)));
    }

    #[tokio::test]
    async fn test_commit_transitions_pending_to_complete() {
        let store = MemoryMetadataStore::new();
        let id = test_id();
        store.create_pending(&pending_record()).await.unwrap();

        let frames = vec![FrameRecord {
            dataset_id: id.clone(),
            frame_index: 0,
            storage_key: format!("{}/raw_frames/000000.png", id.storage_prefix()),
            metadata: json!({"width": 64}),
        }];
        store
            .commit_dataset(&id, &json!({"nbr_frames": 1}), &frames)
            .await
            .unwrap();

        let record = store.find_dataset(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DatasetStatus::Complete);
        assert_eq!(record.global_metadata["nbr_frames"], 1);
        assert_eq!(store.list_frames(&id).await.unwrap().len(), 1);

        // A second commit must not find a pending record.
        let err = store
            .commit_dataset(&id, &json!({}), &frames)
            .await
            .unwrap_err();
        assert!(matches!(err, ImagingError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_reset_failed_only_reclaims_failed_records() {
        let store = MemoryMetadataStore::new();
        let id = test_id();
        store.create_pending(&pending_record()).await.unwrap();

        // Pending records are not reclaimable.
        let err = store.reset_failed(&id).await.unwrap_err();
        assert!(matches!(err, ImagingError::DuplicateDataset(_)));

        store.mark_failed(&id).await.unwrap();
        store.reset_failed(&id).await.unwrap();
        let record = store.find_dataset(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DatasetStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_frames_sorted_by_index() {
        let store = MemoryMetadataStore::new();
        let id = test_id();
        store.create_pending(&pending_record()).await.unwrap();

        let frames: Vec<FrameRecord> = [2u32, 0, 1]
            .iter()
            .map(|i| FrameRecord {
                dataset_id: id.clone(),
                frame_index: *i,
                storage_key: format!("{}/raw_frames/{:06}.png", id.storage_prefix(), i),
                metadata: json!({}),
            })
            .collect();
        store.commit_dataset(&id, &json!({}), &frames).await.unwrap();

        let indices: Vec<u32> = store
            .list_frames(&id)
            .await
            .unwrap()
            .iter()
            .map(|f| f.frame_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
