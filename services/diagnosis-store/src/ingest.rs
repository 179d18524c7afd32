use crate::config::StorageConfig;
use crate::image_store::{ImageStorageError, ImageStore};
use crate::record::{DiagnosisRecord, DiagnosisSubmission, StepOutcome};
use crate::record_store::{RecordStore, StoreError};
use crate::remote_mirror::{MirrorOutcome, MirrorRow, RemoteMirror};
use chrono::{Local, SubsecRound};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Errors that abort a submission
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Local image save failed: {0}")]
    ImageStorage(#[from] ImageStorageError),
}

/// Per-step result of a successful submission
#[derive(Debug, Clone)]
pub struct IngestResult {
    pub record_id: Uuid,
    /// Whether the metadata append actually landed
    pub local_storage: StepOutcome,
    pub remote_sync: MirrorOutcome,
}

/// Ingest pipeline: image to disk, metadata to the local store, row to the mirror
pub struct IngestService {
    images: ImageStore,
    records: RecordStore,
    mirror: RemoteMirror,
}

impl IngestService {
    pub fn new(images: ImageStore, records: RecordStore, mirror: RemoteMirror) -> Self {
        Self {
            images,
            records,
            mirror,
        }
    }

    /// Prepare the local storage layout and build the service
    pub async fn open(storage: &StorageConfig, mirror: RemoteMirror) -> Result<Self, StoreError> {
        let images_path = storage.images_path();
        let images = ImageStore::open(&images_path, &storage.image_extension)
            .await
            .map_err(|source| StoreError::Io {
                path: images_path.clone(),
                source,
            })?;
        let records = RecordStore::open(storage.records_path()).await?;

        info!(
            root = %storage.root_dir.display(),
            remote_connected = mirror.is_connected(),
            "Local storage ready"
        );

        Ok(Self::new(images, records, mirror))
    }

    /// Store one submission.
    ///
    /// Only a failed image decode/write aborts. A failed metadata append and
    /// a failed or skipped mirror insert are reported in the result.
    #[instrument(
        skip(self, submission),
        fields(crop = %submission.crop_name, disease = %submission.disease_name)
    )]
    pub async fn submit(&self, submission: DiagnosisSubmission) -> Result<IngestResult, IngestError> {
        let started = Instant::now();
        let record_id = Uuid::new_v4();
        let timestamp = Local::now().naive_local().trunc_subsecs(6);

        let image_path = match self.images.save(record_id, &submission.image_data).await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, record_id = %record_id, "Image storage failed");
                metrics::counter!("diagnosis.submissions.rejected").increment(1);
                return Err(e.into());
            }
        };

        let record = DiagnosisRecord::from_submission(record_id, timestamp, submission, &image_path);

        let local_storage = match self.records.append(&record).await {
            Ok(_) => StepOutcome::Ok,
            Err(e) => {
                error!(error = %e, record_id = %record_id, "Local metadata append failed");
                metrics::counter!("diagnosis.local_store.failures").increment(1);
                StepOutcome::Failed(e.to_string())
            }
        };

        let remote_sync = self.mirror.mirror(&MirrorRow::from(&record)).await;

        metrics::counter!("diagnosis.submissions.accepted").increment(1);
        metrics::histogram!("diagnosis.ingest.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            record_id = %record_id,
            local_storage = %local_storage,
            remote_sync = %remote_sync,
            "Diagnosis stored"
        );

        Ok(IngestResult {
            record_id,
            local_storage,
            remote_sync,
        })
    }

    /// All stored records in submission order
    pub async fn records(&self) -> Result<Vec<DiagnosisRecord>, StoreError> {
        self.records.list().await
    }

    pub async fn record(&self, id: Uuid) -> Result<Option<DiagnosisRecord>, StoreError> {
        self.records.get(id).await
    }

    /// Stored image bytes for a record
    pub async fn image(&self, id: Uuid) -> Result<Option<Vec<u8>>, ImageStorageError> {
        self.images.load(id).await
    }

    pub fn image_extension(&self) -> &str {
        self.images.extension()
    }

    pub fn mirror(&self) -> &RemoteMirror {
        &self.mirror
    }
}
