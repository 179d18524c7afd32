use crate::record::DiagnosisRecord;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors from the local record store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("record store {path} is not a valid record list: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize records: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Ordered collection of diagnosis records kept in a single JSON file.
///
/// The file always holds a complete JSON array. Appends rewrite the whole
/// array into a sibling temp file and rename it into place, and are
/// serialized within the process.
pub struct RecordStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Open the store, initializing an empty collection if the file is absent
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(parent, source))?;
        }

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| io_error(&path, source))?;

        let store = Self {
            path,
            write_lock: Mutex::new(()),
        };

        if !exists {
            store.write_all(&[]).await?;
            info!(path = %store.path.display(), "Initialized empty record store");
        }

        Ok(store)
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, returning the new collection size
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn append(&self, record: &DiagnosisRecord) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.read_all().await?;
        records.push(record.clone());
        self.write_all(&records).await?;

        debug!(total_records = records.len(), "Record appended");
        Ok(records.len())
    }

    /// All records in submission order
    pub async fn list(&self) -> Result<Vec<DiagnosisRecord>, StoreError> {
        self.read_all().await
    }

    /// Find a record by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<DiagnosisRecord>, StoreError> {
        Ok(self.read_all().await?.into_iter().find(|r| r.id == id))
    }

    async fn read_all(&self) -> Result<Vec<DiagnosisRecord>, StoreError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| io_error(&self.path, source))?;

        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_all(&self, records: &[DiagnosisRecord]) -> Result<(), StoreError> {
        let body = to_pretty_json(records)?;
        let tmp_path = self.temp_path();

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &self.path).await
        }
        .await;

        if let Err(source) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_error(&self.path, source));
        }

        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Four-space indented JSON, non-ASCII left as-is
fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::sync::Arc;

    fn make_record(crop: &str) -> DiagnosisRecord {
        let id = Uuid::new_v4();
        DiagnosisRecord {
            id,
            timestamp: Local::now().naive_local(),
            crop: crop.to_string(),
            disease: "Late blight".to_string(),
            category: "Disease".to_string(),
            confidence: 0.81,
            is_biotic: true,
            symptoms: vec!["water-soaked lesions".to_string()],
            local_image_path: format!("data_store/images/{}.jpg", id),
        }
    }

    #[tokio::test]
    async fn test_open_initializes_empty_list() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("records.json");
        let store = RecordStore::open(&path).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_keeps_existing_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("records.json");

        let store = RecordStore::open(&path).await.unwrap();
        store.append(&make_record("Rice")).await.unwrap();
        drop(store);

        let reopened = RecordStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_appends_preserve_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::open(tmp.path().join("records.json")).await.unwrap();

        let records: Vec<_> = ["Rice", "Potato", "Jute"].iter().map(|c| make_record(c)).collect();
        for (i, record) in records.iter().enumerate() {
            assert_eq!(store.append(record).await.unwrap(), i + 1);
        }

        let stored_ids: Vec<_> = store.list().await.unwrap().iter().map(|r| r.id).collect();
        let expected_ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(stored_ids, expected_ids);
        assert_eq!(store.get(records[1].id).await.unwrap().unwrap().crop, "Potato");
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::open(tmp.path().join("records.json")).await.unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append(&make_record(&format!("crop-{}", i))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_file_format() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("records.json");
        let store = RecordStore::open(&path).await.unwrap();
        store.append(&make_record("পাট")).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("পাট"));
        assert!(text.contains("\n        \"crop\""));
        assert!(!tmp.path().join("records.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("records.json");
        std::fs::write(&path, "[{\"id\": ").unwrap();

        let store = RecordStore::open(&path).await.unwrap();
        let result = store.append(&make_record("Rice")).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[{\"id\": ");
    }
}
