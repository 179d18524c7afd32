use base64::{engine::general_purpose::STANDARD, Engine};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Errors raised while decoding or persisting an image
#[derive(Error, Debug)]
pub enum ImageStorageError {
    #[error("invalid base64 image data: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Decode an image payload, dropping a data-URI header if present.
///
/// Everything up to and including the first comma is discarded
/// (`data:image/jpeg;base64,...`). Whitespace is ignored so line-wrapped
/// payloads decode as well.
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>, ImageStorageError> {
    let encoded = match payload.split_once(',') {
        Some((_header, body)) => body,
        None => payload,
    };

    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    Ok(STANDARD.decode(compact)?)
}

/// Image files on local disk, one per record, named by record ID
pub struct ImageStore {
    dir: PathBuf,
    extension: String,
}

impl ImageStore {
    /// Open the image directory, creating it if absent
    pub async fn open(dir: impl Into<PathBuf>, extension: &str) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        Ok(Self {
            dir,
            extension: extension.to_lowercase(),
        })
    }

    /// Path an image for the given record is stored at
    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.{}", id, self.extension))
    }

    /// File extension given to stored images
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Decode the payload and write it under the record ID.
    ///
    /// Nothing is written when decoding fails. A failed write removes any
    /// partial file.
    #[instrument(skip(self, payload), fields(record_id = %id, payload_len = payload.len()))]
    pub async fn save(&self, id: Uuid, payload: &str) -> Result<PathBuf, ImageStorageError> {
        let bytes = decode_image_payload(payload)?;
        let path = self.path_for(id);

        if let Err(source) = tokio::fs::write(&path, &bytes).await {
            remove_partial(&path).await;
            return Err(ImageStorageError::Write { path, source });
        }

        debug!(path = %path.display(), size_bytes = bytes.len(), "Image stored");
        Ok(path)
    }

    /// Read a stored image back, `None` if the record has no image
    pub async fn load(&self, id: Uuid) -> Result<Option<Vec<u8>>, ImageStorageError> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ImageStorageError::Read { path, source }),
        }
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove partial image"),
    }
}

/// Get content type for an image extension
pub fn content_type_for(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
