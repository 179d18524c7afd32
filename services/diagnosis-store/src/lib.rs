//! Diagnosis Store Service
//!
//! Ingest service for crop diagnosis records. Each submission carries a
//! base64 image and the diagnosis metadata; the image is written to local
//! disk, the metadata is appended to a local JSON record store, and a
//! denormalized row is mirrored to a remote table on a best-effort basis.
//!
//! ## Features
//!
//! - **Single abort point**: only a failed image decode/write rejects a
//!   submission; later steps report their outcome instead of failing
//! - **Crash-safe record store**: appends are serialized and written through
//!   a temp file + rename, so the store is always a complete JSON array
//! - **Pluggable mirror**: Supabase REST endpoint or a direct Postgres
//!   connection, chosen at startup and injected as `RemoteMirror`
//!
//! ## Architecture
//!
//! ```text
//!  POST /record
//!       │
//!       ▼
//! ┌──────────────┐   decode + write   ┌──────────────┐
//! │ Ingest       │───────────────────▶│ Image Store  │  {root}/images/<id>.jpg
//! │ Service      │                    └──────────────┘
//! │              │   append           ┌──────────────┐
//! │              │───────────────────▶│ Record Store │  {root}/records.json
//! │              │                    └──────────────┘
//! │              │   best effort      ┌──────────────┐
//! │              │───────────────────▶│ Remote       │  REST table / Postgres
//! └──────────────┘                    │ Mirror       │
//!                                     └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod image_store;
pub mod ingest;
pub mod record;
pub mod record_store;
pub mod remote_mirror;

pub use api::{AppState, RecordResponse};
pub use config::Config;
pub use image_store::{ImageStorageError, ImageStore};
pub use ingest::{IngestError, IngestResult, IngestService};
pub use record::{DiagnosisRecord, DiagnosisSubmission, StepOutcome};
pub use record_store::{RecordStore, StoreError};
pub use remote_mirror::{MirrorOutcome, MirrorRow, MirrorSink, RemoteMirror};
