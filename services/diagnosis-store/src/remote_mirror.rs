use crate::config::{RemoteBackend, RemoteConfig};
use crate::record::{iso_micros, DiagnosisRecord};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Errors from a remote mirror insert
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote store rejected insert with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Denormalized row sent to the remote table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorRow {
    pub crop_name: String,
    pub disease_name: String,
    pub category: String,
    pub confidence: f64,
    pub is_biotic: bool,
    /// Symptoms joined with commas
    pub symptoms: String,
    #[serde(serialize_with = "iso_micros::serialize")]
    pub timestamp: NaiveDateTime,
}

impl From<&DiagnosisRecord> for MirrorRow {
    fn from(record: &DiagnosisRecord) -> Self {
        Self {
            crop_name: record.crop.clone(),
            disease_name: record.disease.clone(),
            category: record.category.clone(),
            confidence: record.confidence,
            is_biotic: record.is_biotic,
            symptoms: record.symptoms.join(","),
            timestamp: record.timestamp,
        }
    }
}

/// Destination for mirrored rows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MirrorSink: Send + Sync {
    /// Insert one row
    async fn insert(&self, row: &MirrorRow) -> Result<(), MirrorError>;

    /// Human-readable target, for logs and readiness output
    fn describe(&self) -> String;
}

/// Inserts rows through a Supabase/PostgREST table endpoint
pub struct SupabaseRestSink {
    client: reqwest::Client,
    endpoint: String,
    key: String,
}

impl SupabaseRestSink {
    pub fn new(
        base_url: &str,
        key: &str,
        table: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, MirrorError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            key: key.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MirrorSink for SupabaseRestSink {
    async fn insert(&self, row: &MirrorRow) -> Result<(), MirrorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header("Prefer", "return=minimal")
            .json(&[row])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(MirrorError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn describe(&self) -> String {
        format!("rest {}", self.endpoint)
    }
}

/// Inserts rows over a direct Postgres connection
pub struct PostgresSink {
    pool: PgPool,
    table: String,
    insert_sql: String,
}

impl PostgresSink {
    /// Connect the pool; `table` must already be a validated identifier
    pub async fn connect(database_url: &str, config: &RemoteConfig) -> Result<Self, MirrorError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL mirror database");

        let insert_sql = format!(
            r#"
            INSERT INTO {} (
                crop_name, disease_name, category, confidence,
                is_biotic, symptoms, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            config.table
        );

        Ok(Self {
            pool,
            table: config.table.clone(),
            insert_sql,
        })
    }

    /// Create the `diagnoses` table if it does not exist
    pub async fn run_migrations(&self) -> Result<(), MirrorError> {
        info!("Running mirror database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Mirror database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MirrorSink for PostgresSink {
    async fn insert(&self, row: &MirrorRow) -> Result<(), MirrorError> {
        sqlx::query(&self.insert_sql)
            .bind(&row.crop_name)
            .bind(&row.disease_name)
            .bind(&row.category)
            .bind(row.confidence)
            .bind(row.is_biotic)
            .bind(&row.symptoms)
            .bind(row.timestamp)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn describe(&self) -> String {
        format!("postgres table {}", self.table)
    }
}

/// Result of a mirror attempt, reported to the caller verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Success,
    /// No remote store configured; nothing was attempted
    NotConnected,
    Failed(String),
}

impl fmt::Display for MirrorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorOutcome::Success => f.write_str("Success"),
            MirrorOutcome::NotConnected => f.write_str("Not Connected"),
            MirrorOutcome::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

impl Serialize for MirrorOutcome {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Remote store handle, established once at startup
#[derive(Clone)]
pub enum RemoteMirror {
    Connected(Arc<dyn MirrorSink>),
    Disconnected,
}

impl RemoteMirror {
    /// Build the mirror from configuration.
    ///
    /// Missing credentials or a failed connection leave the mirror
    /// disconnected; startup continues either way.
    pub async fn connect(config: &RemoteConfig) -> Self {
        match config.backend {
            RemoteBackend::Rest => {
                let Some((url, key)) = config.rest_credentials() else {
                    info!("Remote credentials not configured, mirroring disabled");
                    return RemoteMirror::Disconnected;
                };

                match SupabaseRestSink::new(url, key, &config.table, config.request_timeout()) {
                    Ok(sink) => {
                        info!(endpoint = %sink.endpoint(), "Remote REST mirror configured");
                        RemoteMirror::Connected(Arc::new(sink))
                    }
                    Err(e) => {
                        warn!(error = %e, "Remote REST mirror setup failed, mirroring disabled");
                        RemoteMirror::Disconnected
                    }
                }
            }
            RemoteBackend::Postgres => {
                let Some(database_url) = config.database_url.as_deref().filter(|u| !u.is_empty())
                else {
                    info!("Mirror database URL not configured, mirroring disabled");
                    return RemoteMirror::Disconnected;
                };

                let sink = match PostgresSink::connect(database_url, config).await {
                    Ok(sink) => sink,
                    Err(e) => {
                        warn!(error = %e, "Mirror database connection failed, mirroring disabled");
                        return RemoteMirror::Disconnected;
                    }
                };

                if config.run_migrations {
                    if let Err(e) = sink.run_migrations().await {
                        warn!(error = %e, "Mirror database migrations failed");
                    }
                }

                RemoteMirror::Connected(Arc::new(sink))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, RemoteMirror::Connected(_))
    }

    pub fn describe(&self) -> String {
        match self {
            RemoteMirror::Connected(sink) => sink.describe(),
            RemoteMirror::Disconnected => "disconnected".to_string(),
        }
    }

    /// Attempt one insert. Failures are reduced to an outcome, never raised.
    #[instrument(skip(self, row), fields(crop = %row.crop_name))]
    pub async fn mirror(&self, row: &MirrorRow) -> MirrorOutcome {
        let sink = match self {
            RemoteMirror::Connected(sink) => sink,
            RemoteMirror::Disconnected => {
                metrics::counter!("diagnosis.mirror.skipped").increment(1);
                return MirrorOutcome::NotConnected;
            }
        };

        match sink.insert(row).await {
            Ok(()) => {
                metrics::counter!("diagnosis.mirror.success").increment(1);
                MirrorOutcome::Success
            }
            Err(e) => {
                warn!(error = %e, sink = %sink.describe(), "Remote mirror insert failed");
                metrics::counter!("diagnosis.mirror.failed").increment(1);
                MirrorOutcome::Failed(e.to_string())
            }
        }
    }
}
