use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Diagnosis submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisSubmission {
    pub crop_name: String,
    pub disease_name: String,
    pub category: String,
    /// Model confidence, 0-1 or 0-100 depending on the client
    pub confidence: f64,
    /// Base64 image, optionally behind a data-URI header
    pub image_data: String,
    pub symptoms: Vec<String>,
    pub is_biotic: bool,
}

/// Persisted diagnosis, one entry of the local record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    pub id: Uuid,
    /// Local wall-clock time of ingest, no offset
    #[serde(with = "iso_micros")]
    pub timestamp: NaiveDateTime,
    pub crop: String,
    pub disease: String,
    pub category: String,
    pub confidence: f64,
    #[serde(rename = "isBiotic")]
    pub is_biotic: bool,
    pub symptoms: Vec<String>,
    pub local_image_path: String,
}

impl DiagnosisRecord {
    /// Build the stored record; the image payload itself is not kept
    pub fn from_submission(
        id: Uuid,
        timestamp: NaiveDateTime,
        submission: DiagnosisSubmission,
        image_path: &Path,
    ) -> Self {
        Self {
            id,
            timestamp,
            crop: submission.crop_name,
            disease: submission.disease_name,
            category: submission.category,
            confidence: submission.confidence,
            is_biotic: submission.is_biotic,
            symptoms: submission.symptoms,
            local_image_path: image_path.to_string_lossy().into_owned(),
        }
    }
}

/// ISO-8601 timestamps with exactly six fractional digits
pub mod iso_micros {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const WRITE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
    // `%.f` also accepts a missing fraction
    const READ_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn format(timestamp: &NaiveDateTime) -> String {
        timestamp.format(WRITE_FORMAT).to_string()
    }

    pub fn serialize<S>(timestamp: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&timestamp.format(WRITE_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, READ_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Outcome of a best-effort pipeline step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    Failed(String),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Ok => f.write_str("Ok"),
            StepOutcome::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

impl Serialize for StepOutcome {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}
