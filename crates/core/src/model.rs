//! Shapes exchanged with the remote compute service.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;

/// A deployable inference model as reported by `listModels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Whether a compute instance for this model is currently up (or being set up).
    #[serde(default)]
    pub running: bool,
    #[serde(default, rename = "updatedAt", alias = "updateTime")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One row of a comparison result: a compared structure and its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub label: String,
    pub value: f64,
}

impl ScoreRow {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// Completion of a remote job as last reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// The service is working but has not reported a percentage.
    Indeterminate,
    Percent(u8),
}

impl Progress {
    /// Clamp a raw reported value into `0..=100`. Non-finite values are indeterminate.
    pub fn from_raw(value: f64) -> Self {
        if !value.is_finite() {
            return Progress::Indeterminate;
        }
        Progress::Percent(value.round().clamp(0.0, 100.0) as u8)
    }

    pub fn percent(&self) -> Option<u8> {
        match self {
            Progress::Indeterminate => None,
            Progress::Percent(p) => Some(*p),
        }
    }
}

/// Every result layout the service has been observed to send.
#[derive(Deserialize)]
#[serde(untagged)]
enum ScoreShape {
    /// `[{"label": "Liver", "value": 0.87}]`
    Rows(Vec<ScoreRow>),
    /// `[{"Liver": 0.87}, {"Spleen": 0.91}]`
    Singletons(Vec<IndexMap<String, f64>>),
    /// `{"Liver": 0.87, "Spleen": 0.91}`
    Map(IndexMap<String, f64>),
}

impl ScoreShape {
    fn into_rows(self) -> Result<Vec<ScoreRow>, CoreError> {
        match self {
            ScoreShape::Rows(rows) => Ok(rows),
            ScoreShape::Singletons(entries) => entries
                .into_iter()
                .map(|entry| {
                    if entry.len() != 1 {
                        return Err(CoreError::UnexpectedShape(format!(
                            "score entry has {} keys, expected 1",
                            entry.len()
                        )));
                    }
                    let (label, value) = entry.into_iter().next().ok_or_else(|| {
                        CoreError::UnexpectedShape("empty score entry".to_string())
                    })?;
                    Ok(ScoreRow { label, value })
                })
                .collect(),
            ScoreShape::Map(map) => Ok(map
                .into_iter()
                .map(|(label, value)| ScoreRow { label, value })
                .collect()),
        }
    }
}

/// Parse a comparison result body into ordered score rows.
///
/// Anything that is not one of the known layouts is an
/// [`CoreError::UnexpectedShape`] rather than a partially filled table.
pub fn parse_score_rows(value: serde_json::Value) -> Result<Vec<ScoreRow>, CoreError> {
    let shape: ScoreShape = serde_json::from_value(value)
        .map_err(|e| CoreError::UnexpectedShape(format!("comparison result: {e}")))?;
    shape.into_rows()
}

/// `deserialize_with` helper for optional score tables embedded in other payloads.
pub fn deserialize_optional_score_rows<'de, D>(d: D) -> Result<Option<Vec<ScoreRow>>, D::Error>
where
    D: Deserializer<'de>,
{
    let shape = Option::<ScoreShape>::deserialize(d)?;
    shape
        .map(ScoreShape::into_rows)
        .transpose()
        .map_err(serde::de::Error::custom)
}

/// DICOM identifiers of the image series a job runs against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_uid: Option<String>,
    /// Series instance UID of the image series the segmentations belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_description: Option<String>,
}

impl SubjectDescriptor {
    /// Names of the identifiers the service needs but this descriptor lacks.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.parent_id.as_deref().map_or(true, str::is_empty) {
            missing.push("parent_id");
        }
        if self.study_id.as_deref().map_or(true, str::is_empty) {
            missing.push("study_id");
        }
        missing
    }
}
