//! Push events emitted by the compute service.
//!
//! Frames arrive as `{"type": <name>, "data": {...}}`. Names that this
//! crate does not know are skipped rather than treated as errors, so the
//! service can add events without breaking older panels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use provisioner_core::{deserialize_optional_score_rows, Progress, ScoreRow};

use crate::error::ChannelError;

/// Severity attached to a toast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    #[default]
    Success,
    Warning,
    Error,
}

impl ToastLevel {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("warning") => ToastLevel::Warning,
            Some("error") => ToastLevel::Error,
            _ => ToastLevel::Success,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ToastLevel::Success => "success",
            ToastLevel::Warning => "warning",
            ToastLevel::Error => "error",
        }
    }
}

/// Terminal report for the job the service is currently running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Id the job was submitted with. Older services leave it out.
    #[serde(default, alias = "jobId", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub succeeded: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// Score rows, present when a backgrounded comparison finishes.
    #[serde(default, deserialize_with = "deserialize_optional_score_rows")]
    pub result: Option<Vec<ScoreRow>>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            job_id: None,
            succeeded: true,
            message: None,
            result: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            job_id: None,
            succeeded: false,
            message: Some(message.into()),
            result: None,
        }
    }

    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_result(mut self, result: Vec<ScoreRow>) -> Self {
        self.result = Some(result);
        self
    }
}

/// Subscription filter. One per [`ChannelEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Progress,
    Status,
    ModelListChanged,
    Toast,
    JobFinished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Progress(Progress),
    Status(String),
    ModelListChanged,
    Toast { message: String, level: ToastLevel },
    JobFinished(JobOutcome),
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl ChannelEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            ChannelEvent::Progress(_) => EventCategory::Progress,
            ChannelEvent::Status(_) => EventCategory::Status,
            ChannelEvent::ModelListChanged => EventCategory::ModelListChanged,
            ChannelEvent::Toast { .. } => EventCategory::Toast,
            ChannelEvent::JobFinished(_) => EventCategory::JobFinished,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::JobFinished(_))
    }

    /// Decode a `{"type", "data"}` frame. `Ok(None)` means the frame was
    /// well-formed but carries nothing a subscriber acts on.
    pub fn from_json(text: &str) -> Result<Option<Self>, ChannelError> {
        let frame: WireFrame = serde_json::from_str(text)?;
        Self::from_parts(&frame.kind, frame.data)
    }

    /// Decode an event from its name and payload.
    pub fn from_parts(kind: &str, data: Value) -> Result<Option<Self>, ChannelError> {
        let event = match kind {
            // The service prefixes progress with the job type, e.g. `prediction_progress_update`.
            k if k == "progress_update" || k.ends_with("_progress_update") => {
                let progress = match data.get("value") {
                    None | Some(Value::Null) => Progress::Indeterminate,
                    Some(Value::Number(n)) => n
                        .as_f64()
                        .map(Progress::from_raw)
                        .unwrap_or(Progress::Indeterminate),
                    Some(other) => {
                        return Err(ChannelError::Malformed(format!(
                            "{kind}: value is not a number: {other}"
                        )))
                    }
                };
                ChannelEvent::Progress(progress)
            }
            "status_update" => match non_empty_str(&data, "message") {
                Some(message) => ChannelEvent::Status(message),
                None => return Ok(None),
            },
            "model_instances_update" | "update_model_list" => ChannelEvent::ModelListChanged,
            "toast_message" => match non_empty_str(&data, "message") {
                Some(message) => ChannelEvent::Toast {
                    message,
                    level: ToastLevel::parse(data.get("type").and_then(Value::as_str)),
                },
                None => return Ok(None),
            },
            "job_finished" => {
                let outcome: JobOutcome = serde_json::from_value(data)
                    .map_err(|e| ChannelError::Malformed(format!("{kind}: {e}")))?;
                ChannelEvent::JobFinished(outcome)
            }
            other => {
                debug!(kind = %other, "ignoring unknown channel event");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    /// Encode as a wire frame. The inverse of [`ChannelEvent::from_json`].
    pub fn to_json(&self) -> String {
        let frame = match self {
            ChannelEvent::Progress(progress) => serde_json::json!({
                "type": "progress_update",
                "data": { "value": progress.percent() },
            }),
            ChannelEvent::Status(message) => serde_json::json!({
                "type": "status_update",
                "data": { "message": message },
            }),
            ChannelEvent::ModelListChanged => serde_json::json!({
                "type": "model_instances_update",
                "data": {},
            }),
            ChannelEvent::Toast { message, level } => serde_json::json!({
                "type": "toast_message",
                "data": { "message": message, "type": level.as_str() },
            }),
            ChannelEvent::JobFinished(outcome) => serde_json::json!({
                "type": "job_finished",
                "data": outcome,
            }),
        };
        frame.to_string()
    }
}

fn non_empty_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_progress_variants() {
        let event = ChannelEvent::from_json(r#"{"type":"progress_update","data":{"value":50}}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::Progress(Progress::Percent(50))));

        let event =
            ChannelEvent::from_json(r#"{"type":"prediction_progress_update","data":{"value":85.4}}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::Progress(Progress::Percent(85))));

        let event = ChannelEvent::from_json(r#"{"type":"progress_update","data":{"value":null}}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::Progress(Progress::Indeterminate)));

        assert!(ChannelEvent::from_json(r#"{"type":"progress_update","data":{"value":"x"}}"#).is_err());
    }

    #[test]
    fn empty_status_is_skipped() {
        assert_eq!(ChannelEvent::from_json(r#"{"type":"status_update","data":{}}"#).unwrap(), None);
        let event = ChannelEvent::from_json(r#"{"type":"status_update","data":{"message":"halfway"}}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::Status("halfway".into())));
    }

    #[test]
    fn model_list_change_needs_no_payload() {
        let event = ChannelEvent::from_json(r#"{"type":"model_instances_update"}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::ModelListChanged));
        let event = ChannelEvent::from_json(r#"{"type":"update_model_list","data":{}}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::ModelListChanged));
    }

    #[test]
    fn toast_level_defaults_to_success() {
        let event = ChannelEvent::from_json(r#"{"type":"toast_message","data":{"message":"done"}}"#).unwrap();
        assert_eq!(
            event,
            Some(ChannelEvent::Toast {
                message: "done".into(),
                level: ToastLevel::Success
            })
        );
    }

    #[test]
    fn job_finished_accepts_singleton_scores() {
        let text = r#"{"type":"job_finished","data":{"succeeded":true,"result":[{"liver":0.87}]}}"#;
        let Some(ChannelEvent::JobFinished(outcome)) = ChannelEvent::from_json(text).unwrap() else {
            panic!("expected job_finished");
        };
        assert!(outcome.succeeded);
        assert_eq!(outcome.job_id, None);
        assert_eq!(outcome.result.unwrap(), vec![ScoreRow::new("liver", 0.87)]);
    }

    #[test]
    fn job_finished_carries_job_id() {
        let text = r#"{"type":"job_finished","data":{"jobId":"7c9e","succeeded":false,"message":"no ROI"}}"#;
        let event = ChannelEvent::from_json(text).unwrap();
        assert_eq!(
            event,
            Some(ChannelEvent::JobFinished(JobOutcome::failure("no ROI").for_job("7c9e")))
        );
    }

    #[test]
    fn unknown_events_are_skipped() {
        assert_eq!(ChannelEvent::from_json(r#"{"type":"connect","data":{}}"#).unwrap(), None);
    }

    #[test]
    fn encoding_decodes_back() {
        let events = [
            ChannelEvent::Progress(Progress::Percent(5)),
            ChannelEvent::Status("Converting to SEG...".into()),
            ChannelEvent::ModelListChanged,
            ChannelEvent::Toast {
                message: "Google Cloud is at its limit".into(),
                level: ToastLevel::Error,
            },
            ChannelEvent::JobFinished(JobOutcome::failure("no matching ROI")),
            ChannelEvent::JobFinished(JobOutcome::success().for_job("7c9e").with_result(vec![ScoreRow::new("liver", 0.5)])),
        ];
        for event in events {
            assert_eq!(ChannelEvent::from_json(&event.to_json()).unwrap(), Some(event));
        }
    }
}
