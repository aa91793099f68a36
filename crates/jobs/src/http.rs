//! reqwest client for the compute service's JSON endpoints.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use provisioner_core::config::ServiceConfig;
use provisioner_core::{parse_score_rows, ModelInfo, SegmentDescriptor, SubjectDescriptor};

use crate::error::ServiceCallError;
use crate::service::{ComparisonInput, ComputeService, InferenceInput, Submission};

#[derive(Deserialize)]
struct ModelList {
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RunningBody {
    running: bool,
}

#[derive(Serialize)]
struct RunBody<'a> {
    #[serde(rename = "jobId")]
    job_id: Uuid,
    #[serde(rename = "selectedModel")]
    selected_model: &'a str,
    #[serde(flatten)]
    subject: &'a SubjectDescriptor,
}

#[derive(Serialize)]
struct ModelQuery<'a> {
    #[serde(rename = "selectedModel")]
    selected_model: &'a str,
}

/// One side of a comparison, sent JSON-encoded inside the request body.
#[derive(Serialize)]
struct MaskDescriptor<'a> {
    series_desc: &'a str,
    series_uid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    patient_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    study_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    study_desc: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    study_uid: Option<&'a str>,
}

#[derive(Serialize)]
struct ScoreBody<'a> {
    #[serde(rename = "jobId")]
    job_id: Uuid,
    #[serde(rename = "parentDicomId")]
    parent_dicom_id: Option<&'a str>,
    #[serde(rename = "currentMask")]
    current_mask: String,
    #[serde(rename = "groundTruth")]
    ground_truth: String,
}

#[derive(Serialize)]
struct DiscrepancyBody<'a> {
    #[serde(rename = "jobId")]
    job_id: Uuid,
    parent_id: Option<&'a str>,
    #[serde(rename = "predSeriesUid")]
    pred_series_uid: &'a str,
    #[serde(rename = "truthSeriesUid")]
    truth_series_uid: &'a str,
}

fn mask<'a>(segment: &'a SegmentDescriptor, subject: &'a SubjectDescriptor) -> MaskDescriptor<'a> {
    MaskDescriptor {
        series_desc: &segment.label,
        series_uid: segment.id.as_str(),
        patient_id: subject.patient_id.as_deref(),
        study_id: subject.study_id.as_deref(),
        study_desc: subject.study_description.as_deref(),
        study_uid: subject.study_uid.as_deref(),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, ServiceCallError> {
    serde_json::to_string(value).map_err(|e| ServiceCallError::service(None, format!("failed to encode request: {e}")))
}

/// [`ComputeService`] over HTTP. Paths resolve against [`ServiceConfig::endpoint`].
pub struct HttpComputeService {
    client: reqwest::Client,
    config: ServiceConfig,
}

impl HttpComputeService {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: ServiceConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, ServiceCallError> {
        let url = self.config.endpoint(path);
        debug!(url = %url, "POST");
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "compute service unreachable");
            ServiceCallError::Transport(e.to_string())
        })?;
        check(response).await
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ServiceCallError> {
        let url = self.config.endpoint(path);
        debug!(url = %url, "GET");
        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "compute service unreachable");
            ServiceCallError::Transport(e.to_string())
        })?;
        check(response).await
    }
}

/// Turn non-2xx responses into [`ServiceCallError::Service`] carrying the body's `message`.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceCallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<MessageBody>()
        .await
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| format!("compute service returned {status}"));
    warn!(status = status.as_u16(), message = %message, "compute service rejected request");
    Err(ServiceCallError::service(Some(status.as_u16()), message))
}

async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response, what: &str) -> Result<T, ServiceCallError> {
    let status = response.status().as_u16();
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ServiceCallError::service(Some(status), format!("unexpected {what} response: {e}")))
}

async fn accepted(response: reqwest::Response) -> Submission {
    // The acknowledgement body is informational; an empty or odd body is still an acknowledgement.
    let message = response.json::<MessageBody>().await.ok().and_then(|b| b.message);
    Submission::Accepted { message }
}

#[async_trait]
impl ComputeService for HttpComputeService {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ServiceCallError> {
        let response = self.get("listModels").await?;
        let list: ModelList = decode(response, "listModels").await?;
        debug!(count = list.models.len(), "models listed");
        Ok(list.models)
    }

    async fn is_model_running(&self, model: &str) -> Result<bool, ServiceCallError> {
        let response = self.post("isModelRunning", &ModelQuery { selected_model: model }).await?;
        let body: RunningBody = decode(response, "isModelRunning").await?;
        Ok(body.running)
    }

    async fn submit_inference(&self, input: &InferenceInput) -> Result<Submission, ServiceCallError> {
        let body = RunBody {
            job_id: input.job_id,
            selected_model: &input.model,
            subject: &input.subject,
        };
        let response = self.post("run", &body).await?;
        Ok(accepted(response).await)
    }

    async fn submit_comparison(&self, input: &ComparisonInput) -> Result<Submission, ServiceCallError> {
        let body = ScoreBody {
            job_id: input.job_id,
            parent_dicom_id: input.subject.parent_id.as_deref(),
            current_mask: encode(&mask(&input.primary, &input.subject))?,
            ground_truth: encode(&mask(&input.comparison, &input.subject))?,
        };
        let response = self.post("getDICEScores", &body).await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(accepted(response).await);
        }
        let value: serde_json::Value = decode(response, "getDICEScores").await?;
        let rows = parse_score_rows(value).map_err(|e| ServiceCallError::service(None, e.to_string()))?;
        Ok(Submission::Completed(rows))
    }

    async fn save_discrepancy_mask(&self, input: &ComparisonInput) -> Result<Submission, ServiceCallError> {
        let body = DiscrepancyBody {
            job_id: input.job_id,
            parent_id: input.subject.parent_id.as_deref(),
            pred_series_uid: input.primary.id.as_str(),
            truth_series_uid: input.comparison.id.as_str(),
        };
        let response = self.post("saveDiscrepancyMask", &body).await?;
        Ok(accepted(response).await)
    }

    fn name(&self) -> &str {
        "http"
    }
}
