use async_trait::async_trait;
use uuid::Uuid;

use provisioner_core::{ModelInfo, ScoreRow, SegmentDescriptor, SubjectDescriptor};

use crate::error::ServiceCallError;

/// A validated model run.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceInput {
    /// Echoed back by the service in `job_finished`.
    pub job_id: Uuid,
    pub model: String,
    pub subject: SubjectDescriptor,
}

/// A validated pair of segmentations on one image series. Used for both
/// comparison and discrepancy jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonInput {
    pub job_id: Uuid,
    pub primary: SegmentDescriptor,
    pub comparison: SegmentDescriptor,
    pub subject: SubjectDescriptor,
}

/// How the service acknowledged a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Work continues in the background; completion arrives on the channel.
    Accepted { message: Option<String> },
    /// The service finished synchronously with a score table.
    Completed(Vec<ScoreRow>),
}

/// Request/response contract of the remote compute service.
#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ServiceCallError>;

    async fn is_model_running(&self, model: &str) -> Result<bool, ServiceCallError>;

    async fn submit_inference(&self, input: &InferenceInput) -> Result<Submission, ServiceCallError>;

    async fn submit_comparison(&self, input: &ComparisonInput) -> Result<Submission, ServiceCallError>;

    async fn save_discrepancy_mask(&self, input: &ComparisonInput) -> Result<Submission, ServiceCallError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "compute"
    }
}
