use serde::Serialize;
use uuid::Uuid;

use provisioner_core::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Run a model against the active image series.
    Inference,
    /// Score the overlap of two segmentations.
    Comparison,
    /// Build a discrepancy segmentation from two segmentations, server-side.
    Discrepancy,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobKind::Inference => "inference",
            JobKind::Comparison => "comparison",
            JobKind::Discrepancy => "discrepancy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Submitting,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// A job is in flight and a new submit must be refused.
    pub fn is_busy(&self) -> bool {
        matches!(self, JobStatus::Submitting | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Idle => "idle",
            JobStatus::Submitting => "submitting",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the presentation layer renders for the current job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    /// Submission counter. Bumped by every submit and every reset.
    pub generation: u64,
    pub kind: Option<JobKind>,
    pub progress: Option<Progress>,
    pub message: Option<String>,
    pub correlation_id: Option<Uuid>,
}

impl JobSnapshot {
    /// Selection affordances for the job's inputs are disabled while this holds.
    pub fn inputs_locked(&self) -> bool {
        self.status.is_busy()
    }
}
