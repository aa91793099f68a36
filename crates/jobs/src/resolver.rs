//! Single-consumer resolution of job completions.
//!
//! A job can finish through the submit response or through a `job_finished`
//! channel event, and either may arrive late or twice. Every signal is
//! tagged with the generation it belongs to; only the first signal for the
//! active generation is accepted.

use uuid::Uuid;

use provisioner_core::{ScoreRow, SegmentDescriptor};

use crate::state::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    Response,
    Channel,
}

/// A terminal transition, handed to the completion handler exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub generation: u64,
    pub kind: JobKind,
    pub correlation_id: Uuid,
    pub succeeded: bool,
    pub message: Option<String>,
    pub result: Option<Vec<ScoreRow>>,
    /// `[primary, comparison]` as captured at submit time, for pair jobs.
    pub descriptors: Option<[SegmentDescriptor; 2]>,
    pub source: CompletionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Accept,
    /// The signal belongs to a superseded generation.
    Stale,
    /// The active generation was already resolved.
    Duplicate,
}

#[derive(Debug, Default)]
pub(crate) struct CompletionResolver {
    resolved: Option<u64>,
}

impl CompletionResolver {
    pub(crate) fn resolve(&mut self, active: u64, signal: u64) -> Resolution {
        if signal != active {
            return Resolution::Stale;
        }
        if self.resolved == Some(signal) {
            return Resolution::Duplicate;
        }
        self.resolved = Some(signal);
        Resolution::Accept
    }
}
