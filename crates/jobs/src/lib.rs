//! Remote job submission and the state machine that tracks it.

pub mod controller;
pub mod error;
pub mod http;
pub mod resolver;
pub mod service;
pub mod state;

pub use controller::{CompletionHandler, JobController, JobRequest};
pub use error::{JobError, ServiceCallError};
pub use http::HttpComputeService;
pub use resolver::{Completion, CompletionSource};
pub use service::{ComparisonInput, ComputeService, InferenceInput, Submission};
pub use state::{JobKind, JobSnapshot, JobStatus};
