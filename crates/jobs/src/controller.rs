//! State machine for the job currently submitted from a panel.
//!
//! `idle -> submitting -> running -> succeeded | failed`, with `reset` back to
//! idle from anywhere. State lives behind a std mutex that is never held
//! across an `.await`, so the snapshot stays readable and `reset` stays
//! callable while a request is outstanding.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use provisioner_channel::{ChannelEvent, EventCategory, JobOutcome, ProgressChannel, Subscription};
use provisioner_core::{ScoreRow, SegmentDescriptor, SubjectDescriptor};

use crate::error::{JobError, ServiceCallError};
use crate::resolver::{Completion, CompletionResolver, CompletionSource, Resolution};
use crate::service::{ComparisonInput, ComputeService, InferenceInput, Submission};
use crate::state::{JobKind, JobSnapshot, JobStatus};

/// Invoked once per accepted terminal transition, outside the controller lock.
pub type CompletionHandler = Arc<dyn Fn(&Completion) + Send + Sync>;

/// A submit as the user composed it. Selections may be missing; the
/// controller refuses those before anything reaches the network.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRequest {
    Inference {
        model: Option<String>,
        subject: SubjectDescriptor,
    },
    Comparison {
        primary: Option<SegmentDescriptor>,
        comparison: Option<SegmentDescriptor>,
        subject: SubjectDescriptor,
    },
    Discrepancy {
        primary: Option<SegmentDescriptor>,
        comparison: Option<SegmentDescriptor>,
        subject: SubjectDescriptor,
    },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Inference { .. } => JobKind::Inference,
            JobRequest::Comparison { .. } => JobKind::Comparison,
            JobRequest::Discrepancy { .. } => JobKind::Discrepancy,
        }
    }

    fn validate(self, job_id: Uuid) -> Result<ValidJob, JobError> {
        match self {
            JobRequest::Inference { model, subject } => {
                let model = model
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| JobError::Validation("Please select a model.".to_string()))?;
                let missing = subject.missing_fields();
                if !missing.is_empty() {
                    return Err(JobError::Validation(format!(
                        "No active image series (missing {}).",
                        missing.join(", ")
                    )));
                }
                Ok(ValidJob::Inference(InferenceInput { job_id, model, subject }))
            }
            JobRequest::Comparison {
                primary,
                comparison,
                subject,
            } => validate_pair(job_id, primary, comparison, subject).map(ValidJob::Comparison),
            JobRequest::Discrepancy {
                primary,
                comparison,
                subject,
            } => validate_pair(job_id, primary, comparison, subject).map(ValidJob::Discrepancy),
        }
    }
}

fn validate_pair(
    job_id: Uuid,
    primary: Option<SegmentDescriptor>,
    comparison: Option<SegmentDescriptor>,
    subject: SubjectDescriptor,
) -> Result<ComparisonInput, JobError> {
    let primary =
        primary.ok_or_else(|| JobError::Validation("Please select a segmentation to compare.".to_string()))?;
    let comparison = comparison.ok_or_else(|| {
        JobError::Validation("Please select a segmentation to compare against.".to_string())
    })?;
    if primary.id == comparison.id {
        return Err(JobError::Validation(
            "A segmentation cannot be compared with itself.".to_string(),
        ));
    }
    if subject.parent_id.as_deref().map_or(true, str::is_empty) {
        return Err(JobError::Validation("No active image series.".to_string()));
    }
    Ok(ComparisonInput {
        job_id,
        primary,
        comparison,
        subject,
    })
}

enum ValidJob {
    Inference(InferenceInput),
    Comparison(ComparisonInput),
    Discrepancy(ComparisonInput),
}

impl ValidJob {
    fn kind(&self) -> JobKind {
        match self {
            ValidJob::Inference(_) => JobKind::Inference,
            ValidJob::Comparison(_) => JobKind::Comparison,
            ValidJob::Discrepancy(_) => JobKind::Discrepancy,
        }
    }

    fn descriptors(&self) -> Option<[SegmentDescriptor; 2]> {
        match self {
            ValidJob::Inference(_) => None,
            ValidJob::Comparison(input) | ValidJob::Discrepancy(input) => {
                Some([input.primary.clone(), input.comparison.clone()])
            }
        }
    }
}

struct ActiveJob {
    kind: JobKind,
    correlation_id: Uuid,
    descriptors: Option<[SegmentDescriptor; 2]>,
}

impl ActiveJob {
    /// Whether a `job_finished` report belongs to this job. Reports without
    /// an id are matched on shape: only comparisons return score rows.
    fn owns(&self, outcome: &JobOutcome) -> bool {
        match outcome.job_id.as_deref() {
            Some(id) => Uuid::parse_str(id).is_ok_and(|id| id == self.correlation_id),
            None => outcome.result.is_none() || self.kind == JobKind::Comparison,
        }
    }
}

/// A terminal signal before it is resolved against the active generation.
struct Terminal {
    succeeded: bool,
    message: Option<String>,
    result: Option<Vec<ScoreRow>>,
}

impl From<JobOutcome> for Terminal {
    fn from(outcome: JobOutcome) -> Self {
        Self {
            succeeded: outcome.succeeded,
            message: outcome.message,
            result: outcome.result,
        }
    }
}

#[derive(Default)]
struct State {
    snapshot: JobSnapshot,
    active: Option<ActiveJob>,
    resolver: CompletionResolver,
}

struct Inner {
    service: Arc<dyn ComputeService>,
    state: Mutex<State>,
    snapshots: watch::Sender<JobSnapshot>,
    handler: Mutex<Option<CompletionHandler>>,
}

/// Tracks at most one in-flight job. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

impl JobController {
    pub fn new(service: Arc<dyn ComputeService>) -> Self {
        let (snapshots, _) = watch::channel(JobSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                service,
                state: Mutex::new(State::default()),
                snapshots,
                handler: Mutex::new(None),
            }),
        }
    }

    pub fn service(&self) -> &Arc<dyn ComputeService> {
        &self.inner.service
    }

    /// Install the handler that receives accepted completions, replacing any previous one.
    pub fn on_completion<F>(&self, handler: F)
    where
        F: Fn(&Completion) + Send + Sync + 'static,
    {
        *self.inner.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn watch(&self) -> watch::Receiver<JobSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn inputs_locked(&self) -> bool {
        self.lock().snapshot.inputs_locked()
    }

    /// Submit a job. Refused with [`JobError::Busy`] while another job is in
    /// flight and with [`JobError::Validation`] when a selection is missing;
    /// neither refusal touches the network or the state.
    ///
    /// Returns the snapshot after the service's answer has been applied.
    pub async fn submit(&self, request: JobRequest) -> Result<JobSnapshot, JobError> {
        let (job, generation) = {
            let mut state = self.lock();
            if state.snapshot.status.is_busy() {
                let kind = state.snapshot.kind.unwrap_or_else(|| request.kind());
                debug!(kind = %kind, generation = state.snapshot.generation, "submit refused, job in flight");
                return Err(JobError::Busy(kind));
            }
            let correlation_id = Uuid::new_v4();
            let job = request.validate(correlation_id)?;

            let kind = job.kind();
            let generation = state.snapshot.generation + 1;
            state.active = Some(ActiveJob {
                kind,
                correlation_id,
                descriptors: job.descriptors(),
            });
            state.snapshot = JobSnapshot {
                status: JobStatus::Submitting,
                generation,
                kind: Some(kind),
                progress: None,
                message: None,
                correlation_id: Some(correlation_id),
            };
            self.publish(&state);
            info!(kind = %kind, generation, correlation_id = %correlation_id, "job submitting");
            (job, generation)
        };

        let service = &self.inner.service;
        let response = match &job {
            ValidJob::Inference(input) => service.submit_inference(input).await,
            ValidJob::Comparison(input) => service.submit_comparison(input).await,
            ValidJob::Discrepancy(input) => service.save_discrepancy_mask(input).await,
        };

        let mut failure: Option<ServiceCallError> = None;
        let (completion, snapshot) = {
            let mut state = self.lock();
            if state.snapshot.generation != generation {
                debug!(generation, current = state.snapshot.generation, "response for abandoned job discarded");
                return Err(JobError::Superseded(generation));
            }
            let completion = match response {
                Ok(Submission::Accepted { message }) => {
                    self.acknowledge(&mut state, generation, message);
                    None
                }
                Ok(Submission::Completed(rows)) => {
                    self.acknowledge(&mut state, generation, None);
                    let terminal = Terminal {
                        succeeded: true,
                        message: None,
                        result: Some(rows),
                    };
                    self.finish(&mut state, generation, terminal, CompletionSource::Response)
                }
                Err(e) => {
                    let terminal = Terminal {
                        succeeded: false,
                        message: Some(e.user_message()),
                        result: None,
                    };
                    let completion = self.finish(&mut state, generation, terminal, CompletionSource::Response);
                    if completion.is_some() {
                        failure = Some(e);
                    }
                    completion
                }
            };
            (completion, state.snapshot.clone())
        };

        if let Some(completion) = completion {
            self.notify(&completion);
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(snapshot),
        }
    }

    /// Return to idle. Any signal still owed to the abandoned job is discarded
    /// when it arrives; the remote work itself is not cancelled.
    pub fn reset(&self) {
        let mut state = self.lock();
        let generation = state.snapshot.generation + 1;
        state.snapshot = JobSnapshot {
            generation,
            ..JobSnapshot::default()
        };
        state.active = None;
        self.publish(&state);
        info!(generation, "job reset");
    }

    /// Feed one channel event into the state machine.
    pub fn apply_event(&self, event: &ChannelEvent) {
        let completion = {
            let mut state = self.lock();
            if !state.snapshot.status.is_busy() {
                debug!(category = ?event.category(), status = %state.snapshot.status, "no job in flight, event ignored");
                return;
            }
            match event {
                ChannelEvent::Progress(progress) => {
                    state.snapshot.progress = Some(*progress);
                    self.publish(&state);
                    None
                }
                ChannelEvent::Status(message) => {
                    state.snapshot.message = Some(message.clone());
                    self.publish(&state);
                    None
                }
                ChannelEvent::JobFinished(outcome) => {
                    let owned = state.active.as_ref().is_some_and(|job| job.owns(outcome));
                    if !owned {
                        debug!(
                            job_id = ?outcome.job_id,
                            generation = state.snapshot.generation,
                            "job_finished for another job discarded"
                        );
                        return;
                    }
                    let generation = state.snapshot.generation;
                    self.finish(&mut state, generation, outcome.clone().into(), CompletionSource::Channel)
                }
                ChannelEvent::ModelListChanged | ChannelEvent::Toast { .. } => None,
            }
        };
        if let Some(completion) = completion {
            self.notify(&completion);
        }
    }

    /// Subscribe to the channel categories that drive the state machine.
    /// Dropping the returned handles detaches the controller.
    pub fn attach(&self, channel: &ProgressChannel) -> Vec<Subscription> {
        [EventCategory::Progress, EventCategory::Status, EventCategory::JobFinished]
            .into_iter()
            .map(|category| {
                let controller = self.clone();
                channel.subscribe(category, move |event| controller.apply_event(event))
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.inner.snapshots.send_replace(state.snapshot.clone());
    }

    fn acknowledge(&self, state: &mut State, generation: u64, message: Option<String>) {
        if state.snapshot.generation != generation {
            debug!(generation, current = state.snapshot.generation, "stale acknowledgement discarded");
            return;
        }
        // A channel event may already have finished the job.
        if state.snapshot.status != JobStatus::Submitting {
            return;
        }
        state.snapshot.status = JobStatus::Running;
        if message.is_some() {
            state.snapshot.message = message;
        }
        self.publish(state);
        info!(generation, kind = ?state.snapshot.kind, "job running");
    }

    fn finish(
        &self,
        state: &mut State,
        generation: u64,
        terminal: Terminal,
        source: CompletionSource,
    ) -> Option<Completion> {
        let active = state.snapshot.generation;
        match state.resolver.resolve(active, generation) {
            Resolution::Stale => {
                debug!(generation, current = active, ?source, "stale completion discarded");
                return None;
            }
            Resolution::Duplicate => {
                debug!(generation, ?source, "duplicate completion ignored");
                return None;
            }
            Resolution::Accept => {}
        }
        let job = state.active.as_ref()?;

        let mut terminal = terminal;
        if terminal.succeeded && job.kind == JobKind::Comparison && terminal.result.is_none() {
            terminal = Terminal {
                succeeded: false,
                message: Some("Comparison finished without a result.".to_string()),
                result: None,
            };
        }

        state.snapshot.status = if terminal.succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        if terminal.message.is_some() {
            state.snapshot.message = terminal.message.clone();
        }
        self.publish(state);

        if terminal.succeeded {
            info!(generation, kind = %job.kind, ?source, "job succeeded");
        } else {
            warn!(generation, kind = %job.kind, ?source, message = ?terminal.message, "job failed");
        }

        Some(Completion {
            generation,
            kind: job.kind,
            correlation_id: job.correlation_id,
            succeeded: terminal.succeeded,
            message: terminal.message,
            result: terminal.result,
            descriptors: job.descriptors.clone(),
            source,
        })
    }

    fn notify(&self, completion: &Completion) {
        let handler = self.inner.handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = handler {
            handler(completion);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use provisioner_core::{ModelInfo, Progress};
    use tokio::sync::oneshot;

    use super::*;

    /// Pops one scripted response per submit. The first call can be held
    /// open until the test releases it.
    #[derive(Default)]
    struct MockService {
        calls: AtomicUsize,
        responses: Mutex<VecDeque<Result<Submission, ServiceCallError>>>,
        hold: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl MockService {
        fn scripted(responses: Vec<Result<Submission, ServiceCallError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            })
        }

        fn held(responses: Vec<Result<Submission, ServiceCallError>>) -> (Arc<Self>, oneshot::Sender<()>) {
            let (tx, rx) = oneshot::channel();
            let service = Self::scripted(responses);
            *service.hold.lock().unwrap() = Some(rx);
            (service, tx)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn respond(&self) -> Result<Submission, ServiceCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Submission::Accepted { message: None }));
            let hold = self.hold.lock().unwrap().take();
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            response
        }
    }

    #[async_trait]
    impl ComputeService for MockService {
        async fn list_models(&self) -> Result<Vec<ModelInfo>, ServiceCallError> {
            Ok(vec![])
        }

        async fn is_model_running(&self, _model: &str) -> Result<bool, ServiceCallError> {
            Ok(false)
        }

        async fn submit_inference(&self, _input: &InferenceInput) -> Result<Submission, ServiceCallError> {
            self.respond().await
        }

        async fn submit_comparison(&self, _input: &ComparisonInput) -> Result<Submission, ServiceCallError> {
            self.respond().await
        }

        async fn save_discrepancy_mask(&self, _input: &ComparisonInput) -> Result<Submission, ServiceCallError> {
            self.respond().await
        }
    }

    fn subject() -> SubjectDescriptor {
        SubjectDescriptor {
            patient_id: Some("P-001".into()),
            study_id: Some("S-001".into()),
            study_uid: Some("1.2.3".into()),
            parent_id: Some("1.2.3.4".into()),
            study_description: None,
        }
    }

    fn inference() -> JobRequest {
        JobRequest::Inference {
            model: Some("model-a".into()),
            subject: subject(),
        }
    }

    fn comparison(a: &str, b: &str) -> JobRequest {
        JobRequest::Comparison {
            primary: Some(SegmentDescriptor::new(a, "Prediction")),
            comparison: Some(SegmentDescriptor::new(b, "Ground truth")),
            subject: subject(),
        }
    }

    fn recorder(controller: &JobController) -> Arc<Mutex<Vec<Completion>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        controller.on_completion(move |c| sink.lock().unwrap().push(c.clone()));
        seen
    }

    async fn wait_for_status(controller: &JobController, status: JobStatus) {
        let mut rx = controller.watch();
        tokio::time::timeout(Duration::from_secs(2), async {
            while rx.borrow_and_update().status != status {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("status never reached");
    }

    #[tokio::test]
    async fn missing_model_is_refused_locally() {
        let service = MockService::scripted(vec![]);
        let controller = JobController::new(service.clone());

        let err = controller
            .submit(JobRequest::Inference {
                model: None,
                subject: subject(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(ref m) if m == "Please select a model."));
        assert_eq!(service.calls(), 0);
        assert_eq!(controller.snapshot(), JobSnapshot::default());
    }

    #[tokio::test]
    async fn missing_comparison_side_is_refused() {
        let service = MockService::scripted(vec![]);
        let controller = JobController::new(service.clone());

        let err = controller
            .submit(JobRequest::Comparison {
                primary: Some(SegmentDescriptor::new("s1", "S1")),
                comparison: None,
                subject: subject(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(matches!(
            controller.submit(comparison("s1", "s1")).await,
            Err(JobError::Validation(_))
        ));
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn second_submit_while_busy_makes_no_call() {
        let (service, release) = MockService::held(vec![]);
        let controller = JobController::new(service.clone());

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.submit(inference()).await })
        };
        wait_for_status(&controller, JobStatus::Submitting).await;
        assert!(controller.inputs_locked());

        let err = controller.submit(comparison("a", "b")).await.unwrap_err();
        assert!(matches!(err, JobError::Busy(JobKind::Inference)));
        assert_eq!(service.calls(), 1);

        release.send(()).unwrap();
        let snapshot = first.await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn channel_drives_running_job_to_success() {
        let service = MockService::scripted(vec![Ok(Submission::Accepted {
            message: Some("Prediction queued".into()),
        })]);
        let controller = JobController::new(service);
        let completions = recorder(&controller);

        let snapshot = controller.submit(inference()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.message.as_deref(), Some("Prediction queued"));

        controller.apply_event(&ChannelEvent::Progress(Progress::Percent(50)));
        controller.apply_event(&ChannelEvent::Status("halfway".into()));
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::success()));
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::success()));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, JobStatus::Succeeded);
        assert_eq!(snapshot.progress, Some(Progress::Percent(50)));
        assert_eq!(snapshot.message.as_deref(), Some("halfway"));
        assert!(!snapshot.inputs_locked());

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].source, CompletionSource::Channel);
        assert_eq!(completions[0].descriptors, None);
    }

    #[tokio::test]
    async fn synchronous_comparison_completes_once() {
        let rows = vec![ScoreRow::new("liver", 0.87)];
        let service = MockService::scripted(vec![Ok(Submission::Completed(rows.clone()))]);
        let controller = JobController::new(service);
        let completions = recorder(&controller);

        let snapshot = controller.submit(comparison("s1", "s2")).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Succeeded);

        // A channel echo of the same completion changes nothing.
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::success().with_result(rows.clone())));

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        let completion = &completions[0];
        assert_eq!(completion.kind, JobKind::Comparison);
        assert_eq!(completion.result.as_deref(), Some(rows.as_slice()));
        let [primary, other] = completion.descriptors.clone().unwrap();
        assert_eq!(primary.id.as_str(), "s1");
        assert_eq!(other.id.as_str(), "s2");
    }

    #[tokio::test]
    async fn service_error_message_is_surfaced() {
        let service = MockService::scripted(vec![Err(ServiceCallError::service(
            Some(429),
            "Currently calculating another DICE score. Please wait.",
        ))]);
        let controller = JobController::new(service);
        let completions = recorder(&controller);

        let err = controller.submit(comparison("s1", "s2")).await.unwrap_err();
        assert_eq!(err.to_string(), "Currently calculating another DICE score. Please wait.");

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(
            snapshot.message.as_deref(),
            Some("Currently calculating another DICE score. Please wait.")
        );
        assert!(!completions.lock().unwrap()[0].succeeded);
    }

    #[tokio::test]
    async fn transport_error_gets_generic_message() {
        let service = MockService::scripted(vec![Err(ServiceCallError::Transport("connection refused".into()))]);
        let controller = JobController::new(service);

        assert!(matches!(
            controller.submit(inference()).await,
            Err(JobError::Service(ServiceCallError::Transport(_)))
        ));
        assert_eq!(
            controller.snapshot().message.as_deref(),
            Some("Unable to reach the compute service.")
        );
    }

    #[tokio::test]
    async fn stale_completion_never_touches_newer_generation() {
        let (service, release) = MockService::held(vec![
            Ok(Submission::Completed(vec![ScoreRow::new("liver", 0.1)])),
            Ok(Submission::Accepted { message: None }),
        ]);
        let controller = JobController::new(service.clone());
        let completions = recorder(&controller);

        let abandoned = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.submit(comparison("s1", "s2")).await })
        };
        wait_for_status(&controller, JobStatus::Submitting).await;

        controller.reset();
        let current = controller.submit(inference()).await.unwrap();
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.kind, Some(JobKind::Inference));

        release.send(()).unwrap();
        let late = abandoned.await.unwrap();
        assert!(matches!(late, Err(JobError::Superseded(1))));
        assert_eq!(controller.snapshot().generation, current.generation);
        assert_eq!(controller.snapshot().status, JobStatus::Running);
        assert!(completions.lock().unwrap().is_empty());
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn late_finish_of_abandoned_job_is_discarded() {
        let service = MockService::scripted(vec![]);
        let controller = JobController::new(service);
        let completions = recorder(&controller);

        let abandoned = controller.submit(comparison("s1", "s2")).await.unwrap();
        controller.reset();
        let current = controller.submit(inference()).await.unwrap();
        assert!(current.generation > abandoned.generation);

        // Score rows can only belong to a comparison.
        let scores = JobOutcome::success().with_result(vec![ScoreRow::new("liver", 0.1)]);
        controller.apply_event(&ChannelEvent::JobFinished(scores));
        // Tagged with the abandoned job's id.
        let old_id = abandoned.correlation_id.unwrap().to_string();
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::failure("late").for_job(old_id)));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.kind, Some(JobKind::Inference));
        assert!(completions.lock().unwrap().is_empty());

        let own_id = current.correlation_id.unwrap().to_string();
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::success().for_job(own_id)));
        assert_eq!(controller.snapshot().status, JobStatus::Succeeded);
        assert_eq!(completions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_scores_never_reach_a_newer_comparison() {
        let service = MockService::scripted(vec![]);
        let controller = JobController::new(service);
        let completions = recorder(&controller);

        let abandoned = controller.submit(comparison("s1", "s2")).await.unwrap();
        controller.reset();
        let current = controller.submit(comparison("s1", "s3")).await.unwrap();

        let old_id = abandoned.correlation_id.unwrap().to_string();
        let stale = JobOutcome::success().for_job(old_id).with_result(vec![ScoreRow::new("liver", 0.1)]);
        controller.apply_event(&ChannelEvent::JobFinished(stale));
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::success().for_job("not-a-uuid")));
        assert_eq!(controller.snapshot().status, JobStatus::Running);

        let own_id = current.correlation_id.unwrap().to_string();
        let rows = vec![ScoreRow::new("liver", 0.9)];
        controller.apply_event(&ChannelEvent::JobFinished(
            JobOutcome::success().for_job(own_id).with_result(rows.clone()),
        ));

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result.as_deref(), Some(rows.as_slice()));
        assert_eq!(completions[0].descriptors.as_ref().unwrap()[1].id.as_str(), "s3");
    }

    #[tokio::test]
    async fn channel_finish_before_acknowledgement_wins() {
        let (service, release) = MockService::held(vec![Ok(Submission::Accepted {
            message: Some("Prediction queued".into()),
        })]);
        let controller = JobController::new(service);
        let completions = recorder(&controller);

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.submit(inference()).await })
        };
        wait_for_status(&controller, JobStatus::Submitting).await;

        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::failure("x")));
        assert_eq!(controller.snapshot().status, JobStatus::Failed);

        release.send(()).unwrap();
        let snapshot = pending.await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.message.as_deref(), Some("x"));
        assert_eq!(controller.snapshot().status, JobStatus::Failed);

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].source, CompletionSource::Channel);
    }

    #[tokio::test]
    async fn events_outside_a_running_job_are_ignored() {
        let service = MockService::scripted(vec![]);
        let controller = JobController::new(service);
        let completions = recorder(&controller);

        controller.apply_event(&ChannelEvent::Progress(Progress::Percent(30)));
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::success()));
        assert_eq!(controller.snapshot(), JobSnapshot::default());

        controller.submit(inference()).await.unwrap();
        controller.reset();
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::failure("late")));
        assert_eq!(controller.snapshot().status, JobStatus::Idle);
        assert!(completions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_state_accepts_a_new_submit() {
        let service = MockService::scripted(vec![
            Err(ServiceCallError::service(Some(500), "boom")),
            Ok(Submission::Accepted { message: None }),
        ]);
        let controller = JobController::new(service);

        assert!(controller.submit(inference()).await.is_err());
        let first = controller.snapshot();
        let second = controller.submit(inference()).await.unwrap();
        assert_eq!(second.status, JobStatus::Running);
        assert!(second.generation > first.generation);
        assert_ne!(second.correlation_id, first.correlation_id);
        // A new job starts with a clean status line.
        assert_eq!(second.message, None);
    }

    #[tokio::test]
    async fn comparison_without_scores_fails() {
        let service = MockService::scripted(vec![Ok(Submission::Accepted { message: None })]);
        let controller = JobController::new(service);

        controller.submit(comparison("s1", "s2")).await.unwrap();
        controller.apply_event(&ChannelEvent::JobFinished(JobOutcome::success()));
        assert_eq!(controller.snapshot().status, JobStatus::Failed);
    }
}
