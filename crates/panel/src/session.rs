use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use provisioner_channel::{ChannelEvent, EventCategory, ProgressChannel, Subscription, ToastLevel};
use provisioner_core::{CoreError, ModelInfo, SegmentDescriptor, SegmentationEntity, SegmentationId, SubjectDescriptor};
use provisioner_evaluation::reconciler::{self, Reconciliation, SelectionPair};
use provisioner_evaluation::{EvaluationCache, EvaluationRecord};
use provisioner_jobs::{
    Completion, ComputeService, JobController, JobError, JobKind, JobRequest, JobSnapshot, ServiceCallError,
};

use crate::registry::{RegistryEvent, RegistrySubscription, SegmentationRegistry};

/// How many toast messages the session remembers.
const TOAST_HISTORY: usize = 20;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("selection is locked while a comparison job is in progress")]
    InputsLocked,

    #[error(transparent)]
    Selection(#[from] CoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Toast {
    pub message: String,
    pub level: ToastLevel,
}

/// Cache, registry snapshot and selection. Mutated only under one lock so a
/// reconciliation pass never sees half of a change.
struct View {
    cache: EvaluationCache,
    loaded: Vec<SegmentationEntity>,
    /// Ids reported as permanently removed. A comparison that finishes after
    /// one of its sides was removed is not cached.
    removed: HashSet<SegmentationId>,
    current: Reconciliation,
}

impl View {
    fn reconcile(&mut self) {
        let pass = reconciler::reconcile(&self.current.selection, &self.loaded, &self.cache);
        self.apply(pass);
    }

    fn apply(&mut self, pass: Reconciliation) {
        if pass.changed {
            info!(
                primary = ?pass.selection.primary_id().map(SegmentationId::as_str),
                comparison = ?pass.selection.comparison_id().map(SegmentationId::as_str),
                "selection changed"
            );
        }
        self.current = pass;
    }

    fn descriptor(&self, id: &SegmentationId) -> Option<SegmentDescriptor> {
        self.loaded
            .iter()
            .find(|entity| &entity.id == id)
            .map(SegmentationEntity::descriptor)
            .or_else(|| self.current.available.iter().find(|d| &d.id == id).cloned())
    }
}

struct Shared {
    registry: Arc<dyn SegmentationRegistry>,
    service: Arc<dyn ComputeService>,
    view: Mutex<View>,
    models: Mutex<Vec<ModelInfo>>,
    toasts: Mutex<VecDeque<Toast>>,
    subject: Mutex<SubjectDescriptor>,
}

impl Shared {
    fn view(&self) -> MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_registry_event(&self, event: &RegistryEvent) {
        let mut view = self.view();
        match event {
            RegistryEvent::Removed(id) => {
                view.cache.invalidate(id);
                view.removed.insert(id.clone());
            }
            RegistryEvent::Added(entity) => {
                view.removed.remove(&entity.id);
            }
            RegistryEvent::Updated(_) | RegistryEvent::Unloaded(_) => {}
        }
        view.loaded = self.registry.list();
        view.reconcile();
    }

    fn on_completion(&self, completion: &Completion) {
        if completion.kind != JobKind::Comparison || !completion.succeeded {
            return;
        }
        let (Some([primary, comparison]), Some(result)) = (&completion.descriptors, &completion.result) else {
            return;
        };

        let mut view = self.view();
        if view.removed.contains(&primary.id) || view.removed.contains(&comparison.id) {
            debug!(
                generation = completion.generation,
                "comparison finished for a removed segmentation, result dropped"
            );
            return;
        }
        let record = EvaluationRecord::new(primary.clone(), comparison.clone(), result.clone());
        match view.cache.insert(record) {
            Ok(_) => {
                info!(
                    generation = completion.generation,
                    primary = %primary.id,
                    comparison = %comparison.id,
                    rows = result.len(),
                    "evaluation cached"
                );
                view.reconcile();
            }
            Err(e) => warn!(error = %e, "comparison result not cached"),
        }
    }

    async fn refresh_models(&self) -> Result<Vec<ModelInfo>, ServiceCallError> {
        let models = self.service.list_models().await?;
        info!(count = models.len(), "model list refreshed");
        *self.models.lock().unwrap_or_else(PoisonError::into_inner) = models.clone();
        Ok(models)
    }

    fn push_toast(&self, toast: Toast) {
        let mut toasts = self.toasts.lock().unwrap_or_else(PoisonError::into_inner);
        if toasts.len() == TOAST_HISTORY {
            toasts.pop_front();
        }
        toasts.push_back(toast);
    }
}

/// One mounted comparison panel.
///
/// Mounting subscribes to the registry and the channel; [`PanelSession::unmount`]
/// (or dropping the session) releases both.
pub struct PanelSession {
    shared: Arc<Shared>,
    controller: JobController,
    channel: ProgressChannel,
    channel_subscriptions: Vec<Subscription>,
    registry_subscription: RegistrySubscription,
}

impl PanelSession {
    pub fn mount(
        registry: Arc<dyn SegmentationRegistry>,
        service: Arc<dyn ComputeService>,
        channel: ProgressChannel,
    ) -> Self {
        let shared = Arc::new(Shared {
            registry: Arc::clone(&registry),
            service: Arc::clone(&service),
            view: Mutex::new(View {
                cache: EvaluationCache::new(),
                loaded: Vec::new(),
                removed: HashSet::new(),
                current: Reconciliation::default(),
            }),
            models: Mutex::new(Vec::new()),
            toasts: Mutex::new(VecDeque::new()),
            subject: Mutex::new(SubjectDescriptor::default()),
        });

        // Subscribe before the first snapshot so no change slips between them.
        let weak = Arc::downgrade(&shared);
        let registry_subscription = registry.subscribe(Arc::new(move |event: &RegistryEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_registry_event(event);
            }
        }));
        {
            let mut view = shared.view();
            view.loaded = registry.list();
            view.reconcile();
        }

        let controller = JobController::new(service);
        let weak = Arc::downgrade(&shared);
        controller.on_completion(move |completion| {
            if let Some(shared) = weak.upgrade() {
                shared.on_completion(completion);
            }
        });

        let mut channel_subscriptions = controller.attach(&channel);
        let weak = Arc::downgrade(&shared);
        channel_subscriptions.push(channel.subscribe(EventCategory::ModelListChanged, move |_| {
            let Some(shared) = weak.upgrade() else { return };
            tokio::spawn(async move {
                if let Err(e) = shared.refresh_models().await {
                    warn!(error = %e, "model list refresh failed");
                }
            });
        }));
        let weak = Arc::downgrade(&shared);
        channel_subscriptions.push(channel.subscribe(EventCategory::Toast, move |event| {
            if let (Some(shared), ChannelEvent::Toast { message, level }) = (weak.upgrade(), event) {
                info!(level = ?level, message = %message, "service notification");
                shared.push_toast(Toast {
                    message: message.clone(),
                    level: *level,
                });
            }
        }));

        info!(
            loaded = shared.view().loaded.len(),
            live = channel.is_live(),
            "panel mounted"
        );

        Self {
            shared,
            controller,
            channel,
            channel_subscriptions,
            registry_subscription,
        }
    }

    /// Release the registry listener and the channel transport.
    pub async fn unmount(mut self) {
        self.registry_subscription.unsubscribe();
        self.channel_subscriptions.clear();
        self.channel.close().await;
        info!("panel unmounted");
    }

    // ── Selection ─────────────────────────────────────────────

    pub fn selection(&self) -> SelectionPair {
        self.shared.view().current.selection.clone()
    }

    /// The latest reconciliation: selection plus the option lists to render.
    pub fn reconciliation(&self) -> Reconciliation {
        self.shared.view().current.clone()
    }

    pub fn available(&self) -> Vec<SegmentDescriptor> {
        self.shared.view().current.available.clone()
    }

    pub fn comparable(&self) -> Vec<SegmentDescriptor> {
        self.shared.view().current.comparable.clone()
    }

    /// Whether a cached comparison can be shown for the current selection.
    pub fn can_compare(&self) -> bool {
        self.shared.view().current.can_compare()
    }

    pub fn select_primary(&self, id: &SegmentationId) -> Result<SelectionPair, SessionError> {
        self.ensure_unlocked()?;
        let mut view = self.shared.view();
        let pass = reconciler::select_primary(&view.current.selection, id, &view.loaded, &view.cache)?;
        view.apply(pass);
        Ok(view.current.selection.clone())
    }

    pub fn select_comparison(&self, id: &SegmentationId) -> Result<SelectionPair, SessionError> {
        self.ensure_unlocked()?;
        let mut view = self.shared.view();
        let pass = reconciler::select_comparison(&view.current.selection, id, &view.loaded, &view.cache)?;
        view.apply(pass);
        Ok(view.current.selection.clone())
    }

    fn ensure_unlocked(&self) -> Result<(), SessionError> {
        let job = self.controller.snapshot();
        if job.inputs_locked() && job.kind != Some(JobKind::Inference) {
            return Err(SessionError::InputsLocked);
        }
        Ok(())
    }

    // ── Evaluations ───────────────────────────────────────────

    pub fn evaluation(&self, a: &SegmentationId, b: &SegmentationId) -> Option<EvaluationRecord> {
        self.shared.view().cache.get(a, b).cloned()
    }

    /// The cached evaluation for the current selection, if both sides are chosen.
    pub fn current_evaluation(&self) -> Option<EvaluationRecord> {
        let view = self.shared.view();
        let selection = &view.current.selection;
        let (a, b) = (selection.primary_id()?, selection.comparison_id()?);
        view.cache.get(a, b).cloned()
    }

    pub fn evaluation_count(&self) -> usize {
        self.shared.view().cache.len()
    }

    // ── Jobs ──────────────────────────────────────────────────

    pub fn controller(&self) -> &JobController {
        &self.controller
    }

    pub fn job(&self) -> JobSnapshot {
        self.controller.snapshot()
    }

    pub fn watch_job(&self) -> watch::Receiver<JobSnapshot> {
        self.controller.watch()
    }

    /// Identifiers of the image series jobs run against.
    pub fn set_subject(&self, subject: SubjectDescriptor) {
        *self.shared.subject.lock().unwrap_or_else(PoisonError::into_inner) = subject;
    }

    pub fn subject(&self) -> SubjectDescriptor {
        self.shared.subject.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn submit_inference(&self, model: Option<String>) -> Result<JobSnapshot, JobError> {
        let request = JobRequest::Inference {
            model,
            subject: self.subject(),
        };
        self.controller.submit(request).await
    }

    /// Compare the current primary against `against`.
    pub async fn submit_comparison(&self, against: Option<&SegmentationId>) -> Result<JobSnapshot, JobError> {
        let (primary, comparison) = self.pair_for(against);
        let request = JobRequest::Comparison {
            primary,
            comparison,
            subject: self.subject(),
        };
        self.controller.submit(request).await
    }

    /// Ask the service to build a discrepancy segmentation for the current
    /// primary and `against`. The result arrives as a new segmentation, not
    /// as a cached evaluation.
    pub async fn submit_discrepancy(&self, against: Option<&SegmentationId>) -> Result<JobSnapshot, JobError> {
        let (primary, comparison) = self.pair_for(against);
        let request = JobRequest::Discrepancy {
            primary,
            comparison,
            subject: self.subject(),
        };
        self.controller.submit(request).await
    }

    pub fn reset_job(&self) {
        self.controller.reset();
    }

    fn pair_for(&self, against: Option<&SegmentationId>) -> (Option<SegmentDescriptor>, Option<SegmentDescriptor>) {
        let view = self.shared.view();
        let primary = view.current.selection.primary.clone();
        let comparison = against.and_then(|id| view.descriptor(id));
        (primary, comparison)
    }

    // ── Models & notifications ────────────────────────────────

    pub fn models(&self) -> Vec<ModelInfo> {
        self.shared.models.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn refresh_models(&self) -> Result<Vec<ModelInfo>, ServiceCallError> {
        self.shared.refresh_models().await
    }

    pub async fn is_model_running(&self, model: &str) -> Result<bool, ServiceCallError> {
        self.shared.service.is_model_running(model).await
    }

    pub fn toasts(&self) -> Vec<Toast> {
        self.shared
            .toasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn channel_live(&self) -> bool {
        self.channel.is_live()
    }
}
