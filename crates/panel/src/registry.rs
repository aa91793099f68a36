use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;
use tracing::debug;

use provisioner_core::{SegmentationEntity, SegmentationId};

/// Change notification from the viewer's segmentation registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(SegmentationEntity),
    /// Deleted for good. Evaluations that reference it are no longer valid.
    Removed(SegmentationId),
    Updated(SegmentationEntity),
    /// Dropped from the viewer but not deleted. Its evaluations stay reviewable.
    Unloaded(SegmentationId),
}

impl RegistryEvent {
    pub fn id(&self) -> &SegmentationId {
        match self {
            RegistryEvent::Added(entity) | RegistryEvent::Updated(entity) => &entity.id,
            RegistryEvent::Removed(id) | RegistryEvent::Unloaded(id) => id,
        }
    }
}

pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Handle for a registry listener. Unsubscribes on drop; repeated calls are no-ops.
pub struct RegistrySubscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RegistrySubscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl Drop for RegistrySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Segmentations currently known to the viewer.
pub trait SegmentationRegistry: Send + Sync {
    /// Loaded segmentations in viewer order.
    fn list(&self) -> Vec<SegmentationEntity>;

    /// Listeners run after the registry has applied the change, so `list()`
    /// inside a listener already reflects it.
    fn subscribe(&self, listener: RegistryListener) -> RegistrySubscription;
}

type Listeners = Mutex<Vec<(u64, RegistryListener)>>;

/// Registry held in process memory, for headless use and tests.
#[derive(Default)]
pub struct InMemoryRegistry {
    entities: Mutex<IndexMap<SegmentationId, SegmentationEntity>>,
    listeners: Arc<Listeners>,
    next_listener: Mutex<u64>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = SegmentationEntity>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.entities.lock().unwrap_or_else(PoisonError::into_inner);
            for entity in entities {
                map.insert(entity.id.clone(), entity);
            }
        }
        registry
    }

    /// Add a segmentation. An existing id is treated as an update.
    pub fn add(&self, entity: SegmentationEntity) {
        let previous = self
            .entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.id.clone(), entity.clone());
        let event = if previous.is_some() {
            RegistryEvent::Updated(entity)
        } else {
            RegistryEvent::Added(entity)
        };
        self.emit(event);
    }

    /// Replace a known segmentation. Returns false for unknown ids.
    pub fn update(&self, entity: SegmentationEntity) -> bool {
        {
            let mut map = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get_mut(&entity.id) {
                Some(slot) => *slot = entity.clone(),
                None => return false,
            }
        }
        self.emit(RegistryEvent::Updated(entity));
        true
    }

    /// Delete a segmentation permanently.
    pub fn remove(&self, id: &SegmentationId) -> Option<SegmentationEntity> {
        let removed = self.take(id)?;
        self.emit(RegistryEvent::Removed(id.clone()));
        Some(removed)
    }

    /// Drop a segmentation from the viewer without deleting it.
    pub fn unload(&self, id: &SegmentationId) -> Option<SegmentationEntity> {
        let removed = self.take(id)?;
        self.emit(RegistryEvent::Unloaded(id.clone()));
        Some(removed)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take(&self, id: &SegmentationId) -> Option<SegmentationEntity> {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(id)
    }

    fn emit(&self, event: RegistryEvent) {
        let listeners: Vec<RegistryListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        debug!(segmentation = %event.id(), listeners = listeners.len(), "registry change");
        for listener in listeners {
            listener(&event);
        }
    }
}

impl SegmentationRegistry for InMemoryRegistry {
    fn list(&self) -> Vec<SegmentationEntity> {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn subscribe(&self, listener: RegistryListener) -> RegistrySubscription {
        let id = {
            let mut next = self.next_listener.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));

        let listeners = Arc::downgrade(&self.listeners);
        RegistrySubscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(existing, _)| *existing != id);
            }
        })
    }
}
