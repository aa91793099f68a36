//! Keeps the `[primary, comparison]` selection valid as segmentations and
//! cached evaluations come and go.
//!
//! Everything here is a pure function of the current selection, the latest
//! registry snapshot, and the cache. Running a pass twice over the same
//! inputs yields the same selection.

use std::collections::HashSet;

use serde::Serialize;

use provisioner_core::{CoreError, SegmentDescriptor, SegmentationEntity, SegmentationId};

use crate::cache::EvaluationCache;

/// The user's current primary and comparison choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionPair {
    pub primary: Option<SegmentDescriptor>,
    pub comparison: Option<SegmentDescriptor>,
}

impl SelectionPair {
    pub fn new(primary: Option<SegmentDescriptor>, comparison: Option<SegmentDescriptor>) -> Self {
        Self { primary, comparison }
    }

    pub fn primary_id(&self) -> Option<&SegmentationId> {
        self.primary.as_ref().map(|d| &d.id)
    }

    pub fn comparison_id(&self) -> Option<&SegmentationId> {
        self.comparison.as_ref().map(|d| &d.id)
    }
}

/// Outcome of one reconciliation pass, including the option lists the
/// selectors should render.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    pub selection: SelectionPair,
    pub available: Vec<SegmentDescriptor>,
    pub comparable: Vec<SegmentDescriptor>,
    /// Whether `selection` differs from the selection the pass started from.
    pub changed: bool,
}

impl Reconciliation {
    /// A comparison can only be reviewed or requested with both sides chosen.
    pub fn can_compare(&self) -> bool {
        self.selection.primary.is_some() && self.selection.comparison.is_some()
    }
}

/// Loaded segmentations in registry order, then primaries of cached
/// evaluations whose segmentation is no longer loaded.
pub fn available_options(loaded: &[SegmentationEntity], cache: &EvaluationCache) -> Vec<SegmentDescriptor> {
    let mut seen = HashSet::new();
    loaded
        .iter()
        .map(SegmentationEntity::descriptor)
        .chain(cache.primary_descriptors().cloned())
        .filter(|descriptor| seen.insert(descriptor.id.clone()))
        .collect()
}

/// Options that have a cached evaluation paired with `primary`.
pub fn comparable_options(primary: Option<&SegmentationId>, cache: &EvaluationCache) -> Vec<SegmentDescriptor> {
    match primary {
        Some(id) => cache.options_comparable_with(id).cloned().collect(),
        None => Vec::new(),
    }
}

fn find(options: &[SegmentDescriptor], id: Option<&SegmentationId>) -> Option<SegmentDescriptor> {
    let id = id?;
    options.iter().find(|d| &d.id == id).cloned()
}

/// Repair `current` against the latest snapshot.
///
/// 1. A primary that is no longer available falls back to the first available option.
/// 2. A comparison that is not comparable with the primary falls back to the
///    first comparable option. A primary change always re-derives it.
/// 3. No primary means no comparison.
pub fn reconcile(current: &SelectionPair, loaded: &[SegmentationEntity], cache: &EvaluationCache) -> Reconciliation {
    let available = available_options(loaded, cache);
    let primary = find(&available, current.primary_id()).or_else(|| available.first().cloned());
    let primary_changed = primary.as_ref().map(|d| &d.id) != current.primary_id();
    derive(current, primary, primary_changed, available, cache)
}

/// Make `id` the primary selection. Fails if `id` is not an available option.
pub fn select_primary(
    current: &SelectionPair,
    id: &SegmentationId,
    loaded: &[SegmentationEntity],
    cache: &EvaluationCache,
) -> Result<Reconciliation, CoreError> {
    let available = available_options(loaded, cache);
    let primary = find(&available, Some(id)).ok_or_else(|| CoreError::NotSelectable(id.to_string()))?;
    let primary_changed = Some(id) != current.primary_id();
    Ok(derive(current, Some(primary), primary_changed, available, cache))
}

/// Make `id` the comparison selection. Fails unless a cached evaluation pairs
/// it with the current primary.
pub fn select_comparison(
    current: &SelectionPair,
    id: &SegmentationId,
    loaded: &[SegmentationEntity],
    cache: &EvaluationCache,
) -> Result<Reconciliation, CoreError> {
    let mut pass = reconcile(current, loaded, cache);
    let comparison = find(&pass.comparable, Some(id)).ok_or_else(|| CoreError::NotSelectable(id.to_string()))?;
    pass.selection.comparison = Some(comparison);
    pass.changed = &pass.selection != current;
    Ok(pass)
}

fn derive(
    current: &SelectionPair,
    primary: Option<SegmentDescriptor>,
    primary_changed: bool,
    available: Vec<SegmentDescriptor>,
    cache: &EvaluationCache,
) -> Reconciliation {
    let comparable = comparable_options(primary.as_ref().map(|d| &d.id), cache);
    let comparison = if primary.is_none() {
        None
    } else if primary_changed {
        comparable.first().cloned()
    } else {
        find(&comparable, current.comparison_id()).or_else(|| comparable.first().cloned())
    };

    let selection = SelectionPair { primary, comparison };
    let changed = &selection != current;
    Reconciliation {
        selection,
        available,
        comparable,
        changed,
    }
}
