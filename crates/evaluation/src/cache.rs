//! Session-lifetime store of comparison results keyed by unordered segmentation pairs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use provisioner_core::{CoreError, ScoreRow, SegmentDescriptor, SegmentationId};

use crate::key::EvaluationKey;

/// Snapshot of a finished comparison.
///
/// Descriptors are captured when the comparison was submitted, in
/// `[primary, comparison]` order, and are not refreshed when the live
/// segmentation is renamed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRecord {
    descriptors: [SegmentDescriptor; 2],
    result: Vec<ScoreRow>,
    evaluated_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(primary: SegmentDescriptor, comparison: SegmentDescriptor, result: Vec<ScoreRow>) -> Self {
        Self {
            descriptors: [primary, comparison],
            result,
            evaluated_at: Utc::now(),
        }
    }

    pub fn descriptors(&self) -> &[SegmentDescriptor; 2] {
        &self.descriptors
    }

    pub fn primary(&self) -> &SegmentDescriptor {
        &self.descriptors[0]
    }

    pub fn comparison(&self) -> &SegmentDescriptor {
        &self.descriptors[1]
    }

    pub fn result(&self) -> &[ScoreRow] {
        &self.result
    }

    pub fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }

    /// The descriptor on the other side of the comparison from `id`.
    pub fn counterpart_of(&self, id: &SegmentationId) -> Option<&SegmentDescriptor> {
        let [a, b] = &self.descriptors;
        if &a.id == id {
            Some(b)
        } else if &b.id == id {
            Some(a)
        } else {
            None
        }
    }

    fn key(&self) -> Result<EvaluationKey, CoreError> {
        EvaluationKey::new(&self.descriptors[0].id, &self.descriptors[1].id)
    }
}

/// Comparison results for the lifetime of a panel session.
///
/// Iteration order is write order: overwriting a pair moves it to the end,
/// so every derived listing is deterministic.
#[derive(Debug, Default, Clone)]
pub struct EvaluationCache {
    records: IndexMap<EvaluationKey, EvaluationRecord>,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` under the unordered pair `(a, b)`, replacing any previous
    /// record for that pair. Returns the replaced record.
    pub fn put(
        &mut self,
        a: &SegmentationId,
        b: &SegmentationId,
        record: EvaluationRecord,
    ) -> Result<Option<EvaluationRecord>, CoreError> {
        let key = EvaluationKey::new(a, b)?;
        if record.key()? != key {
            return Err(CoreError::RecordMismatch(key.to_string()));
        }
        let previous = self.records.shift_remove(&key);
        debug!(pair = %key, rows = record.result.len(), replaced = previous.is_some(), "evaluation stored");
        self.records.insert(key, record);
        Ok(previous)
    }

    /// Store a record under the pair named by its own descriptors.
    pub fn insert(&mut self, record: EvaluationRecord) -> Result<Option<EvaluationRecord>, CoreError> {
        let a = record.primary().id.clone();
        let b = record.comparison().id.clone();
        self.put(&a, &b, record)
    }

    /// Look up the record for `(a, b)` in either argument order.
    pub fn get(&self, a: &SegmentationId, b: &SegmentationId) -> Option<&EvaluationRecord> {
        let key = EvaluationKey::new(a, b).ok()?;
        self.records.get(&key)
    }

    /// Drop every record that references `id`. Returns how many were removed.
    pub fn invalidate(&mut self, id: &SegmentationId) -> usize {
        let before = self.records.len();
        self.records.retain(|key, _| !key.contains(id));
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(segmentation = %id, removed, "evaluations invalidated");
        }
        removed
    }

    /// Descriptors that have at least one cached record paired with `id`.
    pub fn options_comparable_with(
        &self,
        id: &SegmentationId,
    ) -> impl Iterator<Item = &SegmentDescriptor> + '_ {
        let id = id.clone();
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter_map(move |(key, record)| {
                if key.contains(&id) {
                    record.counterpart_of(&id)
                } else {
                    None
                }
            })
            .filter(move |descriptor| seen.insert(descriptor.id.clone()))
    }

    /// The primary descriptor of every cached record, deduplicated by id.
    pub fn primary_descriptors(&self) -> impl Iterator<Item = &SegmentDescriptor> + '_ {
        let mut seen = HashSet::new();
        self.records
            .values()
            .map(EvaluationRecord::primary)
            .filter(move |descriptor| seen.insert(descriptor.id.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EvaluationKey, &EvaluationRecord)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
