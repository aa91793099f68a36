use provisioner_core::{CoreError, SegmentationId};

/// Canonical unordered pair of segmentation ids.
///
/// The ids are stored sorted, so `(a, b)` and `(b, a)` produce equal keys.
/// A segmentation is never paired with itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvaluationKey {
    low: SegmentationId,
    high: SegmentationId,
}

impl EvaluationKey {
    pub fn new(a: &SegmentationId, b: &SegmentationId) -> Result<Self, CoreError> {
        if a == b {
            return Err(CoreError::SelfComparison(a.to_string()));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self {
            low: low.clone(),
            high: high.clone(),
        })
    }

    pub fn contains(&self, id: &SegmentationId) -> bool {
        &self.low == id || &self.high == id
    }

    /// The other member of the pair, if `id` is one of them.
    pub fn other(&self, id: &SegmentationId) -> Option<&SegmentationId> {
        if &self.low == id {
            Some(&self.high)
        } else if &self.high == id {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn ids(&self) -> (&SegmentationId, &SegmentationId) {
        (&self.low, &self.high)
    }
}

impl std::fmt::Display for EvaluationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}
