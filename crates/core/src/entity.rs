use serde::{Deserialize, Serialize};

/// Opaque segmentation identifier assigned by the viewer, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentationId(String);

impl SegmentationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SegmentationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SegmentationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SegmentationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A segmentation currently loaded in the viewer.
///
/// Owned by the viewer's registry. This crate only reads snapshots of it and
/// never assumes an id survives a removal notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationEntity {
    pub id: SegmentationId,
    pub label: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
}

fn default_visible() -> bool {
    true
}

impl SegmentationEntity {
    pub fn new(id: impl Into<SegmentationId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            is_active: false,
            is_visible: true,
        }
    }

    /// The `{id, label}` option shown in selectors.
    pub fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor {
            id: self.id.clone(),
            label: self.label.clone(),
        }
    }
}

/// `{id, label}` pair describing a segmentation at some point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub id: SegmentationId,
    pub label: String,
}

impl SegmentDescriptor {
    pub fn new(id: impl Into<SegmentationId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}
