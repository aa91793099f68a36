//! Composition root for one segmentation-comparison panel.
//!
//! A [`PanelSession`] wires the external segmentation registry, the
//! evaluation cache, the progress channel and the job controller together,
//! and keeps the `[primary, comparison]` selection valid as any of them change.

pub mod registry;
pub mod session;

pub use registry::{InMemoryRegistry, RegistryEvent, RegistryListener, RegistrySubscription, SegmentationRegistry};
pub use session::{PanelSession, SessionError, Toast};
