//! Comparison results and the selection rules built on top of them.
//!
//! - [`EvaluationCache`] maps unordered segmentation pairs to the last
//!   comparison computed for them.
//! - [`reconciler`] keeps the primary/comparison selection pointing at
//!   options that still exist.

pub mod cache;
pub mod key;
pub mod reconciler;

pub use cache::{EvaluationCache, EvaluationRecord};
pub use key::EvaluationKey;
pub use reconciler::{reconcile, Reconciliation, SelectionPair};
