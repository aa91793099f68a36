//! Live progress channel between the panel and the compute service.
//!
//! A [`ProgressChannel`] owns one [`EventSource`] for as long as it is open
//! and fans decoded [`ChannelEvent`]s out to per-category subscribers.

pub mod channel;
pub mod error;
pub mod event;
pub mod source;
pub mod sse;

pub use channel::{ProgressChannel, Subscription};
pub use error::ChannelError;
pub use event::{ChannelEvent, EventCategory, JobOutcome, ToastLevel};
pub use source::{EventSource, QueueSource};
pub use sse::SseSource;
