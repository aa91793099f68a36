use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::event::ChannelEvent;

/// Transport that yields decoded events in arrival order.
///
/// `Ok(None)` means the remote side closed the stream. A source is owned by
/// exactly one open channel and is dropped when that channel closes.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, ChannelError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl EventSource for Box<dyn EventSource> {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, ChannelError> {
        (**self).next_event().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// In-process source fed through a tokio mpsc queue.
pub struct QueueSource {
    rx: mpsc::Receiver<ChannelEvent>,
}

impl QueueSource {
    pub fn new(rx: mpsc::Receiver<ChannelEvent>) -> Self {
        Self { rx }
    }

    /// Create a bounded queue and the source that drains it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<ChannelEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl EventSource for QueueSource {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, ChannelError> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        "queue"
    }
}
