use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::event::{ChannelEvent, EventCategory};
use crate::source::EventSource;

type Callback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

struct Entry {
    id: u64,
    category: Option<EventCategory>,
    callback: Callback,
}

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl Subscribers {
    fn add(&self, category: Option<EventCategory>, callback: Callback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry { id, category, callback });
        id
    }

    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.id != id);
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every matching subscriber. Callbacks run outside the
    /// lock so they may subscribe or unsubscribe.
    fn dispatch(&self, event: &ChannelEvent) {
        let category = event.category();
        let targets: Vec<Callback> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.category.map_or(true, |c| c == category))
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        for callback in targets {
            callback(event);
        }
    }
}

/// Handle returned by [`ProgressChannel::subscribe`].
///
/// Dropping the handle unsubscribes. Unsubscribing more than once is a no-op.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(subscribers) = self.subscribers.upgrade() {
                subscribers.remove(self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Push-notification channel for one panel session.
///
/// Events are delivered in arrival order by a single pump task. A channel
/// whose source could not be opened stays usable but never delivers
/// anything; callers fall back to request/response results.
pub struct ProgressChannel {
    subscribers: Arc<Subscribers>,
    live: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl ProgressChannel {
    /// A channel with no transport attached.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Subscribers::default()),
            live: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// A channel pumping events from `source`. Must be called inside a tokio runtime.
    pub fn open<S>(source: S) -> Self
    where
        S: EventSource + 'static,
    {
        let mut channel = Self::new();
        channel.attach(source);
        channel
    }

    /// Start pumping events from `source`, replacing any previous transport.
    pub fn attach<S>(&mut self, source: S)
    where
        S: EventSource + 'static,
    {
        if let Some(previous) = self.pump.take() {
            previous.abort();
        }
        // Fresh flag per transport so a replaced pump cannot clear it.
        self.live = Arc::new(AtomicBool::new(true));
        let subscribers = Arc::clone(&self.subscribers);
        let live = Arc::clone(&self.live);
        self.pump = Some(tokio::spawn(pump(source, subscribers, live)));
    }

    /// Await `connect` and attach the resulting source. A failed connection
    /// is logged and leaves the channel without live updates. Returns
    /// whether the channel is live.
    pub async fn connect<S, F>(&mut self, connect: F) -> bool
    where
        S: EventSource + 'static,
        F: Future<Output = Result<S, ChannelError>>,
    {
        match connect.await {
            Ok(source) => {
                self.attach(source);
                true
            }
            Err(e) => {
                warn!(error = %e, "progress channel unavailable, continuing without live updates");
                false
            }
        }
    }

    /// Register `callback` for events of one category.
    pub fn subscribe<F>(&self, category: EventCategory, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.register(Some(category), Arc::new(callback))
    }

    /// Register `callback` for every event.
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    fn register(&self, category: Option<EventCategory>, callback: Callback) -> Subscription {
        let id = self.subscribers.add(category, callback);
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
            active: AtomicBool::new(true),
        }
    }

    /// Whether a transport is currently delivering events.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stop the pump and release the transport. Returns once the source has
    /// been dropped. Subscriptions stay registered but receive nothing more.
    pub async fn close(&mut self) {
        if let Some(handle) = self.pump.take() {
            handle.abort();
            let _ = handle.await;
            info!("progress channel closed");
        }
        self.live.store(false, Ordering::Release);
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }
}

async fn pump<S: EventSource>(mut source: S, subscribers: Arc<Subscribers>, live: Arc<AtomicBool>) {
    info!(source = source.name(), "progress channel open");
    loop {
        match source.next_event().await {
            Ok(Some(event)) => {
                debug!(category = ?event.category(), "channel event");
                subscribers.dispatch(&event);
            }
            Ok(None) => {
                info!(source = source.name(), "event stream ended");
                break;
            }
            Err(e) => {
                warn!(source = source.name(), error = %e, "event stream failed");
                break;
            }
        }
    }
    live.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use provisioner_core::Progress;
    use tokio::sync::mpsc;

    use super::*;
    use crate::source::QueueSource;

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sender dropped")
    }

    #[tokio::test]
    async fn delivers_by_category_in_order() {
        let (tx, source) = QueueSource::channel(8);
        let channel = ProgressChannel::open(source);
        assert!(channel.is_live());

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let progress_tx = seen_tx.clone();
        let _progress = channel.subscribe(EventCategory::Progress, move |event| {
            let _ = progress_tx.send(event.clone());
        });
        let _status = channel.subscribe(EventCategory::Status, move |event| {
            let _ = seen_tx.send(event.clone());
        });

        tx.send(ChannelEvent::Progress(Progress::Percent(10))).await.unwrap();
        tx.send(ChannelEvent::Toast {
            message: "ignored".into(),
            level: Default::default(),
        })
        .await
        .unwrap();
        tx.send(ChannelEvent::Status("halfway".into())).await.unwrap();
        tx.send(ChannelEvent::Progress(Progress::Percent(90))).await.unwrap();

        assert_eq!(recv(&mut seen).await, ChannelEvent::Progress(Progress::Percent(10)));
        assert_eq!(recv(&mut seen).await, ChannelEvent::Status("halfway".into()));
        assert_eq!(recv(&mut seen).await, ChannelEvent::Progress(Progress::Percent(90)));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (tx, source) = QueueSource::channel(8);
        let channel = ProgressChannel::open(source);

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let first_tx = seen_tx.clone();
        let first = channel.subscribe(EventCategory::Status, move |_| {
            let _ = first_tx.send("first");
        });
        let _second = channel.subscribe(EventCategory::Status, move |_| {
            let _ = seen_tx.send("second");
        });
        assert_eq!(channel.subscriber_count(), 2);

        first.unsubscribe();
        first.unsubscribe();
        drop(first);
        assert_eq!(channel.subscriber_count(), 1);

        tx.send(ChannelEvent::Status("x".into())).await.unwrap();
        assert_eq!(recv(&mut seen).await, "second");
    }

    #[tokio::test]
    async fn close_releases_source() {
        let (tx, source) = QueueSource::channel(8);
        let mut channel = ProgressChannel::open(source);

        channel.close().await;
        assert!(!channel.is_live());
        assert!(tx.is_closed());

        // Closing twice is harmless.
        channel.close().await;
    }

    #[tokio::test]
    async fn failed_connect_yields_offline_channel() {
        let mut channel = ProgressChannel::new();
        let live = channel
            .connect(async { Err::<QueueSource, _>(ChannelError::Unavailable("refused".into())) })
            .await;
        assert!(!live);
        assert!(!channel.is_live());
        let subscription = channel.subscribe(EventCategory::Progress, |_| {});
        assert!(subscription.is_active());
    }

    #[tokio::test]
    async fn attach_after_subscribe_misses_nothing() {
        let mut channel = ProgressChannel::new();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let _sub = channel.subscribe(EventCategory::ModelListChanged, move |event| {
            let _ = seen_tx.send(event.clone());
        });

        let (tx, source) = QueueSource::channel(8);
        tx.send(ChannelEvent::ModelListChanged).await.unwrap();
        channel.attach(source);
        assert_eq!(recv(&mut seen).await, ChannelEvent::ModelListChanged);
    }

    #[tokio::test]
    async fn ended_stream_is_no_longer_live() {
        let (tx, source) = QueueSource::channel(8);
        let channel = ProgressChannel::open(source);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while channel.is_live() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pump did not stop");
    }

    #[tokio::test]
    async fn subscription_outliving_channel_is_inert() {
        let channel = ProgressChannel::new();
        let subscription = channel.subscribe_all(|_| {});
        drop(channel);
        subscription.unsubscribe();
        assert!(!subscription.is_active());
    }
}
