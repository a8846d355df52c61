use async_trait::async_trait;
use dpl_core::{wire::FeedFrame, StatusEvent};
use dpl_sync::{Cancel, Connectivity, EventChannel, EventHandler};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod feed;

pub use feed::FeedReader;

type TopicMap = HashMap<String, BTreeMap<u64, EventHandler>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub delivered: u64,
}

/// In-process topic broker. Handlers of a topic run inline on the publishing
/// task, in subscription order. Disconnecting drops every registration, the
/// way a broker forgets a client whose socket closed.
pub struct LocalHub {
    next_id: AtomicU64,
    topics: Arc<RwLock<TopicMap>>,
    connectivity: watch::Sender<Connectivity>,
    subscribe_delay: Option<Duration>,
    subscribes: AtomicU64,
    unsubscribes: Arc<AtomicU64>,
    delivered: AtomicU64,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        let (connectivity, _) = watch::channel(Connectivity {
            connected: true,
            session: 1,
        });
        Self {
            next_id: AtomicU64::new(0),
            topics: Arc::new(RwLock::new(HashMap::new())),
            connectivity,
            subscribe_delay: None,
            subscribes: AtomicU64::new(0),
            unsubscribes: Arc::new(AtomicU64::new(0)),
            delivered: AtomicU64::new(0),
        }
    }

    /// Simulates the broker round trip before a subscription takes effect.
    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    pub fn publish(&self, event: StatusEvent) -> usize {
        let topic = event.topic();
        self.publish_to(&topic, event)
    }

    /// Returns how many handlers saw the event.
    pub fn publish_to(&self, topic: &str, event: StatusEvent) -> usize {
        if !self.connectivity.borrow().connected {
            debug!(event = "hub_publish_dropped", reason = "disconnected", topic = %topic);
            return 0;
        }
        let handlers = read_topics(&self.topics)
            .get(topic)
            .map(|handlers| handlers.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event = "hub_publish_unrouted", topic = %topic);
            return 0;
        }
        for handler in &handlers {
            handler(event.clone());
        }
        self.delivered
            .fetch_add(handlers.len() as u64, Ordering::SeqCst);
        handlers.len()
    }

    pub fn apply_frame(&self, frame: FeedFrame) -> usize {
        match frame {
            FeedFrame::Event(event) => self.publish(event),
            FeedFrame::Connectivity { connected: true } => {
                self.reconnect();
                0
            }
            FeedFrame::Connectivity { connected: false } => {
                self.disconnect();
                0
            }
        }
    }

    pub fn disconnect(&self) {
        let changed = self.connectivity.send_if_modified(|state| {
            if !state.connected {
                return false;
            }
            state.connected = false;
            true
        });
        if changed {
            let dropped = {
                let mut topics = write_topics(&self.topics);
                let dropped = topics.values().map(BTreeMap::len).sum::<usize>();
                topics.clear();
                dropped
            };
            warn!(event = "hub_disconnected", dropped_subscriptions = dropped);
        }
    }

    /// Returns the current session.
    pub fn reconnect(&self) -> u64 {
        self.connectivity.send_if_modified(|state| {
            if state.connected {
                return false;
            }
            state.connected = true;
            state.session += 1;
            true
        });
        let session = self.connectivity.borrow().session;
        info!(event = "hub_connected", session = session);
        session
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        read_topics(&self.topics)
            .get(topic)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics = read_topics(&self.topics)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        topics.sort();
        topics
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribes: self.subscribes.load(Ordering::SeqCst),
            unsubscribes: self.unsubscribes.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl EventChannel for LocalHub {
    async fn subscribe(&self, topic: &str, handler: EventHandler) -> Cancel {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if self.connectivity.borrow().connected {
            write_topics(&self.topics)
                .entry(topic.to_string())
                .or_default()
                .insert(id, handler);
            debug!(event = "hub_subscribe", topic = %topic, id = id);
        } else {
            debug!(event = "hub_subscribe_while_disconnected", topic = %topic, id = id);
        }

        let topics = Arc::clone(&self.topics);
        let unsubscribes = Arc::clone(&self.unsubscribes);
        let topic = topic.to_string();
        Box::new(move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
            let mut topics = write_topics(&topics);
            if let Some(handlers) = topics.get_mut(&topic) {
                handlers.remove(&id);
                if handlers.is_empty() {
                    topics.remove(&topic);
                }
            }
            debug!(event = "hub_unsubscribe", topic = %topic, id = id);
        })
    }

    fn is_connected(&self) -> bool {
        self.connectivity.borrow().connected
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }
}

fn read_topics(topics: &RwLock<TopicMap>) -> RwLockReadGuard<'_, TopicMap> {
    topics.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_topics(topics: &RwLock<TopicMap>) -> RwLockWriteGuard<'_, TopicMap> {
    topics.write().unwrap_or_else(PoisonError::into_inner)
}
