use dpl_core::{status_topic, Service, StatusEvent};
use std::collections::{BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError, RwLock,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{EventChannel, EventHandler};

/// Receives events delivered on an active subscription.
pub trait EventRouter: Send + Sync + 'static {
    fn route(&self, target: &TopicTarget, event: StatusEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTarget {
    pub topic: String,
    pub service_id: String,
    pub deployment_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    /// Kept topics whose deployment moved to another service.
    pub retargeted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty() && self.retargeted.is_empty()
    }
}

/// Routing target shared between the manager and the topic's handler, so
/// ownership can move without touching the transport subscription.
type SharedTarget = Arc<RwLock<TopicTarget>>;

fn current_target(target: &SharedTarget) -> TopicTarget {
    target
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Dropping it stops the subscription task, which then cancels at the
/// transport (immediately, if `subscribe` has not completed yet).
struct ActiveSubscription {
    target: SharedTarget,
    stop: watch::Sender<bool>,
    joined: Arc<AtomicBool>,
}

impl ActiveSubscription {
    /// Returns the previous owner when it differs from `desired`.
    fn retarget(&self, desired: TopicTarget) -> Option<String> {
        let mut target = self.target.write().unwrap_or_else(PoisonError::into_inner);
        if *target == desired {
            return None;
        }
        let previous = std::mem::replace(&mut *target, desired);
        Some(previous.service_id)
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

/// Keeps the transport's subscriptions equal to the topics derived from the
/// tracked services. Must be used from within a Tokio runtime.
pub struct SubscriptionManager {
    channel: Arc<dyn EventChannel>,
    router: Arc<dyn EventRouter>,
    active: HashMap<String, ActiveSubscription>,
    shut_down: bool,
}

impl SubscriptionManager {
    pub fn new(channel: Arc<dyn EventChannel>, router: Arc<dyn EventRouter>) -> Self {
        Self {
            channel,
            router,
            active: HashMap::new(),
            shut_down: false,
        }
    }

    /// Subscribes new topics and cancels stale ones without waiting for the
    /// transport. Topics that stay wanted keep their subscription; if their
    /// deployment now belongs to another service, events route to it.
    pub fn reconcile(&mut self, services: &[Service]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.shut_down {
            warn!(event = "sync_reconcile_after_shutdown", services = services.len());
            return report;
        }

        let desired = desired_targets(services);

        let stale = self
            .active
            .keys()
            .filter(|topic| !desired.contains_key(*topic))
            .cloned()
            .collect::<Vec<_>>();
        for topic in stale {
            if let Some(subscription) = self.active.remove(&topic) {
                info!(
                    event = "sync_unsubscribe",
                    topic = %topic,
                    service_id = %current_target(&subscription.target).service_id,
                );
                report.unsubscribed.push(topic);
            }
        }

        for (topic, target) in desired {
            if let Some(subscription) = self.active.get(&topic) {
                let service_id = target.service_id.clone();
                if let Some(previous) = subscription.retarget(target) {
                    info!(
                        event = "sync_owner_changed",
                        topic = %topic,
                        from_service_id = %previous,
                        service_id = %service_id,
                    );
                    report.retargeted.push(topic);
                }
                continue;
            }
            info!(
                event = "sync_subscribe",
                topic = %topic,
                service_id = %target.service_id,
            );
            let subscription = self.start(target);
            self.active.insert(topic.clone(), subscription);
            report.subscribed.push(topic);
        }

        report.subscribed.sort();
        report.unsubscribed.sort();
        report.retargeted.sort();
        report
    }

    /// Re-issues every active subscription after the transport reconnects.
    /// The logical topic set is unchanged.
    pub fn rejoin(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        let targets = self
            .active
            .drain()
            .map(|(topic, subscription)| (topic, current_target(&subscription.target)))
            .collect::<Vec<_>>();
        let count = targets.len();
        for (topic, target) in targets {
            let subscription = self.start(target);
            self.active.insert(topic, subscription);
        }
        info!(event = "sync_rejoin", topics = count);
        count
    }

    /// Cancels everything, including subscribes still in flight. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.shut_down {
            info!(event = "sync_shutdown", topics = self.active.len());
        }
        self.shut_down = true;
        self.active.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn active_topics(&self) -> BTreeSet<String> {
        self.active.keys().cloned().collect()
    }

    /// True once the transport acknowledged every active subscription.
    pub fn all_joined(&self) -> bool {
        self.active
            .values()
            .all(|subscription| subscription.joined.load(Ordering::SeqCst))
    }

    fn start(&self, target: TopicTarget) -> ActiveSubscription {
        let (stop_tx, stop_rx) = watch::channel(false);
        let topic = target.topic.clone();
        let target: SharedTarget = Arc::new(RwLock::new(target));
        let joined = Arc::new(AtomicBool::new(false));

        let handler: EventHandler = {
            let router = Arc::clone(&self.router);
            let target = Arc::clone(&target);
            let stop_rx = stop_rx.clone();
            Arc::new(move |event: StatusEvent| {
                let target = current_target(&target);
                if *stop_rx.borrow() {
                    debug!(
                        event = "sync_event_dropped",
                        reason = "inactive_subscription",
                        topic = %target.topic,
                        deployment_id = %event.deployment_id,
                    );
                    return;
                }
                router.route(&target, event);
            })
        };

        tokio::spawn(run_subscription(
            Arc::clone(&self.channel),
            topic,
            handler,
            stop_rx,
            Arc::clone(&joined),
        ));

        ActiveSubscription {
            target,
            stop: stop_tx,
            joined,
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_subscription(
    channel: Arc<dyn EventChannel>,
    topic: String,
    handler: EventHandler,
    mut stop: watch::Receiver<bool>,
    joined: Arc<AtomicBool>,
) {
    let cancel = channel.subscribe(&topic, handler).await;
    if *stop.borrow() {
        cancel();
        info!(event = "sync_subscribe_cancelled", topic = %topic);
        return;
    }
    joined.store(true, Ordering::SeqCst);
    debug!(event = "sync_subscribed", topic = %topic);

    loop {
        if *stop.borrow_and_update() {
            break;
        }
        if stop.changed().await.is_err() {
            break;
        }
    }
    cancel();
    debug!(event = "sync_unsubscribed", topic = %topic);
}

fn desired_targets(services: &[Service]) -> HashMap<String, TopicTarget> {
    let mut desired: HashMap<String, TopicTarget> = HashMap::new();
    for service in services {
        let Some(deployment_id) = service.latest_deployment_id.as_deref() else {
            continue;
        };
        let topic = status_topic(deployment_id);
        if let Some(existing) = desired.get(&topic) {
            warn!(
                event = "sync_duplicate_deployment",
                topic = %topic,
                kept_service_id = %existing.service_id,
                skipped_service_id = %service.id,
            );
            continue;
        }
        desired.insert(
            topic.clone(),
            TopicTarget {
                topic,
                service_id: service.id.clone(),
                deployment_id: deployment_id.to_string(),
            },
        );
    }
    desired
}
