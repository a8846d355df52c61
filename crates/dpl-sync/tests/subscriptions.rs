use async_trait::async_trait;
use dpl_core::{Service, StatusEvent};
use dpl_sync::{
    Cancel, Connectivity, EventChannel, EventHandler, EventRouter, ReconcileReport,
    SubscriptionManager, TopicTarget,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct ChannelLog {
    subscribes: Vec<String>,
    cancels: Vec<String>,
    handlers: Vec<(String, EventHandler)>,
}

/// Records every subscribe and cancel. While the gate is closed, `subscribe`
/// does not return.
struct RecordingChannel {
    log: Arc<Mutex<ChannelLog>>,
    gate: watch::Receiver<bool>,
    connectivity: watch::Sender<Connectivity>,
}

impl RecordingChannel {
    fn open() -> (Arc<Self>, watch::Sender<bool>) {
        Self::with_gate(true)
    }

    fn gated() -> (Arc<Self>, watch::Sender<bool>) {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> (Arc<Self>, watch::Sender<bool>) {
        let (gate_tx, gate) = watch::channel(open);
        let (connectivity, _) = watch::channel(Connectivity {
            connected: true,
            session: 1,
        });
        let channel = Arc::new(Self {
            log: Arc::new(Mutex::new(ChannelLog::default())),
            gate,
            connectivity,
        });
        (channel, gate_tx)
    }

    fn subscribes(&self) -> Vec<String> {
        self.log.lock().unwrap().subscribes.clone()
    }

    fn cancels(&self) -> Vec<String> {
        self.log.lock().unwrap().cancels.clone()
    }

    /// Every handler ever registered for `topic`, cancelled or not.
    fn handlers_for(&self, topic: &str) -> Vec<EventHandler> {
        self.log
            .lock()
            .unwrap()
            .handlers
            .iter()
            .filter(|(registered, _)| registered == topic)
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

#[async_trait]
impl EventChannel for RecordingChannel {
    async fn subscribe(&self, topic: &str, handler: EventHandler) -> Cancel {
        let mut gate = self.gate.clone();
        loop {
            if *gate.borrow_and_update() {
                break;
            }
            if gate.changed().await.is_err() {
                break;
            }
        }
        {
            let mut log = self.log.lock().unwrap();
            log.subscribes.push(topic.to_string());
            log.handlers.push((topic.to_string(), handler));
        }
        let log = Arc::clone(&self.log);
        let topic = topic.to_string();
        Box::new(move || log.lock().unwrap().cancels.push(topic))
    }

    fn is_connected(&self) -> bool {
        self.connectivity.borrow().connected
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }
}

#[derive(Default)]
struct RecordingRouter {
    routed: Mutex<Vec<(String, String)>>,
}

impl RecordingRouter {
    fn routed(&self) -> Vec<(String, String)> {
        self.routed.lock().unwrap().clone()
    }
}

impl EventRouter for RecordingRouter {
    fn route(&self, target: &TopicTarget, event: StatusEvent) {
        self.routed
            .lock()
            .unwrap()
            .push((target.service_id.clone(), event.status));
    }
}

fn service(id: &str, deployment_id: Option<&str>) -> Service {
    Service {
        id: id.to_string(),
        name: format!("svc-{id}"),
        port: None,
        branch: None,
        latest_deployment_id: deployment_id.map(str::to_string),
        current_status: None,
    }
}

fn manager(channel: &Arc<RecordingChannel>) -> (SubscriptionManager, Arc<RecordingRouter>) {
    let router = Arc::new(RecordingRouter::default());
    let manager = SubscriptionManager::new(channel.clone(), router.clone());
    (manager, router)
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconcile_only_touches_changed_topics() {
    let (channel, _gate) = RecordingChannel::open();
    let (mut manager, _router) = manager(&channel);

    let first = manager.reconcile(&[service("1", Some("d1")), service("2", Some("d2"))]);
    assert_eq!(
        first,
        ReconcileReport {
            subscribed: vec![
                "deployment:d1:status".to_string(),
                "deployment:d2:status".to_string(),
            ],
            unsubscribed: vec![],
            retargeted: vec![],
        }
    );
    assert!(wait_for(|| manager.all_joined()).await);

    let second = manager.reconcile(&[service("1", Some("d1")), service("2", Some("d3"))]);
    assert_eq!(second.subscribed, vec!["deployment:d3:status"]);
    assert_eq!(second.unsubscribed, vec!["deployment:d2:status"]);
    assert!(wait_for(|| channel.subscribes().len() == 3 && channel.cancels().len() == 1).await);
    assert_eq!(channel.cancels(), vec!["deployment:d2:status"]);

    let third = manager.reconcile(&[service("1", Some("d1")), service("2", Some("d3"))]);
    assert!(third.is_noop());
    assert_eq!(
        manager.active_topics().into_iter().collect::<Vec<_>>(),
        vec!["deployment:d1:status", "deployment:d3:status"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_completing_after_shutdown_is_cancelled() {
    let (channel, gate) = RecordingChannel::gated();
    let (mut manager, router) = manager(&channel);

    manager.reconcile(&[service("1", Some("d1"))]);
    assert!(!manager.all_joined());
    manager.shutdown();
    assert!(channel.subscribes().is_empty());

    gate.send_replace(true);
    assert!(wait_for(|| channel.cancels().len() == 1).await);
    assert_eq!(channel.subscribes(), vec!["deployment:d1:status"]);

    for handler in channel.handlers_for("deployment:d1:status") {
        handler(StatusEvent::new("d1", "live"));
    }
    assert!(router.routed().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_delivery_on_removed_subscription_is_dropped() {
    let (channel, _gate) = RecordingChannel::open();
    let (mut manager, router) = manager(&channel);

    manager.reconcile(&[service("1", Some("d1"))]);
    assert!(wait_for(|| manager.all_joined()).await);
    let handlers = channel.handlers_for("deployment:d1:status");
    assert_eq!(handlers.len(), 1);

    handlers[0](StatusEvent::new("d1", "building"));
    manager.reconcile(&[]);
    handlers[0](StatusEvent::new("d1", "live"));

    assert_eq!(
        router.routed(),
        vec![("1".to_string(), "building".to_string())]
    );
    assert!(wait_for(|| channel.cancels().len() == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_route_in_delivery_order() {
    let (channel, _gate) = RecordingChannel::open();
    let (mut manager, router) = manager(&channel);

    manager.reconcile(&[service("7", Some("d7"))]);
    assert!(wait_for(|| manager.all_joined()).await);
    let handler = channel.handlers_for("deployment:d7:status").remove(0);
    for status in ["building", "live", "live", "failed"] {
        handler(StatusEvent::new("d7", status));
    }

    let statuses = router
        .routed()
        .into_iter()
        .map(|(_, status)| status)
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec!["building", "live", "live", "failed"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejoin_reissues_active_topics() {
    let (channel, _gate) = RecordingChannel::open();
    let (mut manager, router) = manager(&channel);

    manager.reconcile(&[service("1", Some("d1")), service("2", None)]);
    assert!(wait_for(|| manager.all_joined()).await);

    assert_eq!(manager.rejoin(), 1);
    assert!(wait_for(|| channel.subscribes().len() == 2 && manager.all_joined()).await);
    assert!(wait_for(|| channel.cancels().len() == 1).await);

    let handlers = channel.handlers_for("deployment:d1:status");
    handlers[0](StatusEvent::new("d1", "live"));
    handlers[1](StatusEvent::new("d1", "failed"));
    assert_eq!(
        router.routed(),
        vec![("1".to_string(), "failed".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent_and_blocks_later_reconciles() {
    let (channel, _gate) = RecordingChannel::open();
    let (mut manager, _router) = manager(&channel);

    manager.reconcile(&[service("1", Some("d1")), service("2", Some("d2"))]);
    assert!(wait_for(|| manager.all_joined()).await);

    manager.shutdown();
    manager.shutdown();
    assert!(manager.is_shut_down());
    assert!(manager.active_topics().is_empty());
    assert!(wait_for(|| channel.cancels().len() == 2).await);

    assert!(manager.reconcile(&[service("3", Some("d3"))]).is_noop());
    assert_eq!(manager.rejoin(), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(channel.subscribes().len(), 2);
    assert_eq!(channel.cancels().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kept_topic_routes_to_its_new_owner() {
    let (channel, _gate) = RecordingChannel::open();
    let (mut manager, router) = manager(&channel);

    manager.reconcile(&[service("1", Some("d1"))]);
    assert!(wait_for(|| manager.all_joined()).await);

    let report = manager.reconcile(&[service("2", Some("d1"))]);
    assert!(report.subscribed.is_empty());
    assert!(report.unsubscribed.is_empty());
    assert_eq!(report.retargeted, vec!["deployment:d1:status"]);
    assert!(manager.reconcile(&[service("2", Some("d1"))]).is_noop());

    let handler = channel.handlers_for("deployment:d1:status").remove(0);
    handler(StatusEvent::new("d1", "live"));
    assert_eq!(router.routed(), vec![("2".to_string(), "live".to_string())]);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(channel.subscribes(), vec!["deployment:d1:status"]);
    assert!(channel.cancels().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn swapped_deployments_keep_subscriptions_and_swap_owners() {
    let (channel, _gate) = RecordingChannel::open();
    let (mut manager, router) = manager(&channel);

    manager.reconcile(&[service("1", Some("d1")), service("2", Some("d2"))]);
    assert!(wait_for(|| manager.all_joined()).await);

    let report = manager.reconcile(&[service("1", Some("d2")), service("2", Some("d1"))]);
    assert_eq!(
        report.retargeted,
        vec!["deployment:d1:status", "deployment:d2:status"]
    );

    channel.handlers_for("deployment:d1:status")[0](StatusEvent::new("d1", "failed"));
    channel.handlers_for("deployment:d2:status")[0](StatusEvent::new("d2", "live"));
    assert_eq!(
        router.routed(),
        vec![
            ("2".to_string(), "failed".to_string()),
            ("1".to_string(), "live".to_string()),
        ]
    );

    assert_eq!(manager.rejoin(), 2);
    assert!(wait_for(|| channel.subscribes().len() == 4 && manager.all_joined()).await);
    channel.handlers_for("deployment:d1:status")[1](StatusEvent::new("d1", "live"));
    assert_eq!(
        router.routed().last(),
        Some(&("2".to_string(), "live".to_string()))
    );
}
