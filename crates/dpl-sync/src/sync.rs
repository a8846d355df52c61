use dpl_core::{Notification, Project, Service, StatusClass, StatusEvent};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    channel::{Connectivity, EventChannel, NotificationSink, SnapshotFetcher},
    config::SyncConfig,
    lock,
    manager::{EventRouter, SubscriptionManager, TopicTarget},
    notify::NotificationPolicy,
    reconciler::StatusReconciler,
    SyncError,
};

/// One rendered line: a snapshot service joined with its effective status.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceRow {
    pub service_id: String,
    pub name: String,
    pub status: Option<String>,
    pub class: StatusClass,
}

struct SyncState {
    services: Vec<Service>,
    reconciler: StatusReconciler,
    policy: NotificationPolicy,
}

/// Single writer for the status map: every handler funnels through the
/// state mutex, so events for one topic apply in delivery order.
struct StatusRouter {
    state: Mutex<SyncState>,
    sink: Arc<dyn NotificationSink>,
}

impl EventRouter for StatusRouter {
    fn route(&self, target: &TopicTarget, event: StatusEvent) {
        if event.deployment_id != target.deployment_id {
            warn!(
                event = "sync_event_dropped",
                reason = "deployment_mismatch",
                topic = %target.topic,
                deployment_id = %event.deployment_id,
            );
            return;
        }

        let notification = {
            let mut state = lock(&self.state);
            let SyncState {
                services,
                reconciler,
                policy,
            } = &mut *state;
            let Some(service) = services
                .iter()
                .find(|service| service.id == target.service_id)
            else {
                debug!(
                    event = "sync_event_dropped",
                    reason = "unknown_service",
                    service_id = %target.service_id,
                );
                return;
            };
            if service.latest_deployment_id.as_deref() != Some(target.deployment_id.as_str()) {
                debug!(
                    event = "sync_event_dropped",
                    reason = "superseded_deployment",
                    service_id = %service.id,
                    deployment_id = %target.deployment_id,
                );
                return;
            }
            let class = reconciler.on_event(&event, &service.id);
            debug!(
                event = "sync_status_applied",
                service_id = %service.id,
                status = %event.status,
                class = %class,
            );
            policy.on_event(&event, service)
        };

        if let Some(notification) = notification {
            emit(self.sink.as_ref(), &notification);
        }
    }
}

fn emit(sink: &dyn NotificationSink, notification: &Notification) {
    info!(
        event = "sync_notify",
        kind = %notification.kind,
        service_id = notification.service_id.as_deref().unwrap_or_default(),
        message = %notification.message,
    );
    sink.notify(notification);
}

/// Keeps the effective status of every tracked service current, from
/// snapshots fetched on demand and events pushed per deployment.
pub struct StatusSync {
    config: SyncConfig,
    channel: Arc<dyn EventChannel>,
    fetcher: Arc<dyn SnapshotFetcher>,
    router: Arc<StatusRouter>,
    manager: Arc<Mutex<SubscriptionManager>>,
    connectivity: watch::Receiver<Connectivity>,
    synced_session: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
}

impl StatusSync {
    /// Spawns the connectivity watcher, so it must run inside a Tokio runtime.
    pub fn start(
        config: SyncConfig,
        channel: Arc<dyn EventChannel>,
        fetcher: Arc<dyn SnapshotFetcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let router = Arc::new(StatusRouter {
            state: Mutex::new(SyncState {
                services: Vec::new(),
                reconciler: StatusReconciler::new(),
                policy: NotificationPolicy::new(config.notify_mode),
            }),
            sink,
        });
        let manager = Arc::new(Mutex::new(SubscriptionManager::new(
            Arc::clone(&channel),
            Arc::clone(&router) as Arc<dyn EventRouter>,
        )));
        let (shutdown_tx, _) = watch::channel(false);
        let mut connectivity = channel.connectivity();
        let initial = *connectivity.borrow_and_update();
        let synced_session = Arc::new(AtomicU64::new(initial.session));

        let sync = Arc::new(Self {
            config,
            channel,
            fetcher,
            router,
            manager,
            connectivity: connectivity.clone(),
            synced_session,
            shutdown_tx,
        });
        sync.spawn_connectivity_watcher(connectivity, initial);
        info!(
            event = "sync_start",
            notify_mode = %sync.config.notify_mode,
            clear_override_on_redeploy = sync.config.clear_override_on_redeploy,
        );
        sync
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetches a fresh snapshot and reconciles against it. On failure the
    /// previous services and subscriptions stay in place.
    pub async fn refresh(&self, project_id: &str) -> Result<Project, SyncError> {
        if self.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        match self.fetcher.fetch_snapshot(project_id).await {
            Ok(project) => {
                debug!(
                    event = "sync_snapshot",
                    project_id = %project_id,
                    services = project.services.len(),
                );
                self.reconcile(&project.services);
                Ok(project)
            }
            Err(err) => {
                warn!(event = "sync_snapshot_error", project_id = %project_id, error = %err);
                emit(
                    self.router.sink.as_ref(),
                    &Notification::fetch_failed(project_id, &err.to_string()),
                );
                Err(SyncError::Fetch(err))
            }
        }
    }

    /// Holds the manager lock across the state swap and the topic diff, so
    /// concurrent callers cannot leave topics derived from a service list
    /// other than the stored one. Lock order is manager, then state.
    pub fn reconcile(&self, services: &[Service]) {
        if self.is_shut_down() {
            warn!(event = "sync_reconcile_after_shutdown", services = services.len());
            return;
        }
        let mut manager = lock(&self.manager);
        if manager.is_shut_down() {
            return;
        }
        {
            let mut state = lock(&self.router.state);
            if self.config.clear_override_on_redeploy {
                let cleared = state.reconciler.retain_current(services);
                if !cleared.is_empty() {
                    info!(event = "sync_override_cleared", service_ids = ?cleared);
                }
            }
            state.policy.retain_current(services);
            state.services = services.to_vec();
        }
        let report = manager.reconcile(services);
        drop(manager);
        if !report.is_noop() {
            debug!(
                event = "sync_reconciled",
                subscribed = report.subscribed.len(),
                unsubscribed = report.unsubscribed.len(),
                retargeted = report.retargeted.len(),
            );
        }
    }

    pub fn effective_status(&self, service_id: &str) -> StatusClass {
        let state = lock(&self.router.state);
        state
            .services
            .iter()
            .find(|service| service.id == service_id)
            .map(|service| state.reconciler.effective_class(service))
            .unwrap_or(StatusClass::Offline)
    }

    pub fn service_rows(&self) -> Vec<ServiceRow> {
        let state = lock(&self.router.state);
        state
            .services
            .iter()
            .map(|service| ServiceRow {
                service_id: service.id.clone(),
                name: service.display_name().to_string(),
                status: state
                    .reconciler
                    .compute_effective_status(service)
                    .map(str::to_string),
                class: state.reconciler.effective_class(service),
            })
            .collect()
    }

    /// The service list from the last reconcile, in snapshot order.
    pub fn services(&self) -> Vec<Service> {
        lock(&self.router.state).services.clone()
    }

    pub fn active_topics(&self) -> BTreeSet<String> {
        lock(&self.manager).active_topics()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Waits until subscriptions have been re-issued for the transport's
    /// current session and every one of them is acknowledged.
    pub async fn wait_until_joined(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_joined() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn is_joined(&self) -> bool {
        let current = *self.connectivity.borrow();
        let caught_up =
            !current.connected || self.synced_session.load(Ordering::SeqCst) >= current.session;
        caught_up && lock(&self.manager).all_joined()
    }

    /// Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        lock(&self.manager).shutdown();
    }

    /// Re-fetches the snapshot every `refresh_interval`. Returns `None` when
    /// no interval is configured.
    pub fn spawn_refresh_loop(self: &Arc<Self>, project_id: String) -> Option<JoinHandle<()>> {
        let period = self.config.refresh_interval?;
        let sync = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(sync) = sync.upgrade() else {
                            break;
                        };
                        // Failures are already logged and surfaced to the sink.
                        let _ = sync.refresh(&project_id).await;
                    }
                }
            }
            debug!(event = "sync_refresh_loop_stop", project_id = %project_id);
        }))
    }

    fn spawn_connectivity_watcher(
        &self,
        mut connectivity: watch::Receiver<Connectivity>,
        initial: Connectivity,
    ) {
        let manager = Arc::downgrade(&self.manager);
        let synced_session = Arc::clone(&self.synced_session);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut last = initial;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *connectivity.borrow_and_update();
                        let dropped = !current.connected || current.session != last.session;
                        if last.connected && dropped {
                            warn!(event = "sync_transport_disconnected", session = last.session);
                        }
                        if current.connected && current.session != last.session {
                            if !rejoin(&manager) {
                                break;
                            }
                            synced_session.store(current.session, Ordering::SeqCst);
                        }
                        last = current;
                    }
                }
            }
        });
    }
}

fn rejoin(manager: &Weak<Mutex<SubscriptionManager>>) -> bool {
    let Some(manager) = manager.upgrade() else {
        return false;
    };
    let topics = lock(&manager).rejoin();
    info!(event = "sync_transport_reconnected", topics = topics);
    true
}

impl Drop for StatusSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}
