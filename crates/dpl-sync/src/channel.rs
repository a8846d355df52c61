use async_trait::async_trait;
use dpl_core::{FetchError, Notification, Project, StatusEvent};
use std::sync::Arc;
use tokio::sync::watch;

/// Transport link state. `session` increases on every (re)connection, so a
/// disconnect followed by a quick reconnect is still observable after the
/// watch coalesces both updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Connectivity {
    pub connected: bool,
    pub session: u64,
}

pub type EventHandler = Arc<dyn Fn(StatusEvent) + Send + Sync>;

/// Returned by [`EventChannel::subscribe`]; invoking it removes the handler.
pub type Cancel = Box<dyn FnOnce() + Send>;

/// Push transport delivering [`StatusEvent`]s per topic.
///
/// Delivery is at-least-once. Handlers for a single topic must be invoked one
/// at a time and in publish order: the reconciler applies events
/// last-write-wins by arrival, so a transport that reorders within a topic
/// can briefly show a stale status. Handlers for different topics may run
/// concurrently.
///
/// Retries and backoff belong to the transport. When it reconnects it
/// publishes a new session on [`EventChannel::connectivity`] and the
/// subscriber re-issues every subscription it still wants.
#[async_trait]
pub trait EventChannel: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str, handler: EventHandler) -> Cancel;

    /// Display only.
    fn is_connected(&self) -> bool;

    fn connectivity(&self) -> watch::Receiver<Connectivity>;
}

#[async_trait]
pub trait SnapshotFetcher: Send + Sync + 'static {
    async fn fetch_snapshot(&self, project_id: &str) -> Result<Project, FetchError>;
}

pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: &Notification);
}
