use dpl_core::FetchError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

mod channel;
mod config;
mod manager;
mod notify;
mod reconciler;
mod sync;

pub use channel::{
    Cancel, Connectivity, EventChannel, EventHandler, NotificationSink, SnapshotFetcher,
};
pub use config::SyncConfig;
pub use manager::{EventRouter, ReconcileReport, SubscriptionManager, TopicTarget};
pub use notify::{NotificationPolicy, NotifyMode};
pub use reconciler::StatusReconciler;
pub use sync::{ServiceRow, StatusSync};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("snapshot fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("status sync has been shut down")]
    ShutDown,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
