use std::time::Duration;

use crate::notify::NotifyMode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub notify_mode: NotifyMode,
    /// Drop a service's pushed status once its latest deployment changes or
    /// it leaves the snapshot.
    pub clear_override_on_redeploy: bool,
    /// Period for [`crate::StatusSync::spawn_refresh_loop`]; `None` disables it.
    pub refresh_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            notify_mode: NotifyMode::default(),
            clear_override_on_redeploy: true,
            refresh_interval: None,
        }
    }
}
