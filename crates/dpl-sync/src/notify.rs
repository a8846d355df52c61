use dpl_core::{normalize_status, Notification, NotificationKind, Service, StatusEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMode {
    /// Every `live` or `failed` event notifies, repeats included.
    #[default]
    EventTriggered,
    /// A repeat of the last notified outcome for the same deployment is
    /// suppressed.
    TransitionTriggered,
}

impl NotifyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyMode::EventTriggered => "event",
            NotifyMode::TransitionTriggered => "transition",
        }
    }
}

impl fmt::Display for NotifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotifyMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match normalize_status(input).as_str() {
            "event" | "event-triggered" | "event_triggered" => Ok(NotifyMode::EventTriggered),
            "transition" | "transition-triggered" | "transition_triggered" => {
                Ok(NotifyMode::TransitionTriggered)
            }
            other => Err(format!("Unknown notify mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LastNotified {
    deployment_id: String,
    kind: NotificationKind,
}

#[derive(Debug, Default)]
pub struct NotificationPolicy {
    mode: NotifyMode,
    last_notified: HashMap<String, LastNotified>,
}

impl NotificationPolicy {
    pub fn new(mode: NotifyMode) -> Self {
        Self {
            mode,
            last_notified: HashMap::new(),
        }
    }

    pub fn mode(&self) -> NotifyMode {
        self.mode
    }

    pub fn on_event(&mut self, event: &StatusEvent, service: &Service) -> Option<Notification> {
        let notification = match normalize_status(&event.status).as_str() {
            "live" => Notification::deployed(service),
            "failed" => Notification::deploy_failed(service),
            _ => return None,
        };

        if self.mode == NotifyMode::TransitionTriggered {
            let current = LastNotified {
                deployment_id: event.deployment_id.clone(),
                kind: notification.kind,
            };
            if self.last_notified.get(&service.id) == Some(&current) {
                return None;
            }
            self.last_notified.insert(service.id.clone(), current);
        }

        Some(notification)
    }

    /// Forgets services that left the snapshot.
    pub fn retain_current(&mut self, services: &[Service]) {
        self.last_notified
            .retain(|service_id, _| services.iter().any(|service| &service.id == service_id));
    }
}
