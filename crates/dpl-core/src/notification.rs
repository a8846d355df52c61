use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Service;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    Error,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

impl Notification {
    pub fn deployed(service: &Service) -> Self {
        Self {
            kind: NotificationKind::Success,
            message: format!("{} deployed successfully", service.display_name()),
            service_id: Some(service.id.clone()),
        }
    }

    pub fn deploy_failed(service: &Service) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: format!("{} deployment failed", service.display_name()),
            service_id: Some(service.id.clone()),
        }
    }

    pub fn fetch_failed(project_id: &str, reason: &str) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: format!("Failed to load project {project_id}: {reason}"),
            service_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> Service {
        Service {
            id: "svc-1".to_string(),
            name: name.to_string(),
            port: None,
            branch: None,
            latest_deployment_id: Some("d1".to_string()),
            current_status: None,
        }
    }

    #[test]
    fn messages_name_the_service() {
        let ok = Notification::deployed(&service("api"));
        assert_eq!(ok.kind, NotificationKind::Success);
        assert_eq!(ok.message, "api deployed successfully");
        assert_eq!(ok.service_id.as_deref(), Some("svc-1"));

        let failed = Notification::deploy_failed(&service(""));
        assert_eq!(failed.kind, NotificationKind::Error);
        assert_eq!(failed.message, "svc-1 deployment failed");
    }
}
