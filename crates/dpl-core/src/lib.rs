use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod notification;
pub mod status;
pub mod wire;

pub use notification::{Notification, NotificationKind};
pub use status::{classify, normalize_status, StatusClass};

const TOPIC_PREFIX: &str = "deployment:";
const TOPIC_SUFFIX: &str = ":status";

/// Push topic carrying status events for one deployment.
pub fn status_topic(deployment_id: &str) -> String {
    format!("{TOPIC_PREFIX}{deployment_id}{TOPIC_SUFFIX}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub latest_deployment_id: Option<String>,
    #[serde(default)]
    pub current_status: Option<String>,
}

impl Service {
    pub fn status_topic(&self) -> Option<String> {
        self.latest_deployment_id.as_deref().map(status_topic)
    }

    /// Name used in notifications; falls back to the id for unnamed services.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    #[serde(deserialize_with = "deserialize_id")]
    pub deployment_id: String,
    pub status: String,
    #[serde(rename = "timestamp", default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(deployment_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            status: status.into(),
            received_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> String {
        status_topic(&self.deployment_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("project not found: {project_id}")]
    NotFound { project_id: String },
    #[error("snapshot transport failed: {0}")]
    Transport(String),
}

/// Deserialize an id that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom(
            "expected string, number or null for deployment id",
        )),
    }
}
