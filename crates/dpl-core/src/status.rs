use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Display vocabulary for a deployment status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Online,
    Error,
    Warning,
    Pending,
    Offline,
    Idle,
}

impl Default for StatusClass {
    fn default() -> Self {
        Self::Idle
    }
}

impl StatusClass {
    pub const ALL: [StatusClass; 6] = [
        StatusClass::Online,
        StatusClass::Error,
        StatusClass::Warning,
        StatusClass::Pending,
        StatusClass::Offline,
        StatusClass::Idle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatusClass::Online => "online",
            StatusClass::Error => "error",
            StatusClass::Warning => "warning",
            StatusClass::Pending => "pending",
            StatusClass::Offline => "offline",
            StatusClass::Idle => "idle",
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusClass {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_status(input);
        StatusClass::ALL
            .into_iter()
            .find(|class| class.as_str() == normalized)
            .ok_or_else(|| format!("Unknown status class: {normalized}"))
    }
}

pub fn normalize_status(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Maps a raw status to its display class. Total: unrecognized and missing
/// values land in `Idle`.
pub fn classify(status: Option<&str>) -> StatusClass {
    let Some(raw) = status else {
        return StatusClass::Idle;
    };
    match normalize_status(raw).as_str() {
        "live" | "success" | "running" | "online" => StatusClass::Online,
        "failed" | "error" => StatusClass::Error,
        "warning" | "degraded" => StatusClass::Warning,
        "pending" | "building" | "deploying" | "starting" => StatusClass::Pending,
        "stopped" | "offline" => StatusClass::Offline,
        _ => StatusClass::Idle,
    }
}
