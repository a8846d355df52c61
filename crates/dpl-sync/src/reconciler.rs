use dpl_core::{classify, Service, StatusClass, StatusEvent};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusOverride {
    deployment_id: String,
    status: String,
}

/// Pushed status per service, layered over the snapshot's `current_status`.
#[derive(Debug, Default)]
pub struct StatusReconciler {
    overrides: HashMap<String, StatusOverride>,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins by arrival; timestamps are not compared.
    pub fn on_event(&mut self, event: &StatusEvent, service_id: &str) -> StatusClass {
        self.overrides.insert(
            service_id.to_string(),
            StatusOverride {
                deployment_id: event.deployment_id.clone(),
                status: event.status.clone(),
            },
        );
        classify(Some(&event.status))
    }

    pub fn override_for(&self, service_id: &str) -> Option<&str> {
        self.overrides
            .get(service_id)
            .map(|entry| entry.status.as_str())
    }

    pub fn compute_effective_status<'a>(&'a self, service: &'a Service) -> Option<&'a str> {
        self.override_for(&service.id)
            .or(service.current_status.as_deref())
    }

    /// Services with neither a pushed nor a snapshot status read as offline.
    pub fn effective_class(&self, service: &Service) -> StatusClass {
        match self.compute_effective_status(service) {
            Some(status) => classify(Some(status)),
            None => StatusClass::Offline,
        }
    }

    /// Drops overrides whose service left the list or moved to another
    /// deployment. Returns the affected service ids, sorted.
    pub fn retain_current(&mut self, services: &[Service]) -> Vec<String> {
        let latest = services
            .iter()
            .map(|service| (service.id.as_str(), service.latest_deployment_id.as_deref()))
            .collect::<HashMap<_, _>>();
        let mut cleared = Vec::new();
        self.overrides.retain(|service_id, entry| {
            let keep = matches!(
                latest.get(service_id.as_str()),
                Some(Some(deployment_id)) if *deployment_id == entry.deployment_id
            );
            if !keep {
                cleared.push(service_id.clone());
            }
            keep
        });
        cleared.sort();
        cleared
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}
