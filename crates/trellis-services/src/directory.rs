//! Service directory — in-memory cache of which endpoint hosts which facts.
//!
//! Rebuilt from announcements; may be stale or incomplete. Shared between the
//! discovery engine and the control dispatcher.

use std::sync::Arc;

use dashmap::DashMap;

use trellis_core::{Endpoint, FactSet};

/// A service reachable at `endpoint`, described by `facts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub endpoint: Endpoint,
    pub facts: FactSet,
}

impl ServiceEndpoint {
    pub fn new(endpoint: Endpoint, facts: FactSet) -> Self {
        Self { endpoint, facts }
    }
}

/// Concurrent map from endpoint to the facts announced for it.
#[derive(Clone, Default)]
pub struct ServiceDirectory {
    entries: Arc<DashMap<Endpoint, FactSet>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the facts for `service.endpoint`.
    /// Returns true if the endpoint was not known before.
    pub fn add(&self, service: ServiceEndpoint) -> bool {
        let replaced = self.entries.insert(service.endpoint, service.facts);
        replaced.is_none()
    }

    /// Every endpoint whose facts contain all of `facts`, in a stable order.
    pub fn query(&self, facts: &FactSet) -> Vec<Endpoint> {
        let mut found: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|e| e.value().contains_all(facts))
            .map(|e| e.key().clone())
            .collect();
        found.sort_by_key(|e| e.to_string());
        found
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<FactSet> {
        self.entries.get(endpoint).map(|e| e.value().clone())
    }

    pub fn remove(&self, endpoint: &Endpoint) -> Option<FactSet> {
        self.entries.remove(endpoint).map(|(_, facts)| facts)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
