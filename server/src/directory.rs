//! Collaborator seams: resource visibility and event history.
//!
//! The gateway does not own resources. It asks an [`AccessPolicy`] whether an
//! identity may view a resource and an [`EventHistory`] for the events to
//! replay when a client joins a room. The in-memory implementations here back
//! the binary and the tests; a deployment embedding the gateway supplies its
//! own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bus::{EventBus, Subscription};
use crate::types::Event;

/// Events retained per resource by [`MemoryEventLog`].
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    /// The resource exists but the identity may not view it.
    Denied,
    /// No such resource.
    NotFound,
}

/// A collaborator call failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("collaborator unavailable: {0}")]
pub struct CollaboratorError(pub String);

/// Authorization predicate supplied by the producing system.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// `canView(identityId, resourceId)`.
    ///
    /// `identity_id` is `None` for anonymous callers.
    async fn can_view(
        &self,
        identity_id: Option<&str>,
        resource_id: &str,
    ) -> Result<Access, CollaboratorError>;
}

/// Event history supplied by the producing system.
#[async_trait]
pub trait EventHistory: Send + Sync {
    /// `historyFor(resourceId)`, oldest first.
    async fn history_for(&self, resource_id: &str) -> Result<Vec<Event>, CollaboratorError>;
}

/// Who may view a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    /// Only associated identities.
    Restricted,
}

#[derive(Debug, Default)]
struct ResourceEntry {
    visibility: Visibility,
    associated: HashSet<String>,
}

/// In-memory resource registry implementing [`AccessPolicy`].
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    resources: RwLock<HashMap<String, ResourceEntry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource, or updates its visibility if already known.
    pub fn register(&self, resource_id: impl Into<String>, visibility: Visibility) {
        let resource_id = resource_id.into();
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        debug!(resource_id = %resource_id, ?visibility, "Registered resource");
        resources.entry(resource_id).or_default().visibility = visibility;
    }

    /// Registers a resource as public unless it is already known.
    pub fn ensure_registered(&self, resource_id: &str) {
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        if !resources.contains_key(resource_id) {
            resources.insert(resource_id.to_string(), ResourceEntry::default());
        }
    }

    /// Records that `identity_id` may view `resource_id`.
    ///
    /// Unknown resources are registered as restricted.
    pub fn associate(&self, resource_id: &str, identity_id: impl Into<String>) {
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        resources
            .entry(resource_id.to_string())
            .or_insert_with(|| ResourceEntry {
                visibility: Visibility::Restricted,
                associated: HashSet::new(),
            })
            .associated
            .insert(identity_id.into());
    }

    /// Returns `true` if the resource is registered.
    pub fn contains(&self, resource_id: &str) -> bool {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(resource_id)
    }

    fn check(&self, identity_id: Option<&str>, resource_id: &str) -> Access {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        match resources.get(resource_id) {
            None => Access::NotFound,
            Some(entry) if entry.visibility == Visibility::Public => Access::Allowed,
            Some(entry) => match identity_id {
                Some(identity_id) if entry.associated.contains(identity_id) => Access::Allowed,
                _ => Access::Denied,
            },
        }
    }
}

#[async_trait]
impl AccessPolicy for MemoryDirectory {
    async fn can_view(
        &self,
        identity_id: Option<&str>,
        resource_id: &str,
    ) -> Result<Access, CollaboratorError> {
        Ok(self.check(identity_id, resource_id))
    }
}

/// Bounded in-memory event log implementing [`EventHistory`].
///
/// Keeps the most recent events per resource in publish order.
#[derive(Debug)]
pub struct MemoryEventLog {
    events: RwLock<HashMap<String, VecDeque<Event>>>,
    limit: usize,
}

impl MemoryEventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    /// Appends an event. System-wide events are not recorded.
    pub fn append(&self, event: &Event) {
        let Some(resource_id) = event.resource_id.as_deref() else {
            return;
        };

        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let log = events.entry(resource_id.to_string()).or_default();
        if log.len() == self.limit {
            log.pop_front();
        }
        log.push_back(event.clone());
    }

    /// Records every event published on `bus` until the subscription drops.
    pub fn record_from(self: &std::sync::Arc<Self>, bus: &EventBus) -> Subscription {
        let log = std::sync::Arc::clone(self);
        bus.subscribe_all(move |event| log.append(event))
    }

    /// Events recorded for a resource, oldest first.
    pub fn events_for(&self, resource_id: &str) -> Vec<Event> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[async_trait]
impl EventHistory for MemoryEventLog {
    async fn history_for(&self, resource_id: &str) -> Result<Vec<Event>, CollaboratorError> {
        Ok(self.events_for(resource_id))
    }
}
