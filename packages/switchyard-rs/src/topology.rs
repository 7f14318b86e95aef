//! Routing topology: message type → logical groups → instances.
//!
//! The topology is built while endpoints are configured and is append-only
//! afterwards. Every endpoint locks its own registration once it is built;
//! the transport verifies ownership rules when it starts.
//!
//! # Ownership rules
//!
//! - Commands and queries have exactly one logical owner group.
//! - Events and replies have zero or more subscriber groups.
//! - A payload type is bound under one kind only.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::core::{EndpointIdentity, MessageType};
use crate::error::SwitchyardError;
use crate::handler::{AnyHandler, ErrorHandler};

/// One physical instance bound for a message type.
#[derive(Clone)]
pub struct BoundInstance {
    identity: EndpointIdentity,
    handler: Arc<dyn AnyHandler>,
}

impl BoundInstance {
    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    pub fn handler(&self) -> &Arc<dyn AnyHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for BoundInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundInstance")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Snapshot of the instances of one logical group for one message type.
///
/// Instances are ordered by instance name.
#[derive(Debug, Clone)]
pub struct LogicalGroup {
    logical: String,
    instances: Vec<BoundInstance>,
}

impl LogicalGroup {
    /// Build a group snapshot.
    pub fn new(logical: impl Into<String>, instances: Vec<BoundInstance>) -> Self {
        Self {
            logical: logical.into(),
            instances,
        }
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn instances(&self) -> &[BoundInstance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Result of resolving a message type.
#[derive(Debug, Clone)]
pub enum Route {
    /// One entry per logical group that receives the message.
    Targets(SmallVec<[LogicalGroup; 1]>),
    /// Nobody subscribes; a legal no-op for events and replies.
    NoSubscribers,
}

struct TopologyEntry {
    message_type: MessageType,
    groups: BTreeMap<String, BTreeMap<String, Arc<dyn AnyHandler>>>,
}

impl TopologyEntry {
    fn owners(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}

/// Registry of handlers keyed by message type.
#[derive(Default)]
pub struct Topology {
    entries: DashMap<TypeId, TopologyEntry>,
    error_handlers: DashMap<EndpointIdentity, Arc<dyn ErrorHandler>>,
    locked: DashSet<EndpointIdentity>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` on `endpoint` for `message_type`.
    pub fn bind(
        &self,
        message_type: MessageType,
        endpoint: &EndpointIdentity,
        handler: Arc<dyn AnyHandler>,
    ) -> Result<(), SwitchyardError> {
        self.ensure_unlocked(endpoint)?;

        let mut entry = self
            .entries
            .entry(message_type.type_id())
            .or_insert_with(|| TopologyEntry {
                message_type,
                groups: BTreeMap::new(),
            });

        if entry.message_type.kind() != message_type.kind() {
            return Err(SwitchyardError::ConflictingMessageKind {
                type_name: message_type.name(),
                bound: entry.message_type.kind(),
                requested: message_type.kind(),
            });
        }

        let group = entry
            .groups
            .entry(endpoint.logical().to_string())
            .or_default();
        if group.contains_key(endpoint.instance()) {
            return Err(SwitchyardError::HandlerAlreadyBound {
                type_name: message_type.name(),
                endpoint: endpoint.to_string(),
            });
        }
        group.insert(endpoint.instance().to_string(), handler);

        debug!(
            message_type = message_type.name(),
            kind = %message_type.kind(),
            endpoint = %endpoint,
            "handler bound"
        );
        Ok(())
    }

    /// Bind the error handler that receives `endpoint`'s refused messages.
    ///
    /// A second call replaces the first handler.
    pub fn bind_error_handler(
        &self,
        endpoint: &EndpointIdentity,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<(), SwitchyardError> {
        self.ensure_unlocked(endpoint)?;
        if self
            .error_handlers
            .insert(endpoint.clone(), handler)
            .is_some()
        {
            warn!(endpoint = %endpoint, "error handler replaced");
        }
        Ok(())
    }

    /// Freeze registration for `endpoint`.
    pub fn lock_topology_configuration(&self, endpoint: &EndpointIdentity) {
        if self.locked.insert(endpoint.clone()) {
            debug!(endpoint = %endpoint, "topology configuration locked");
        }
    }

    pub fn is_locked(&self, endpoint: &EndpointIdentity) -> bool {
        self.locked.contains(endpoint)
    }

    fn ensure_unlocked(&self, endpoint: &EndpointIdentity) -> Result<(), SwitchyardError> {
        if self.locked.contains(endpoint) {
            return Err(SwitchyardError::TopologyLocked {
                endpoint: endpoint.to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the groups that receive a message of `message_type`.
    pub fn resolve(&self, message_type: &MessageType) -> Result<Route, SwitchyardError> {
        let Some(entry) = self.entries.get(&message_type.type_id()) else {
            return if message_type.kind().requires_owner() {
                Err(SwitchyardError::NoOwner {
                    type_name: message_type.name(),
                })
            } else {
                Ok(Route::NoSubscribers)
            };
        };

        if entry.message_type.kind() != message_type.kind() {
            return Err(SwitchyardError::ConflictingMessageKind {
                type_name: message_type.name(),
                bound: entry.message_type.kind(),
                requested: message_type.kind(),
            });
        }

        if message_type.kind().requires_owner() && entry.groups.len() > 1 {
            return Err(SwitchyardError::MultipleOwners {
                type_name: message_type.name(),
                owners: entry.owners(),
            });
        }

        let targets: SmallVec<[LogicalGroup; 1]> = entry
            .groups
            .iter()
            .map(|(logical, instances)| LogicalGroup {
                logical: logical.clone(),
                instances: instances
                    .iter()
                    .map(|(instance, handler)| BoundInstance {
                        identity: EndpointIdentity::new(logical.clone(), instance.clone()),
                        handler: Arc::clone(handler),
                    })
                    .collect(),
            })
            .collect();

        if targets.is_empty() {
            return if message_type.kind().requires_owner() {
                Err(SwitchyardError::NoOwner {
                    type_name: message_type.name(),
                })
            } else {
                Ok(Route::NoSubscribers)
            };
        }
        Ok(Route::Targets(targets))
    }

    /// Check that every bound command and query has exactly one owner group.
    pub fn verify(&self) -> Result<(), SwitchyardError> {
        for entry in self.entries.iter() {
            let message_type = entry.message_type;
            if message_type.kind().requires_owner() && entry.groups.len() != 1 {
                let owners = entry.owners();
                if owners.is_empty() {
                    return Err(SwitchyardError::NoOwner {
                        type_name: message_type.name(),
                    });
                }
                return Err(SwitchyardError::MultipleOwners {
                    type_name: message_type.name(),
                    owners,
                });
            }
        }
        Ok(())
    }

    /// The error handler bound for `endpoint`, if any.
    pub fn error_handler(&self, endpoint: &EndpointIdentity) -> Option<Arc<dyn ErrorHandler>> {
        self.error_handlers
            .get(endpoint)
            .map(|handler| Arc::clone(handler.value()))
    }

    /// Logical groups bound for `message_type`.
    pub fn owners(&self, message_type: &MessageType) -> Vec<String> {
        self.entries
            .get(&message_type.type_id())
            .map(|entry| entry.owners())
            .unwrap_or_default()
    }

    /// Number of bound message types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
