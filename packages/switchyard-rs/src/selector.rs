//! Load balancing across the instances of one logical group.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::envelope::IntegrationMessage;
use crate::error::SwitchyardError;
use crate::topology::{BoundInstance, LogicalGroup};

/// Picks the one instance of a logical group that receives a delivery.
pub trait InstanceSelector: Send + Sync + 'static {
    /// Select an instance of `group` for `message`.
    ///
    /// An empty group is a configuration error and must be reported with
    /// [`SwitchyardError::EmptyGroup`].
    fn select<'g>(
        &self,
        message: &IntegrationMessage,
        group: &'g LogicalGroup,
    ) -> Result<&'g BoundInstance, SwitchyardError>;
}

/// Cycles through a group's instances with one cursor per logical name.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, logical: &str) -> usize {
        if let Some(cursor) = self.cursors.get(logical) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(logical.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl InstanceSelector for RoundRobinSelector {
    fn select<'g>(
        &self,
        _message: &IntegrationMessage,
        group: &'g LogicalGroup,
    ) -> Result<&'g BoundInstance, SwitchyardError> {
        let instances = group.instances();
        match instances.len() {
            0 => Err(SwitchyardError::EmptyGroup {
                logical_name: group.logical().to_string(),
            }),
            1 => Ok(&instances[0]),
            len => Ok(&instances[self.next_index(group.logical()) % len]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Command, EndpointIdentity, MessageType};
    use crate::handler::{erase_handler, handler_fn};
    use crate::topology::{Route, Topology};
    use serde::Serialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Serialize)]
    struct Work;
    impl Command for Work {}

    fn group_of(instances: &[&str]) -> LogicalGroup {
        let topology = Topology::new();
        for instance in instances {
            topology
                .bind(
                    MessageType::command::<Work>(),
                    &EndpointIdentity::new("workers", *instance),
                    erase_handler(handler_fn(|_w: Work, _ctx| async { Ok(()) })),
                )
                .unwrap();
        }
        match topology.resolve(&MessageType::command::<Work>()).unwrap() {
            Route::Targets(mut groups) => groups.remove(0),
            Route::NoSubscribers => panic!("Expected a group"),
        }
    }

    #[test]
    fn test_round_robin_fairness_and_order() {
        let selector = RoundRobinSelector::new();
        let group = group_of(&["w0", "w1", "w2"]);
        let message = IntegrationMessage::command(Work);

        let picks: Vec<String> = (0..9)
            .map(|_| {
                selector
                    .select(&message, &group)
                    .unwrap()
                    .identity()
                    .instance()
                    .to_string()
            })
            .collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for pick in &picks {
            *counts.entry(pick.as_str()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 3));

        // Cyclic: every window of three consecutive picks covers all instances.
        for window in picks.windows(3) {
            let mut sorted = window.to_vec();
            sorted.sort();
            assert_eq!(sorted, vec!["w0", "w1", "w2"]);
        }
    }

    #[test]
    fn test_single_instance_bypasses_cursor() {
        let selector = RoundRobinSelector::new();
        let group = group_of(&["only"]);
        let message = IntegrationMessage::command(Work);

        for _ in 0..3 {
            let picked = selector.select(&message, &group).unwrap();
            assert_eq!(picked.identity().instance(), "only");
        }
        assert!(selector.cursors.is_empty());
    }

    #[test]
    fn test_empty_group_is_reported() {
        let selector = RoundRobinSelector::new();
        let group = LogicalGroup::new("ghosts", vec![]);
        let err = selector
            .select(&IntegrationMessage::command(Work), &group)
            .unwrap_err();
        match err {
            SwitchyardError::EmptyGroup { logical_name } => assert_eq!(logical_name, "ghosts"),
            other => panic!("Expected EmptyGroup, got {other:?}"),
        }
    }
}
