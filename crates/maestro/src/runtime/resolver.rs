//! Dependency resolution: Kahn's algorithm driven by readiness events
//!
//! [`DependencyResolver`] is a plain state machine. Feeding it the name of a
//! service that became ready returns the services that were waiting only on
//! that one. [`spawn_resolver`] runs it as the single owner of that state,
//! receiving "X is ready" messages and emitting "launch Y" messages.

use indexmap::{IndexMap, IndexSet};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Tracks the still-unresolved dependencies of every waiting service
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    /// Services with no dependencies, in declaration order
    initial_ready: Vec<String>,
    /// Waiting services and the dependencies they still wait on
    pending: IndexMap<String, IndexSet<String>>,
    /// Services already reported ready
    resolved: HashSet<String>,
}

impl DependencyResolver {
    /// Build from `(service, dependencies)` pairs
    pub fn new<I, D>(services: I) -> Self
    where
        I: IntoIterator<Item = (String, D)>,
        D: IntoIterator<Item = String>,
    {
        let mut initial_ready = Vec::new();
        let mut pending = IndexMap::new();

        for (name, deps) in services {
            let deps: IndexSet<String> = deps.into_iter().collect();
            if deps.is_empty() {
                initial_ready.push(name);
            } else {
                pending.insert(name, deps);
            }
        }

        Self {
            initial_ready,
            pending,
            resolved: HashSet::new(),
        }
    }

    /// Services that can launch immediately
    pub fn initial_ready(&self) -> &[String] {
        &self.initial_ready
    }

    /// Record that `ready` reached readiness; returns the services it unblocked.
    ///
    /// Every service is returned at most once over the resolver's lifetime.
    /// Repeated readiness for the same service is ignored.
    pub fn resolve(&mut self, ready: &str) -> Vec<String> {
        if !self.resolved.insert(ready.to_string()) {
            return Vec::new();
        }

        let mut unblocked = Vec::new();
        self.pending.retain(|name, deps| {
            deps.shift_remove(ready);
            if deps.is_empty() {
                unblocked.push(name.clone());
                false
            } else {
                true
            }
        });
        unblocked
    }

    /// Names of services still waiting, in declaration order
    pub fn pending(&self) -> Vec<&str> {
        self.pending.keys().map(String::as_str).collect()
    }

    /// Unresolved dependencies of a waiting service
    #[cfg(test)]
    pub(crate) fn waiting_on(&self, name: &str) -> Option<Vec<&str>> {
        self.pending
            .get(name)
            .map(|deps| deps.iter().map(String::as_str).collect())
    }

    /// True once no service is waiting
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resolve eagerly, as if every service became ready the moment it launched.
    ///
    /// Returns a valid launch order, or the services that can never launch
    /// (those on or behind a cycle, or waiting on an undeclared service).
    pub fn launch_order(mut self) -> Result<Vec<String>, Vec<String>> {
        let mut order: Vec<String> = Vec::new();
        let mut queue: std::collections::VecDeque<String> =
            self.initial_ready.iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            queue.extend(self.resolve(&name));
            order.push(name);
        }

        if self.is_complete() {
            Ok(order)
        } else {
            Err(self.pending.keys().cloned().collect())
        }
    }
}

/// Run `resolver` as the owner of the pending-dependency state.
///
/// Immediately emits the initially ready services on `launch_tx`, then emits
/// newly unblocked services as readiness names arrive on `ready_rx`. The task
/// ends once nothing is pending or either channel closes, returning the
/// resolver for inspection.
pub fn spawn_resolver(
    mut resolver: DependencyResolver,
    mut ready_rx: mpsc::UnboundedReceiver<String>,
    launch_tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<DependencyResolver> {
    tokio::spawn(async move {
        log::info!(
            "Starting services without dependencies: {:?}",
            resolver.initial_ready()
        );
        if !resolver.is_complete() {
            log::info!("Services pending dependencies: {:?}", resolver.pending());
        }

        for name in resolver.initial_ready().to_vec() {
            if launch_tx.send(name).is_err() {
                return resolver;
            }
        }

        while !resolver.is_complete() {
            let Some(ready) = ready_rx.recv().await else {
                break;
            };
            log::debug!("'{}' is ready", ready);
            for next in resolver.resolve(&ready) {
                log::info!("Dependencies of '{}' are ready, launching", next);
                if launch_tx.send(next).is_err() {
                    return resolver;
                }
            }
        }

        if !resolver.is_complete() {
            log::warn!(
                "Dependency resolution ended with services still waiting: {:?}",
                resolver.pending()
            );
        }
        resolver
    })
}
