//! Component Registry
//!
//! Maps component ids to the streams they asked for and a non-owning handle
//! to their consumer. Decoded events are fanned out to every live
//! registration whose specs match; registrations whose consumer has been
//! dropped are removed on the way and reported to the expiry listener.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;

use crate::domain::streaming::{ComponentId, Freshness, StreamEvent, StreamMode, StreamSpec};
use crate::infrastructure::metrics;

/// Receives events for the streams a component subscribed to.
///
/// Implemented for any `Fn(&StreamEvent) + Send + Sync`.
pub trait StreamConsumer: Send + Sync {
    /// Handle one event. Runs on the channel's read task; keep it short.
    fn on_event(&self, event: &StreamEvent);
}

impl<F> StreamConsumer for F
where
    F: Fn(&StreamEvent) + Send + Sync,
{
    fn on_event(&self, event: &StreamEvent) {
        self(event);
    }
}

/// Called with the id of each registration dropped because its consumer died.
pub type ExpiryListener = Arc<dyn Fn(&ComponentId) + Send + Sync>;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The id is bound to a different, still-live consumer.
    #[error("component {0} is already bound to a different consumer")]
    DuplicateComponent(ComponentId),
}

struct Registration {
    specs: Vec<StreamSpec>,
    handle: Weak<dyn StreamConsumer>,
}

impl Registration {
    fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }

    fn wants(&self, event: &StreamEvent) -> bool {
        self.specs.iter().any(|spec| {
            let fresh_enough = match spec.mode {
                StreamMode::Realtime => true,
                StreamMode::Snapshot => event.freshness == Freshness::Snapshot,
            };
            fresh_enough && spec.matches(event.kind, event.symbol.as_deref())
        })
    }
}

/// Registry of consumer components.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: RwLock<HashMap<ComponentId, Registration>>,
    expiry: RwLock<Option<ExpiryListener>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl ComponentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the expiry listener.
    pub fn set_expiry_listener(&self, listener: ExpiryListener) {
        *self.expiry.write() = Some(listener);
    }

    /// Add a spec for a component.
    ///
    /// The first registration binds the id to `handle`. Later registrations
    /// must pass the same consumer, unless the bound one has been dropped;
    /// the dead binding is then reported to the expiry listener and replaced.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateComponent` if the id is bound to another live
    /// consumer.
    pub fn register(
        &self,
        id: &ComponentId,
        spec: StreamSpec,
        handle: Weak<dyn StreamConsumer>,
    ) -> Result<(), RegistryError> {
        let mut replaced = false;
        let count = {
            let mut entries = self.entries.write();
            match entries.get_mut(id) {
                Some(existing) if existing.is_alive() => {
                    if !Weak::ptr_eq(&existing.handle, &handle) {
                        return Err(RegistryError::DuplicateComponent(id.clone()));
                    }
                    if !existing.specs.contains(&spec) {
                        existing.specs.push(spec);
                    }
                }
                dead => {
                    replaced = dead.is_some();
                    entries.insert(
                        id.clone(),
                        Registration {
                            specs: vec![spec],
                            handle,
                        },
                    );
                }
            }
            entries.len()
        };

        metrics::set_components(count);
        if replaced {
            tracing::debug!(component = %id, "Replaced expired consumer registration");
            self.notify_expired(std::slice::from_ref(id));
        }
        Ok(())
    }

    /// Remove a component. Returns true if it was registered.
    pub fn unregister(&self, id: &ComponentId) -> bool {
        let (removed, count) = {
            let mut entries = self.entries.write();
            let removed = entries.remove(id).is_some();
            (removed, entries.len())
        };
        metrics::set_components(count);
        removed
    }

    /// Deliver an event to every matching live consumer.
    ///
    /// Consumers run outside the registry lock, in registration-map order.
    /// Returns the number of consumers invoked.
    pub fn dispatch(&self, event: &StreamEvent) -> usize {
        let started = Instant::now();

        let (targets, dead) = {
            let entries = self.entries.read();
            let mut targets: Vec<Arc<dyn StreamConsumer>> = Vec::new();
            let mut dead = Vec::new();

            for (id, registration) in entries.iter() {
                if !registration.is_alive() {
                    dead.push(id.clone());
                    continue;
                }
                if registration.wants(event)
                    && let Some(consumer) = registration.handle.upgrade()
                {
                    targets.push(consumer);
                }
            }
            (targets, dead)
        };

        if !dead.is_empty() {
            self.purge(dead);
        }

        for consumer in &targets {
            consumer.on_event(event);
        }

        metrics::record_dispatch_duration(event.kind, started.elapsed());
        targets.len()
    }

    /// Remove every registration whose consumer was dropped.
    ///
    /// Returns the ids removed.
    pub fn sweep(&self) -> Vec<ComponentId> {
        let dead: Vec<ComponentId> = self
            .entries
            .read()
            .iter()
            .filter(|(_, r)| !r.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        self.purge(dead)
    }

    /// Specs registered for a component.
    #[must_use]
    pub fn specs(&self, id: &ComponentId) -> Vec<StreamSpec> {
        self.entries
            .read()
            .get(id)
            .map(|r| r.specs.clone())
            .unwrap_or_default()
    }

    /// Whether the id is registered (live or not yet swept).
    #[must_use]
    pub fn contains(&self, id: &ComponentId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Number of registrations, including not-yet-swept dead ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn purge(&self, candidates: Vec<ComponentId>) -> Vec<ComponentId> {
        let (removed, count) = {
            let mut entries = self.entries.write();
            let removed: Vec<ComponentId> = candidates
                .into_iter()
                .filter(|id| {
                    // Re-check: the id may have been rebound since the read.
                    if entries.get(id).is_some_and(|r| !r.is_alive()) {
                        entries.remove(id);
                        true
                    } else {
                        false
                    }
                })
                .collect();
            (removed, entries.len())
        };

        if removed.is_empty() {
            return removed;
        }

        metrics::set_components(count);
        tracing::debug!(count = removed.len(), "Removed expired consumer registrations");

        self.notify_expired(&removed);
        removed
    }

    fn notify_expired(&self, ids: &[ComponentId]) {
        let listener = self.expiry.read().clone();
        if let Some(listener) = listener {
            for id in ids {
                listener(id);
            }
        }
    }
}
