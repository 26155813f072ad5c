//! In-process service registry.
//!
//! [`InMemoryRegistry`] is a complete [`ServiceRegistry`] suitable for
//! tests and for hosting several containers in one process. Events are
//! delivered synchronously on the calling thread, after the registry's
//! own lock has been released.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{BlueprintError, Result};
use crate::recipe::Instance;
use crate::service::{
    ReleaseCallback, ServiceEvent, ServiceFilter, ServiceHandle, ServiceListener,
    ServiceProperties, ServiceRegistry, SubscriptionId,
};

struct Entry {
    handle: ServiceHandle,
    service: Instance,
    uses: usize,
    unregistering: bool,
    on_released: Vec<ReleaseCallback>,
}

/// Use count of a service unregistered while still acquired.
struct Draining {
    uses: usize,
    on_released: Vec<ReleaseCallback>,
}

struct Subscription {
    filter: ServiceFilter,
    listener: Arc<dyn ServiceListener>,
}

#[derive(Default)]
struct RegistryState {
    services: BTreeMap<u64, Entry>,
    draining: BTreeMap<u64, Draining>,
    subscriptions: BTreeMap<u64, Subscription>,
}

impl RegistryState {
    fn listeners_for(&self, handle: &ServiceHandle) -> Vec<Arc<dyn ServiceListener>> {
        self.subscriptions
            .values()
            .filter(|s| s.filter.matches(handle))
            .map(|s| Arc::clone(&s.listener))
            .collect()
    }
}

/// Thread-safe registry kept entirely in memory.
///
/// Service ids start at 1 and increase monotonically, so a lower id
/// always means an earlier registration.
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
    next_service_id: AtomicU64,
    next_subscription_id: AtomicU64,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_service_id: AtomicU64::new(1),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.state.lock().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().services.is_empty()
    }

    /// Number of outstanding [`acquire`](ServiceRegistry::acquire) calls
    /// for a service. Unregistered services count until released.
    pub fn use_count(&self, handle: &ServiceHandle) -> usize {
        let state = self.state.lock();
        match state.services.get(&handle.id()) {
            Some(entry) => entry.uses,
            None => state.draining.get(&handle.id()).map_or(0, |d| d.uses),
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    fn deliver(listeners: &[Arc<dyn ServiceListener>], event: &ServiceEvent) {
        for listener in listeners {
            listener.service_changed(event);
        }
    }

    fn run_released(handle: &ServiceHandle, callbacks: Vec<ReleaseCallback>) {
        if callbacks.is_empty() {
            return;
        }
        trace!(service = %handle, callbacks = callbacks.len(), "Service released");
        for callback in callbacks {
            callback();
        }
    }
}

impl ServiceRegistry for InMemoryRegistry {
    fn subscribe(
        &self,
        filter: &ServiceFilter,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<SubscriptionId> {
        filter.ensure_constrained()?;

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().subscriptions.insert(
            id,
            Subscription {
                filter: filter.clone(),
                listener,
            },
        );

        trace!(subscription = id, filter = %filter, "Subscribed");
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        if self.state.lock().subscriptions.remove(&subscription.0).is_some() {
            trace!(subscription = subscription.0, "Unsubscribed");
        }
    }

    fn current(&self, filter: &ServiceFilter) -> Vec<ServiceHandle> {
        self.state
            .lock()
            .services
            .values()
            .filter(|e| !e.unregistering && filter.matches(&e.handle))
            .map(|e| e.handle.clone())
            .collect()
    }

    fn acquire(&self, handle: &ServiceHandle) -> Option<Instance> {
        let mut state = self.state.lock();
        let entry = state.services.get_mut(&handle.id())?;
        entry.uses += 1;
        Some(Arc::clone(&entry.service))
    }

    fn release(&self, handle: &ServiceHandle) {
        let released = {
            let mut state = self.state.lock();
            let id = handle.id();
            if let Some(entry) = state.services.get_mut(&id) {
                entry.uses = entry.uses.saturating_sub(1);
                if entry.uses > 0 {
                    return;
                }
                std::mem::take(&mut entry.on_released)
            } else if let Some(draining) = state.draining.get_mut(&id) {
                draining.uses = draining.uses.saturating_sub(1);
                if draining.uses > 0 {
                    return;
                }
                state
                    .draining
                    .remove(&id)
                    .map(|d| d.on_released)
                    .unwrap_or_default()
            } else {
                return;
            }
        };
        Self::run_released(handle, released);
    }

    fn when_released(&self, handle: &ServiceHandle, callback: ReleaseCallback) {
        {
            let mut state = self.state.lock();
            let id = handle.id();
            if let Some(entry) = state.services.get_mut(&id) {
                if entry.uses > 0 {
                    entry.on_released.push(callback);
                    return;
                }
            } else if let Some(draining) = state.draining.get_mut(&id) {
                draining.on_released.push(callback);
                return;
            }
        }
        callback();
    }

    fn register(
        &self,
        interfaces: Vec<String>,
        properties: ServiceProperties,
        service: Instance,
    ) -> Result<ServiceHandle> {
        if interfaces.is_empty() {
            return Err(BlueprintError::definition(
                "A service must be registered under at least one interface",
            ));
        }

        let id = self.next_service_id.fetch_add(1, Ordering::Relaxed);
        let handle = ServiceHandle::new(id, interfaces, properties);

        let listeners = {
            let mut state = self.state.lock();
            state.services.insert(
                id,
                Entry {
                    handle: handle.clone(),
                    service,
                    uses: 0,
                    unregistering: false,
                    on_released: Vec::new(),
                },
            );
            state.listeners_for(&handle)
        };

        debug!(service = %handle, listeners = listeners.len(), "Service registered");
        Self::deliver(&listeners, &ServiceEvent::Registered(handle.clone()));
        Ok(handle)
    }

    fn unregister(&self, handle: &ServiceHandle) {
        let listeners = {
            let mut state = self.state.lock();
            match state.services.get_mut(&handle.id()) {
                Some(entry) if !entry.unregistering => entry.unregistering = true,
                _ => return,
            }
            state.listeners_for(handle)
        };

        // Listeners still see the service while it is unregistering.
        Self::deliver(&listeners, &ServiceEvent::Unregistering(handle.clone()));

        let released = {
            let mut state = self.state.lock();
            match state.services.remove(&handle.id()) {
                Some(entry) if entry.uses > 0 => {
                    trace!(service = %handle, uses = entry.uses, "Service still in use");
                    state.draining.insert(
                        handle.id(),
                        Draining {
                            uses: entry.uses,
                            on_released: entry.on_released,
                        },
                    );
                    Vec::new()
                }
                Some(entry) => entry.on_released,
                None => Vec::new(),
            }
        };
        debug!(service = %handle, "Service unregistered");
        Self::run_released(handle, released);
    }

    fn modify(&self, handle: &ServiceHandle, properties: ServiceProperties) {
        let mut modified = Vec::new();
        let mut ended = Vec::new();
        let mut started = Vec::new();

        {
            let state = self.state.lock();
            let Some(entry) = state.services.get(&handle.id()) else {
                return;
            };
            if entry.unregistering {
                return;
            }

            let before: Vec<bool> = state
                .subscriptions
                .values()
                .map(|s| s.filter.matches(&entry.handle))
                .collect();

            entry.handle.update_properties(properties);

            for (subscription, matched_before) in state.subscriptions.values().zip(before) {
                let listener = Arc::clone(&subscription.listener);
                match (matched_before, subscription.filter.matches(&entry.handle)) {
                    (true, true) => modified.push(listener),
                    (true, false) => ended.push(listener),
                    (false, true) => started.push(listener),
                    (false, false) => {}
                }
            }
        }

        trace!(service = %handle, "Service properties modified");
        Self::deliver(&ended, &ServiceEvent::Unregistering(handle.clone()));
        Self::deliver(&modified, &ServiceEvent::Modified(handle.clone()));
        Self::deliver(&started, &ServiceEvent::Registered(handle.clone()));
    }
}
