//! Service reference tracking.
//!
//! A [`ServiceTracker`] follows the registry for one filter and keeps the
//! set of matching services (the candidates) up to date. What happens when
//! candidates come and go is decided by a [`Binding`] strategy: unary
//! references bind the best candidate, reference lists bind all of them.
//!
//! # State machine
//! ```text
//!            start()               stop()
//! STOPPED ────────────> STARTED ────────────> STOPPED
//!    ▲   (CAS, no-op       │    (CAS, no-op        │
//!    │    if started)      │     if stopped)       │
//!    └─────────────────────┴───────────────────────┘
//! ```
//!
//! # Locking
//! Candidate list mutations happen under the tracker's candidate lock.
//! Bindings keep their own monitor, always taken *before* the candidate
//! lock. Satisfaction and listener callbacks run with no tracker lock held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::Result;
use crate::recipe::Recipe;
use crate::service::{
    ServiceEvent, ServiceFilter, ServiceHandle, ServiceListener, ServiceRegistry, SubscriptionId,
};

/// Receives satisfaction changes of service references.
pub trait SatisfactionListener: Send + Sync {
    fn notify_satisfaction(&self, component: Option<&str>, satisfied: bool);
}

/// Listener that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSatisfactionListener;

impl SatisfactionListener for NoopSatisfactionListener {
    fn notify_satisfaction(&self, _component: Option<&str>, _satisfied: bool) {}
}

/// A recipe whose readiness depends on the service registry.
pub trait SatisfiableRecipe: Send + Sync {
    /// Begin tracking. Idempotent.
    fn start(&self, listener: Arc<dyn SatisfactionListener>) -> Result<()>;

    /// Stop tracking and release every bound service. Idempotent.
    fn stop(&self);

    fn is_started(&self) -> bool;

    fn is_satisfied(&self) -> bool;

    fn is_optional(&self) -> bool;

    fn filter(&self) -> &ServiceFilter;

    /// Components used as reference listeners.
    fn listener_components(&self) -> Vec<Arc<dyn Recipe>>;
}

/// Strategy deciding what a change in the candidate set means.
///
/// Callbacks are invoked without the tracker's candidate lock held.
pub trait Binding: Send + Sync + Sized + 'static {
    /// A candidate was added or its properties changed.
    fn track(&self, tracker: &ServiceTracker<Self>, handle: &ServiceHandle);

    /// A candidate was removed.
    fn untrack(&self, tracker: &ServiceTracker<Self>, handle: &ServiceHandle);

    /// Re-evaluate the whole candidate set.
    fn retrack(&self, tracker: &ServiceTracker<Self>);

    /// The tracker has been stopped; candidates are drained right after.
    fn stopped(&self, tracker: &ServiceTracker<Self>);
}

/// Tracks the services matching a filter.
pub struct ServiceTracker<B: Binding> {
    name: Option<String>,
    filter: ServiceFilter,
    optional: bool,
    registry: Arc<dyn ServiceRegistry>,
    binding: B,
    started: AtomicBool,
    satisfied: AtomicBool,
    candidates: Mutex<Vec<ServiceHandle>>,
    subscription: Mutex<Option<SubscriptionId>>,
    satisfaction_listener: RwLock<Option<Arc<dyn SatisfactionListener>>>,
}

/// Registry listener holding only a weak link, so an abandoned tracker
/// does not stay alive through its subscription.
struct EventForwarder<B: Binding> {
    tracker: Weak<ServiceTracker<B>>,
}

impl<B: Binding> ServiceListener for EventForwarder<B> {
    fn service_changed(&self, event: &ServiceEvent) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.handle_event(event);
        }
    }
}

impl<B: Binding> ServiceTracker<B> {
    pub fn new(
        name: Option<String>,
        filter: ServiceFilter,
        optional: bool,
        registry: Arc<dyn ServiceRegistry>,
        binding: B,
    ) -> Result<Self> {
        filter.ensure_constrained()?;
        Ok(Self {
            name,
            filter,
            optional,
            registry,
            binding,
            started: AtomicBool::new(false),
            satisfied: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            satisfaction_listener: RwLock::new(None),
        })
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn filter(&self) -> &ServiceFilter {
        &self.filter
    }

    #[inline]
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.satisfied.load(Ordering::Acquire)
    }

    #[inline]
    pub fn binding(&self) -> &B {
        &self.binding
    }

    #[inline]
    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    /// Snapshot of the candidates, in the order they were seen.
    pub fn candidates(&self) -> Vec<ServiceHandle> {
        self.candidates.lock().clone()
    }

    /// Highest ranked candidate; on equal ranking the oldest registration.
    pub fn best_candidate(&self) -> Option<ServiceHandle> {
        self.candidates
            .lock()
            .iter()
            .max_by(|a, b| {
                a.ranking()
                    .cmp(&b.ranking())
                    .then_with(|| b.id().cmp(&a.id()))
            })
            .cloned()
    }

    /// Start tracking.
    ///
    /// Subscription and the initial enumeration happen under the candidate
    /// lock, so a service registered in between is neither lost nor counted
    /// twice.
    pub fn start(self: &Arc<Self>, listener: Arc<dyn SatisfactionListener>) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        *self.satisfaction_listener.write() = Some(listener);
        self.satisfied.store(self.optional, Ordering::Release);

        let (satisfied, changed) = {
            let mut candidates = self.candidates.lock();
            let forwarder = Arc::new(EventForwarder {
                tracker: Arc::downgrade(self),
            });
            let subscription = match self.registry.subscribe(&self.filter, forwarder) {
                Ok(id) => id,
                Err(e) => {
                    self.started.store(false, Ordering::Release);
                    *self.satisfaction_listener.write() = None;
                    return Err(e);
                }
            };
            *self.subscription.lock() = Some(subscription);

            for handle in self.registry.current(&self.filter) {
                if !candidates.contains(&handle) {
                    candidates.push(handle);
                }
            }
            let satisfied = self.optional || !candidates.is_empty();
            (satisfied, self.swap_satisfied(satisfied))
        };

        debug!(
            reference = self.label(),
            filter = %self.filter,
            satisfied,
            "Service tracking started"
        );
        self.notify_satisfied(changed);
        self.binding.retrack(self);
        Ok(())
    }

    /// Stop tracking. A stopped tracker is never satisfied.
    pub fn stop(&self) {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(subscription) = self.subscription.lock().take() {
            self.registry.unsubscribe(subscription);
        }

        self.binding.stopped(self);

        let drained = {
            let mut candidates = self.candidates.lock();
            self.satisfied.store(false, Ordering::Release);
            std::mem::take(&mut *candidates)
        };
        for handle in &drained {
            self.binding.untrack(self, handle);
        }

        *self.satisfaction_listener.write() = None;
        debug!(reference = self.label(), "Service tracking stopped");
    }

    fn handle_event(&self, event: &ServiceEvent) {
        if !self.is_started() {
            return;
        }

        match event {
            ServiceEvent::Registered(handle) => self.service_added(handle),
            ServiceEvent::Modified(handle) => {
                let known = self.candidates.lock().contains(handle);
                if known {
                    trace!(reference = self.label(), service = %handle, "Candidate modified");
                    self.binding.track(self, handle);
                } else {
                    self.service_added(handle);
                }
            }
            ServiceEvent::Unregistering(handle) => self.service_removed(handle),
        }
    }

    // Events racing with `stop` are dropped under the candidate lock, so a
    // stopped tracker keeps no candidates and stays unsatisfied.

    fn service_added(&self, handle: &ServiceHandle) {
        let (added, changed) = {
            let mut candidates = self.candidates.lock();
            if !self.is_started() {
                return;
            }
            let added = !candidates.contains(handle);
            if added {
                candidates.push(handle.clone());
            }
            (added, self.swap_satisfied(self.optional || !candidates.is_empty()))
        };

        if added {
            trace!(reference = self.label(), service = %handle, "Candidate added");
            self.binding.track(self, handle);
        }
        self.notify_satisfied(changed);
    }

    fn service_removed(&self, handle: &ServiceHandle) {
        let (removed, changed) = {
            let mut candidates = self.candidates.lock();
            if !self.is_started() {
                return;
            }
            let before = candidates.len();
            candidates.retain(|c| c != handle);
            (
                candidates.len() != before,
                self.swap_satisfied(self.optional || !candidates.is_empty()),
            )
        };

        self.notify_satisfied(changed);
        if removed {
            trace!(reference = self.label(), service = %handle, "Candidate removed");
            self.binding.untrack(self, handle);
        }
    }

    /// Store the new value; `Some` if it changed.
    fn swap_satisfied(&self, satisfied: bool) -> Option<bool> {
        (self.satisfied.swap(satisfied, Ordering::AcqRel) != satisfied).then_some(satisfied)
    }

    fn notify_satisfied(&self, changed: Option<bool>) {
        let Some(satisfied) = changed else {
            return;
        };

        debug!(reference = self.label(), satisfied, "Satisfaction changed");
        let listener = self.satisfaction_listener.read().clone();
        if let Some(listener) = listener {
            listener.notify_satisfaction(self.name(), satisfied);
        }
    }

    fn label(&self) -> &str {
        blueprint_support::rendering::display_name(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Instance;
    use crate::registry::InMemoryRegistry;
    use crate::service::{PropertyValue, ServiceProperties, keys};
    use std::sync::atomic::AtomicUsize;

    /// Binding that records every callback.
    #[derive(Default)]
    struct RecordingBinding {
        pub events: Mutex<Vec<String>>,
    }

    impl Binding for RecordingBinding {
        fn track(&self, _: &ServiceTracker<Self>, handle: &ServiceHandle) {
            self.events.lock().push(format!("track:{}", handle.id()));
        }

        fn untrack(&self, _: &ServiceTracker<Self>, handle: &ServiceHandle) {
            self.events.lock().push(format!("untrack:{}", handle.id()));
        }

        fn retrack(&self, _: &ServiceTracker<Self>) {
            self.events.lock().push("retrack".to_string());
        }

        fn stopped(&self, _: &ServiceTracker<Self>) {
            self.events.lock().push("stopped".to_string());
        }
    }

    #[derive(Default)]
    struct CountingListener {
        pub changes: Mutex<Vec<bool>>,
        pub calls: AtomicUsize,
    }

    impl SatisfactionListener for CountingListener {
        fn notify_satisfaction(&self, _component: Option<&str>, satisfied: bool) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.changes.lock().push(satisfied);
        }
    }

    fn tracker(
        registry: &Arc<InMemoryRegistry>,
        optional: bool,
    ) -> Arc<ServiceTracker<RecordingBinding>> {
        Arc::new(
            ServiceTracker::new(
                Some("ref".into()),
                ServiceFilter::new().interface("Foo"),
                optional,
                registry.clone(),
                RecordingBinding::default(),
            )
            .unwrap(),
        )
    }

    fn register(registry: &InMemoryRegistry, ranking: Option<i64>) -> ServiceHandle {
        let mut props = ServiceProperties::new();
        if let Some(r) = ranking {
            props.insert(keys::SERVICE_RANKING.into(), PropertyValue::Int(r));
        }
        registry
            .register(vec!["Foo".into()], props, Arc::new(()) as Instance)
            .unwrap()
    }

    #[test]
    fn start_is_idempotent() {
        let registry = Arc::new(InMemoryRegistry::new());
        register(&registry, None);
        let t = tracker(&registry, false);
        let listener = Arc::new(CountingListener::default());

        t.start(listener.clone()).unwrap();
        t.start(listener.clone()).unwrap();

        assert!(t.is_started());
        assert!(t.is_satisfied());
        assert_eq!(t.candidates().len(), 1);
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(*t.binding().events.lock(), vec!["retrack".to_string()]);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_idempotent_and_unsatisfies() {
        let registry = Arc::new(InMemoryRegistry::new());
        let h = register(&registry, None);
        let t = tracker(&registry, true);
        t.start(Arc::new(NoopSatisfactionListener)).unwrap();

        t.stop();
        t.stop();

        assert!(!t.is_started());
        assert!(!t.is_satisfied());
        assert!(t.candidates().is_empty());
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(
            *t.binding().events.lock(),
            vec![
                "retrack".to_string(),
                "stopped".to_string(),
                format!("untrack:{}", h.id())
            ]
        );
    }

    #[test]
    fn satisfaction_follows_single_events() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t = tracker(&registry, false);
        let listener = Arc::new(CountingListener::default());
        t.start(listener.clone()).unwrap();
        assert!(!t.is_satisfied());

        let h = register(&registry, None);
        assert!(t.is_satisfied());

        registry.unregister(&h);
        assert!(!t.is_satisfied());

        assert_eq!(*listener.changes.lock(), vec![true, false]);
    }

    #[test]
    fn optional_reference_is_satisfied_when_empty() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t = tracker(&registry, true);
        let listener = Arc::new(CountingListener::default());
        t.start(listener.clone()).unwrap();

        assert!(t.is_satisfied());
        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn best_candidate_prefers_ranking_then_lowest_id() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t = tracker(&registry, false);
        t.start(Arc::new(NoopSatisfactionListener)).unwrap();
        assert!(t.best_candidate().is_none());

        let first = register(&registry, None);
        let second = register(&registry, Some(0));
        assert_eq!(t.best_candidate(), Some(first.clone()));

        let ranked = register(&registry, Some(5));
        assert_eq!(t.best_candidate(), Some(ranked.clone()));

        registry.unregister(&ranked);
        assert_eq!(t.best_candidate(), Some(first));
        assert_ne!(t.best_candidate(), Some(second));
    }

    #[test]
    fn events_reach_binding() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t = tracker(&registry, false);
        t.start(Arc::new(NoopSatisfactionListener)).unwrap();

        let h = register(&registry, None);
        registry.modify(&h, ServiceProperties::new());
        registry.unregister(&h);

        assert_eq!(
            *t.binding().events.lock(),
            vec![
                "retrack".to_string(),
                format!("track:{}", h.id()),
                format!("track:{}", h.id()),
                format!("untrack:{}", h.id()),
            ]
        );
    }

    #[test]
    fn stopped_tracker_ignores_events() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t = tracker(&registry, false);
        t.start(Arc::new(NoopSatisfactionListener)).unwrap();
        t.stop();

        register(&registry, None);
        assert!(t.candidates().is_empty());
        assert!(!t.is_satisfied());
    }

    #[test]
    fn event_overtaken_by_stop_is_dropped() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t = tracker(&registry, false);
        let listener = Arc::new(CountingListener::default());
        t.start(listener.clone()).unwrap();
        let h = register(&registry, None);
        t.stop();

        // Delivery that passed the started check before `stop` ran.
        let late = register(&registry, Some(1));
        t.service_added(&late);
        t.service_removed(&h);

        assert!(t.candidates().is_empty());
        assert!(!t.is_satisfied());
        assert!(
            !t.binding()
                .events
                .lock()
                .contains(&format!("track:{}", late.id()))
        );
        assert_eq!(*listener.changes.lock(), vec![true]);
    }

    #[test]
    fn empty_filter_is_rejected() {
        let registry = Arc::new(InMemoryRegistry::new());
        let result = ServiceTracker::new(
            None,
            ServiceFilter::new(),
            false,
            registry,
            RecordingBinding::default(),
        );
        assert!(result.is_err());
    }
}
