//! Unary service references.
//!
//! A [`ReferenceRecipe`] yields a proxy bound to the best matching service
//! in the registry. Calls through the proxy block (up to the configured
//! timeout) while a mandatory reference has nothing bound.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::listener::{ListenerSpec, ReferenceListener, ResolvedListener, invoke_listener};
use super::{ExecutionContext, Instance, Recipe, RecipeKind};
use crate::error::{BlueprintError, Result};
use crate::proxy::{DelegatingProxyFactory, Dispatcher, ProxyFactory};
use crate::service::{PropertyValue, ServiceFilter, ServiceHandle, ServiceRegistry};
use crate::tracker::{Binding, SatisfactionListener, SatisfiableRecipe, ServiceTracker};

/// Default time a mandatory reference waits for a service.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Whether a reference needs a service to be satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Availability {
    #[default]
    Mandatory,
    Optional,
}

/// How a unary reference reacts to a better service appearing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Damping {
    /// Switch to the best candidate whenever it changes.
    #[default]
    Greedy,
    /// Keep the current service until it goes away.
    Reluctant,
}

/// What a service reference looks for and how it waits.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use blueprint_container::recipe::ReferenceMetadata;
///
/// let metadata = ReferenceMetadata::new()
///     .interface("app::Clock")
///     .optional()
///     .timeout(Duration::from_millis(500));
/// assert!(metadata.is_optional());
/// assert_eq!(metadata.filter().to_string(), "(objectClass=app::Clock)");
/// ```
#[derive(Debug, Clone)]
pub struct ReferenceMetadata {
    filter: ServiceFilter,
    interfaces: Vec<String>,
    availability: Availability,
    timeout: Duration,
    damping: Damping,
}

impl Default for ReferenceMetadata {
    fn default() -> Self {
        Self {
            filter: ServiceFilter::new(),
            interfaces: Vec::new(),
            availability: Availability::Mandatory,
            timeout: DEFAULT_TIMEOUT,
            damping: Damping::Greedy,
        }
    }
}

impl ReferenceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interface the service must be registered under; also the
    /// interface the proxy is created for.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        let interface = interface.into();
        self.filter = self.filter.interface(interface.clone());
        self.interfaces = vec![interface];
        self
    }

    /// Restrict to services exported by a named component.
    pub fn component_name(mut self, name: impl Into<String>) -> Self {
        self.filter = self.filter.component_name(name);
        self
    }

    /// Add a property equality constraint.
    pub fn filter_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.filter = self.filter.property(key, value);
        self
    }

    pub fn availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn optional(self) -> Self {
        self.availability(Availability::Optional)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn damping(mut self, damping: Damping) -> Self {
        self.damping = damping;
        self
    }

    #[inline]
    pub fn filter(&self) -> &ServiceFilter {
        &self.filter
    }

    #[inline]
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    #[inline]
    pub fn is_optional(&self) -> bool {
        self.availability == Availability::Optional
    }

    #[inline]
    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }
}

// ═══════════════════════════════════════════
// UnaryBinding
// ═══════════════════════════════════════════

enum Notification {
    Bind(ServiceHandle),
    Unbind(Option<ServiceHandle>),
}

#[derive(Default)]
struct UnaryState {
    bound: Option<ServiceHandle>,
    service: Option<Instance>,
    listeners: Vec<ResolvedListener<dyn ReferenceListener>>,
}

/// Binds the single best candidate and serves blocking lookups.
pub struct UnaryBinding {
    monitor: Mutex<UnaryState>,
    bound_changed: Condvar,
    timeout: Duration,
    damping: Damping,
}

impl UnaryBinding {
    fn new(timeout: Duration, damping: Damping) -> Self {
        Self {
            monitor: Mutex::new(UnaryState::default()),
            bound_changed: Condvar::new(),
            timeout,
            damping,
        }
    }

    /// Switch the bound service. Must be called with the monitor held.
    fn retarget(
        &self,
        tracker: &ServiceTracker<Self>,
        state: &mut UnaryState,
        target: Option<ServiceHandle>,
    ) -> Vec<Notification> {
        self.bound_changed.notify_all();
        if state.bound == target {
            return Vec::new();
        }

        let mut notifications = Vec::with_capacity(2);
        if let Some(old) = state.bound.take() {
            if state.service.take().is_some() {
                tracker.registry().release(&old);
            }
            notifications.push(Notification::Unbind(Some(old)));
        }
        if let Some(ref new) = target {
            notifications.push(Notification::Bind(new.clone()));
        }

        debug!(
            reference = blueprint_support::rendering::display_name(tracker.name()),
            bound = ?target.as_ref().map(ServiceHandle::id),
            "Reference rebound"
        );
        state.bound = target;
        notifications
    }

    fn fire(
        listeners: &[ResolvedListener<dyn ReferenceListener>],
        notifications: Vec<Notification>,
    ) {
        for notification in notifications {
            for resolved in listeners {
                match notification {
                    Notification::Bind(ref handle) => {
                        invoke_listener(&resolved.component, "bind", || {
                            resolved.listener.bind(handle)
                        });
                    }
                    Notification::Unbind(ref handle) => {
                        invoke_listener(&resolved.component, "unbind", || {
                            resolved.listener.unbind(handle.as_ref())
                        });
                    }
                }
            }
        }
    }

    /// Run `f` under the monitor, then deliver its notifications unlocked.
    fn with_monitor(
        &self,
        f: impl FnOnce(&mut UnaryState) -> Vec<Notification>,
    ) {
        let (listeners, notifications) = {
            let mut state = self.monitor.lock();
            let notifications = f(&mut *state);
            if notifications.is_empty() {
                return;
            }
            (state.listeners.clone(), notifications)
        };
        Self::fire(&listeners, notifications);
    }

    fn install_listeners(&self, listeners: Vec<ResolvedListener<dyn ReferenceListener>>) {
        let bound = {
            let mut state = self.monitor.lock();
            state.listeners = listeners.clone();
            state.bound.clone()
        };
        let initial = match bound {
            Some(handle) => Notification::Bind(handle),
            None => Notification::Unbind(None),
        };
        Self::fire(&listeners, vec![initial]);
    }

    /// Block while a mandatory reference is started but unbound.
    fn await_binding(&self, tracker: &ServiceTracker<Self>, state: &mut MutexGuard<'_, UnaryState>) {
        if state.bound.is_some()
            || tracker.is_optional()
            || self.timeout.is_zero()
            || !tracker.is_started()
        {
            return;
        }

        trace!(filter = %tracker.filter(), timeout = ?self.timeout, "Waiting for service");
        let deadline = Instant::now() + self.timeout;
        while state.bound.is_none() && tracker.is_started() {
            if self.bound_changed.wait_until(state, deadline).timed_out() {
                break;
            }
        }
    }

    fn unavailable(tracker: &ServiceTracker<Self>) -> BlueprintError {
        let filter = tracker.filter().to_string();
        if tracker.is_started() {
            BlueprintError::unavailable(
                format!("Timeout expired when waiting for mandatory service reference: {filter}"),
                filter,
            )
        } else {
            BlueprintError::unavailable(
                format!("The container is being or has been destroyed: {filter}"),
                filter,
            )
        }
    }

    /// Current service object, acquiring it on first use after a bind.
    pub fn get_service(&self, tracker: &ServiceTracker<Self>) -> Result<Option<Instance>> {
        let mut state = self.monitor.lock();
        self.await_binding(tracker, &mut state);

        let Some(handle) = state.bound.clone() else {
            if tracker.is_started() && tracker.is_optional() {
                return Ok(None);
            }
            return Err(Self::unavailable(tracker));
        };

        if let Some(ref service) = state.service {
            return Ok(Some(Arc::clone(service)));
        }
        match tracker.registry().acquire(&handle) {
            Some(service) => {
                state.service = Some(Arc::clone(&service));
                Ok(Some(service))
            }
            None => {
                let filter = tracker.filter().to_string();
                Err(BlueprintError::unavailable(
                    format!("The bound service is no longer registered: {filter}"),
                    filter,
                ))
            }
        }
    }

    /// Currently bound handle, waiting like [`get_service`](Self::get_service).
    pub fn bound_reference(&self, tracker: &ServiceTracker<Self>) -> Result<Option<ServiceHandle>> {
        let mut state = self.monitor.lock();
        self.await_binding(tracker, &mut state);

        match state.bound.clone() {
            Some(handle) => Ok(Some(handle)),
            None if tracker.is_started() && tracker.is_optional() => Ok(None),
            None => Err(Self::unavailable(tracker)),
        }
    }
}

impl Binding for UnaryBinding {
    fn track(&self, tracker: &ServiceTracker<Self>, _handle: &ServiceHandle) {
        self.with_monitor(|state| {
            if !tracker.is_started() {
                return Vec::new();
            }
            if self.damping == Damping::Reluctant && state.bound.is_some() {
                return Vec::new();
            }
            self.retarget(tracker, state, tracker.best_candidate())
        });
    }

    fn untrack(&self, tracker: &ServiceTracker<Self>, handle: &ServiceHandle) {
        self.with_monitor(|state| {
            if state.bound.as_ref() != Some(handle) || !tracker.is_started() {
                return Vec::new();
            }
            self.retarget(tracker, state, tracker.best_candidate())
        });
    }

    fn retrack(&self, tracker: &ServiceTracker<Self>) {
        self.with_monitor(|state| {
            if !tracker.is_started() {
                return Vec::new();
            }
            let candidates = tracker.candidates();
            let keep = self.damping == Damping::Reluctant
                && state.bound.as_ref().is_some_and(|b| candidates.contains(b));
            if keep {
                return Vec::new();
            }
            self.retarget(tracker, state, tracker.best_candidate())
        });
    }

    fn stopped(&self, tracker: &ServiceTracker<Self>) {
        self.with_monitor(|state| self.retarget(tracker, state, None));
        self.bound_changed.notify_all();
    }
}

// ═══════════════════════════════════════════
// ReferenceRecipe
// ═══════════════════════════════════════════

/// A `<reference>`: a proxy to the best service matching a filter.
pub struct ReferenceRecipe {
    name: Option<String>,
    metadata: ReferenceMetadata,
    tracker: Arc<ServiceTracker<UnaryBinding>>,
    proxy_factory: Arc<dyn ProxyFactory>,
    proxy: OnceCell<Instance>,
    listeners: Vec<ListenerSpec<dyn ReferenceListener>>,
    listeners_installed: OnceCell<()>,
    explicit_dependencies: Vec<Arc<dyn Recipe>>,
}

impl ReferenceRecipe {
    /// Named reference.
    ///
    /// # Errors
    /// Fails with a component definition error if the metadata carries no
    /// filter constraint.
    pub fn new(
        name: impl Into<String>,
        metadata: ReferenceMetadata,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        Self::build(Some(name.into()), metadata, registry)
    }

    /// Anonymous (inlined) reference.
    pub fn anonymous(metadata: ReferenceMetadata, registry: Arc<dyn ServiceRegistry>) -> Result<Self> {
        Self::build(None, metadata, registry)
    }

    fn build(
        name: Option<String>,
        metadata: ReferenceMetadata,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        let binding = UnaryBinding::new(metadata.timeout, metadata.damping);
        let tracker = ServiceTracker::new(
            name.clone(),
            metadata.filter.clone(),
            metadata.is_optional(),
            registry,
            binding,
        )?;
        Ok(Self {
            name,
            metadata,
            tracker: Arc::new(tracker),
            proxy_factory: Arc::new(DelegatingProxyFactory),
            proxy: OnceCell::new(),
            listeners: Vec::new(),
            listeners_installed: OnceCell::new(),
            explicit_dependencies: Vec::new(),
        })
    }

    pub fn with_listener(mut self, listener: ListenerSpec<dyn ReferenceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_proxy_factory(mut self, factory: Arc<dyn ProxyFactory>) -> Self {
        self.proxy_factory = factory;
        self
    }

    pub fn depends_on(mut self, recipe: Arc<dyn Recipe>) -> Self {
        self.explicit_dependencies.push(recipe);
        self
    }

    pub fn metadata(&self) -> &ReferenceMetadata {
        &self.metadata
    }

    /// The proxy, once the recipe has been created.
    pub fn proxy(&self) -> Option<Instance> {
        self.proxy.get().cloned()
    }

    /// Dispatch once: the current service, blocking per the metadata.
    pub fn service(&self) -> Result<Option<Instance>> {
        self.tracker.binding().get_service(&self.tracker)
    }

    /// The bound service handle, blocking per the metadata.
    pub fn bound_reference(&self) -> Result<Option<ServiceHandle>> {
        self.tracker.binding().bound_reference(&self.tracker)
    }

    /// All matching services currently known.
    pub fn service_references(&self) -> Vec<ServiceHandle> {
        self.tracker.candidates()
    }

    pub fn best_service_reference(&self) -> Option<ServiceHandle> {
        self.tracker.best_candidate()
    }

    fn create_proxy(&self) -> Result<Instance> {
        let tracker = Arc::clone(&self.tracker);
        let dispatcher: Dispatcher = Arc::new(move || tracker.binding().get_service(&tracker));
        self.proxy_factory
            .create_proxy(&self.metadata.interfaces, dispatcher)
    }
}

impl fmt::Debug for ReferenceRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceRecipe")
            .field("name", &self.name)
            .field("filter", &self.metadata.filter.to_string())
            .field("availability", &self.metadata.availability)
            .field("started", &self.tracker.is_started())
            .field("satisfied", &self.tracker.is_satisfied())
            .finish()
    }
}

impl Recipe for ReferenceRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::Reference
    }

    fn dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        self.explicit_dependencies
            .iter()
            .cloned()
            .chain(self.listeners.iter().map(|l| Arc::clone(l.component())))
            .collect()
    }

    fn constructor_dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        self.explicit_dependencies.clone()
    }

    fn create(&self, ctx: &dyn ExecutionContext) -> Result<Instance> {
        for dependency in &self.explicit_dependencies {
            ctx.create_recipe(dependency)?;
        }

        if !self.tracker.is_started() {
            self.tracker.start(ctx.satisfaction_listener())?;
        }

        let proxy = Arc::clone(self.proxy.get_or_try_init(|| self.create_proxy())?);
        if let Some(ref name) = self.name {
            ctx.add_partial_object(name, Arc::clone(&proxy));
        }

        self.listeners_installed.get_or_try_init(|| {
            let listeners = self
                .listeners
                .iter()
                .map(|spec| spec.resolve(ctx))
                .collect::<Result<Vec<_>>>()?;
            self.tracker.binding().install_listeners(listeners);
            Ok::<(), BlueprintError>(())
        })?;

        Ok(proxy)
    }

    fn destroy(&self, _instance: &Instance) {
        self.tracker.stop();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_satisfiable(&self) -> Option<&dyn SatisfiableRecipe> {
        Some(self)
    }
}

impl SatisfiableRecipe for ReferenceRecipe {
    fn start(&self, listener: Arc<dyn SatisfactionListener>) -> Result<()> {
        self.tracker.start(listener)
    }

    fn stop(&self) {
        self.tracker.stop();
    }

    fn is_started(&self) -> bool {
        self.tracker.is_started()
    }

    fn is_satisfied(&self) -> bool {
        self.tracker.is_satisfied()
    }

    fn is_optional(&self) -> bool {
        self.tracker.is_optional()
    }

    fn filter(&self) -> &ServiceFilter {
        self.tracker.filter()
    }

    fn listener_components(&self) -> Vec<Arc<dyn Recipe>> {
        self.listeners.iter().map(|l| Arc::clone(l.component())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::proxy::ServiceProxy;
    use crate::recipe::testing::StubContext;
    use crate::recipe::{ValueRecipe, instance_as, reference_listener};
    use crate::registry::InMemoryRegistry;
    use crate::service::{ServiceProperties, keys};
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ReferenceListener for Recorder {
        fn bind(&self, reference: &ServiceHandle) -> std::result::Result<(), BoxError> {
            self.calls.lock().push(format!("bind:{}", reference.id()));
            Ok(())
        }

        fn unbind(&self, reference: Option<&ServiceHandle>) -> std::result::Result<(), BoxError> {
            let id = reference.map_or("none".to_string(), |r| r.id().to_string());
            self.calls.lock().push(format!("unbind:{id}"));
            Ok(())
        }
    }

    fn register(registry: &InMemoryRegistry, value: u32, ranking: i64) -> ServiceHandle {
        let mut props = ServiceProperties::new();
        props.insert(keys::SERVICE_RANKING.into(), PropertyValue::Int(ranking));
        registry
            .register(vec!["Clock".into()], props, Arc::new(value) as Instance)
            .unwrap()
    }

    fn clock(timeout: Duration) -> ReferenceMetadata {
        ReferenceMetadata::new().interface("Clock").timeout(timeout)
    }

    fn proxy_of(instance: &Instance) -> Arc<ServiceProxy> {
        instance_as::<ServiceProxy>("clock", instance).unwrap()
    }

    #[test]
    fn proxy_follows_best_service() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe =
            ReferenceRecipe::new("clock", clock(Duration::from_secs(1)), registry.clone()).unwrap();
        let ctx = StubContext::default();

        let low = register(&registry, 1, 0);
        let proxy = proxy_of(&recipe.create(&ctx).unwrap());
        assert_eq!(*proxy.require::<u32>().unwrap(), 1);
        assert_eq!(registry.use_count(&low), 1);

        let high = register(&registry, 2, 10);
        assert_eq!(*proxy.require::<u32>().unwrap(), 2);
        assert_eq!(registry.use_count(&low), 0);

        registry.unregister(&high);
        assert_eq!(*proxy.require::<u32>().unwrap(), 1);
        assert_eq!(recipe.bound_reference().unwrap(), Some(low));
    }

    #[test]
    fn reluctant_damping_keeps_current_service() {
        let registry = Arc::new(InMemoryRegistry::new());
        let metadata = clock(Duration::from_secs(1)).damping(Damping::Reluctant);
        let recipe = ReferenceRecipe::new("clock", metadata, registry.clone()).unwrap();
        let ctx = StubContext::default();

        let low = register(&registry, 1, 0);
        recipe.create(&ctx).unwrap();
        register(&registry, 2, 10);
        assert_eq!(recipe.bound_reference().unwrap(), Some(low.clone()));

        registry.unregister(&low);
        assert_eq!(*instance_as::<u32>("clock", &recipe.service().unwrap().unwrap()).unwrap(), 2);
    }

    #[test]
    fn listeners_see_initial_state_and_each_rebind_once() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let recipe = ReferenceRecipe::new("clock", clock(Duration::from_secs(1)), registry.clone())
            .unwrap()
            .with_listener(reference_listener::<Recorder>(Arc::new(
                ValueRecipe::from_instance(recorder.clone() as Instance),
            )));
        let ctx = StubContext::default();

        recipe.create(&ctx).unwrap();
        recipe.create(&ctx).unwrap();
        let a = register(&registry, 1, 0);
        let b = register(&registry, 2, 5);
        registry.unregister(&b);
        recipe.stop();

        assert_eq!(
            *recorder.calls.lock(),
            vec![
                "unbind:none".to_string(),
                format!("bind:{}", a.id()),
                format!("unbind:{}", a.id()),
                format!("bind:{}", b.id()),
                format!("unbind:{}", b.id()),
                format!("bind:{}", a.id()),
                format!("unbind:{}", a.id()),
            ]
        );
    }

    #[test]
    fn mandatory_reference_times_out() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe =
            ReferenceRecipe::new("clock", clock(Duration::from_millis(100)), registry).unwrap();
        let ctx = StubContext::default();
        recipe.create(&ctx).unwrap();

        let started = Instant::now();
        let result = recipe.service();
        let elapsed = started.elapsed();

        match result {
            Err(BlueprintError::ServiceUnavailable { message, filter }) => {
                assert!(message.starts_with("Timeout expired"));
                assert_eq!(filter, "(objectClass=Clock)");
            }
            other => panic!("Expected ServiceUnavailable, got: {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn optional_reference_never_blocks() {
        let registry = Arc::new(InMemoryRegistry::new());
        let metadata = clock(Duration::from_secs(30)).optional();
        let recipe = ReferenceRecipe::new("clock", metadata, registry).unwrap();
        let ctx = StubContext::default();
        recipe.create(&ctx).unwrap();

        let started = Instant::now();
        assert!(recipe.service().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(recipe.is_satisfied());
    }

    #[test]
    fn waiting_call_wakes_on_registration() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe = Arc::new(
            ReferenceRecipe::new("clock", clock(Duration::from_secs(10)), registry.clone()).unwrap(),
        );
        recipe.create(&StubContext::default()).unwrap();

        let waiter = thread::spawn({
            let recipe = recipe.clone();
            move || recipe.service()
        });
        thread::sleep(Duration::from_millis(50));
        register(&registry, 9, 0);

        let service = waiter.join().unwrap().unwrap().unwrap();
        assert_eq!(*instance_as::<u32>("clock", &service).unwrap(), 9);
    }

    #[test]
    fn stop_fails_waiting_call_fast() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe = Arc::new(
            ReferenceRecipe::new("clock", clock(Duration::from_secs(10)), registry).unwrap(),
        );
        recipe.create(&StubContext::default()).unwrap();

        let started = Instant::now();
        let waiter = thread::spawn({
            let recipe = recipe.clone();
            move || recipe.service()
        });
        thread::sleep(Duration::from_millis(50));
        recipe.stop();

        match waiter.join().unwrap() {
            Err(BlueprintError::ServiceUnavailable { message, .. }) => {
                assert!(message.contains("destroyed"));
            }
            other => panic!("Expected ServiceUnavailable, got: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!recipe.is_satisfied());
    }

    #[test]
    fn stop_releases_acquired_service() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe =
            ReferenceRecipe::new("clock", clock(Duration::from_secs(1)), registry.clone()).unwrap();
        let handle = register(&registry, 1, 0);
        recipe.create(&StubContext::default()).unwrap();
        recipe.service().unwrap();
        assert_eq!(registry.use_count(&handle), 1);

        recipe.stop();
        assert_eq!(registry.use_count(&handle), 0);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn named_reference_publishes_partial_proxy() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe =
            ReferenceRecipe::new("clock", clock(Duration::from_secs(1)), registry).unwrap();
        let ctx = StubContext::default();

        let proxy = recipe.create(&ctx).unwrap();
        assert!(Arc::ptr_eq(&proxy, &ctx.get_partial_object("clock").unwrap()));
        assert!(Arc::ptr_eq(&proxy, &recipe.proxy().unwrap()));
    }

    #[test]
    fn unconstrained_reference_is_rejected() {
        let registry = Arc::new(InMemoryRegistry::new());
        let result = ReferenceRecipe::anonymous(ReferenceMetadata::new(), registry);
        assert!(matches!(result, Err(BlueprintError::ComponentDefinition { .. })));
    }
}
