//! Multiple-service references.
//!
//! A [`ReferenceListRecipe`] yields a [`ServiceList`]: a live, read-only
//! collection holding one proxy per matching service. Each proxy acquires
//! its service on first use and fails once that service has gone away.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use super::listener::{ListenerSpec, ReferenceListener, ResolvedListener, invoke_listener};
use super::reference::ReferenceMetadata;
use super::{ExecutionContext, Instance, Recipe, RecipeKind};
use crate::error::{BlueprintError, Result};
use crate::proxy::{DelegatingProxyFactory, Dispatcher, ProxyFactory};
use crate::service::{ServiceFilter, ServiceHandle, ServiceRegistry};
use crate::tracker::{Binding, SatisfactionListener, SatisfiableRecipe, ServiceTracker};

enum Slot {
    Unacquired,
    Acquired(Instance),
    Released,
}

/// Dispatch target of one list member.
struct MemberTarget {
    handle: ServiceHandle,
    registry: Arc<dyn ServiceRegistry>,
    slot: Mutex<Slot>,
}

impl MemberTarget {
    fn get(&self) -> Result<Option<Instance>> {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Acquired(ref service) => Ok(Some(Arc::clone(service))),
            Slot::Released => Err(self.gone()),
            Slot::Unacquired => {
                let service = self.registry.acquire(&self.handle).ok_or_else(|| self.gone())?;
                *slot = Slot::Acquired(Arc::clone(&service));
                Ok(Some(service))
            }
        }
    }

    fn release(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Released);
        if let Slot::Acquired(_) = previous {
            self.registry.release(&self.handle);
        }
    }

    fn gone(&self) -> BlueprintError {
        BlueprintError::unavailable(
            format!("The service has been unregistered: {}", self.handle),
            format!("(service.id={})", self.handle.id()),
        )
    }
}

struct Member {
    target: Arc<MemberTarget>,
    proxy: Instance,
}

#[derive(Default)]
struct MultiState {
    members: Vec<Member>,
    listeners: Vec<ResolvedListener<dyn ReferenceListener>>,
}

/// Binds every candidate, each behind its own proxy.
pub struct MultiBinding {
    monitor: Mutex<MultiState>,
    proxy_factory: RwLock<Arc<dyn ProxyFactory>>,
    interfaces: Vec<String>,
}

impl MultiBinding {
    fn new(interfaces: Vec<String>) -> Self {
        Self {
            monitor: Mutex::new(MultiState::default()),
            proxy_factory: RwLock::new(Arc::new(DelegatingProxyFactory)),
            interfaces,
        }
    }

    fn member(&self, tracker: &ServiceTracker<Self>, handle: &ServiceHandle) -> Result<Member> {
        let target = Arc::new(MemberTarget {
            handle: handle.clone(),
            registry: Arc::clone(tracker.registry()),
            slot: Mutex::new(Slot::Unacquired),
        });
        let dispatcher: Dispatcher = {
            let target = Arc::clone(&target);
            Arc::new(move || target.get())
        };
        let proxy = self
            .proxy_factory
            .read()
            .create_proxy(&self.interfaces, dispatcher)?;
        Ok(Member { target, proxy })
    }

    fn fire_bind(listeners: &[ResolvedListener<dyn ReferenceListener>], handle: &ServiceHandle) {
        for resolved in listeners {
            invoke_listener(&resolved.component, "bind", || resolved.listener.bind(handle));
        }
    }

    fn fire_unbind(
        listeners: &[ResolvedListener<dyn ReferenceListener>],
        handle: Option<&ServiceHandle>,
    ) {
        for resolved in listeners {
            invoke_listener(&resolved.component, "unbind", || resolved.listener.unbind(handle));
        }
    }

    fn install_listeners(&self, listeners: Vec<ResolvedListener<dyn ReferenceListener>>) {
        let handles: Vec<ServiceHandle> = {
            let mut state = self.monitor.lock();
            state.listeners = listeners.clone();
            state.members.iter().map(|m| m.target.handle.clone()).collect()
        };
        if handles.is_empty() {
            Self::fire_unbind(&listeners, None);
        }
        for handle in &handles {
            Self::fire_bind(&listeners, handle);
        }
    }

    fn proxies(&self) -> Vec<Instance> {
        self.monitor
            .lock()
            .members
            .iter()
            .map(|m| Arc::clone(&m.proxy))
            .collect()
    }

    fn references(&self) -> Vec<ServiceHandle> {
        self.monitor
            .lock()
            .members
            .iter()
            .map(|m| m.target.handle.clone())
            .collect()
    }

    fn targets(&self) -> Vec<Arc<MemberTarget>> {
        self.monitor
            .lock()
            .members
            .iter()
            .map(|m| Arc::clone(&m.target))
            .collect()
    }
}

impl Binding for MultiBinding {
    fn track(&self, tracker: &ServiceTracker<Self>, handle: &ServiceHandle) {
        let listeners = {
            let mut state = self.monitor.lock();
            if !tracker.is_started()
                || state.members.iter().any(|m| m.target.handle == *handle)
                || !tracker.candidates().contains(handle)
            {
                return;
            }
            match self.member(tracker, handle) {
                Ok(member) => state.members.push(member),
                Err(e) => {
                    warn!(service = %handle, error = %e, "Could not create proxy for list member");
                    return;
                }
            }
            state.listeners.clone()
        };
        trace!(service = %handle, "List member added");
        Self::fire_bind(&listeners, handle);
    }

    fn untrack(&self, _tracker: &ServiceTracker<Self>, handle: &ServiceHandle) {
        let (listeners, member) = {
            let mut state = self.monitor.lock();
            let Some(index) = state.members.iter().position(|m| m.target.handle == *handle) else {
                return;
            };
            let member = state.members.remove(index);
            (state.listeners.clone(), member)
        };
        member.target.release();
        trace!(service = %handle, "List member removed");
        Self::fire_unbind(&listeners, Some(handle));
    }

    fn retrack(&self, tracker: &ServiceTracker<Self>) {
        for handle in tracker.candidates() {
            self.track(tracker, &handle);
        }
    }

    fn stopped(&self, _tracker: &ServiceTracker<Self>) {}
}

/// The live collection produced by a [`ReferenceListRecipe`].
///
/// Members appear and disappear as matching services register and
/// unregister.
#[derive(Clone)]
pub struct ServiceList {
    tracker: Arc<ServiceTracker<MultiBinding>>,
}

impl ServiceList {
    pub fn len(&self) -> usize {
        self.tracker.binding().monitor.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One proxy per member, in the order services were seen.
    pub fn proxies(&self) -> Vec<Instance> {
        self.tracker.binding().proxies()
    }

    pub fn references(&self) -> Vec<ServiceHandle> {
        self.tracker.binding().references()
    }

    /// Service objects of the members still available, acquiring as needed.
    pub fn services(&self) -> Vec<Instance> {
        self.tracker
            .binding()
            .targets()
            .iter()
            .filter_map(|target| target.get().ok().flatten())
            .collect()
    }
}

impl fmt::Debug for ServiceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.references()).finish()
    }
}

/// A `<reference-list>`: every service matching a filter.
///
/// The timeout and damping of the metadata do not apply to lists.
pub struct ReferenceListRecipe {
    name: Option<String>,
    metadata: ReferenceMetadata,
    tracker: Arc<ServiceTracker<MultiBinding>>,
    list: OnceCell<Instance>,
    listeners: Vec<ListenerSpec<dyn ReferenceListener>>,
    listeners_installed: OnceCell<()>,
    explicit_dependencies: Vec<Arc<dyn Recipe>>,
}

impl ReferenceListRecipe {
    pub fn new(
        name: impl Into<String>,
        metadata: ReferenceMetadata,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        Self::build(Some(name.into()), metadata, registry)
    }

    pub fn anonymous(metadata: ReferenceMetadata, registry: Arc<dyn ServiceRegistry>) -> Result<Self> {
        Self::build(None, metadata, registry)
    }

    fn build(
        name: Option<String>,
        metadata: ReferenceMetadata,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        let binding = MultiBinding::new(metadata.interfaces().to_vec());
        let tracker = ServiceTracker::new(
            name.clone(),
            metadata.filter().clone(),
            metadata.is_optional(),
            registry,
            binding,
        )?;
        Ok(Self {
            name,
            metadata,
            tracker: Arc::new(tracker),
            list: OnceCell::new(),
            listeners: Vec::new(),
            listeners_installed: OnceCell::new(),
            explicit_dependencies: Vec::new(),
        })
    }

    pub fn with_listener(mut self, listener: ListenerSpec<dyn ReferenceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_proxy_factory(self, factory: Arc<dyn ProxyFactory>) -> Self {
        *self.tracker.binding().proxy_factory.write() = factory;
        self
    }

    pub fn depends_on(mut self, recipe: Arc<dyn Recipe>) -> Self {
        self.explicit_dependencies.push(recipe);
        self
    }

    pub fn metadata(&self) -> &ReferenceMetadata {
        &self.metadata
    }

    /// The managed collection; usable before creation, though it stays
    /// empty until tracking starts.
    pub fn list(&self) -> ServiceList {
        ServiceList {
            tracker: Arc::clone(&self.tracker),
        }
    }
}

impl fmt::Debug for ReferenceListRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceListRecipe")
            .field("name", &self.name)
            .field("filter", &self.metadata.filter().to_string())
            .field("members", &self.list().len())
            .finish()
    }
}

impl Recipe for ReferenceListRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::ReferenceList
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

        let list = Arc::clone(
            self.list
                .get_or_init(|| Arc::new(self.list()) as Instance),
        );
        if let Some(ref name) = self.name {
            ctx.add_partial_object(name, Arc::clone(&list));
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

        Ok(list)
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

impl SatisfiableRecipe for ReferenceListRecipe {
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
