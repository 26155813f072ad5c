//! Exported services.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::basic::RefRecipe;
use super::listener::{ListenerSpec, RegistrationListener, ResolvedListener, invoke_listener};
use super::{ExecutionContext, Instance, Recipe, RecipeKind, downcast_recipe};
use crate::error::{BlueprintError, Result};
use crate::service::{PropertyValue, ServiceHandle, ServiceProperties, ServiceRegistry, keys};
use blueprint_support::rendering::display_name;

#[derive(Default)]
struct ServiceState {
    registration: Option<ServiceHandle>,
    listeners: Vec<ResolvedListener<dyn RegistrationListener>>,
}

/// A `<service>`: registers the instance of its target recipe.
///
/// Creating the recipe registers the service and yields its
/// [`ServiceHandle`]; destroying it unregisters.
pub struct ServiceRecipe {
    name: Option<String>,
    target: Arc<dyn Recipe>,
    registry: Arc<dyn ServiceRegistry>,
    interfaces: Vec<String>,
    properties: ServiceProperties,
    ranking: i32,
    listeners: Vec<ListenerSpec<dyn RegistrationListener>>,
    explicit_dependencies: Vec<Arc<dyn Recipe>>,
    state: Mutex<ServiceState>,
}

impl ServiceRecipe {
    pub fn new(target: Arc<dyn Recipe>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            name: None,
            target,
            registry,
            interfaces: Vec::new(),
            properties: ServiceProperties::new(),
            ranking: 0,
            listeners: Vec::new(),
            explicit_dependencies: Vec::new(),
            state: Mutex::new(ServiceState::default()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.extend(interfaces.into_iter().map(Into::into));
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Ranking published as `service.ranking`; 0 is left implicit.
    pub fn ranking(mut self, ranking: i32) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn with_listener(mut self, listener: ListenerSpec<dyn RegistrationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn depends_on(mut self, recipe: Arc<dyn Recipe>) -> Self {
        self.explicit_dependencies.push(recipe);
        self
    }

    /// The recipe providing the service object.
    pub fn target(&self) -> &Arc<dyn Recipe> {
        &self.target
    }

    pub fn listener_components(&self) -> Vec<Arc<dyn Recipe>> {
        self.listeners.iter().map(|l| Arc::clone(l.component())).collect()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registration.is_some()
    }

    pub fn registration(&self) -> Option<ServiceHandle> {
        self.state.lock().registration.clone()
    }

    fn label(&self) -> &str {
        display_name(self.name.as_deref())
    }

    /// Name published under `osgi.service.blueprint.compname`.
    fn exported_component_name(&self) -> Option<String> {
        match downcast_recipe::<RefRecipe>(&self.target) {
            Some(reference) => Some(reference.target().to_string()),
            None => self.target.name().map(str::to_string),
        }
    }

    fn service_properties(&self) -> ServiceProperties {
        let mut properties = self.properties.clone();
        if self.ranking != 0 {
            properties.insert(
                keys::SERVICE_RANKING.to_string(),
                PropertyValue::Int(i64::from(self.ranking)),
            );
        }
        if let Some(component) = self.exported_component_name() {
            properties
                .entry(keys::COMPONENT_NAME.to_string())
                .or_insert(PropertyValue::Str(component));
        }
        properties
    }

    /// Withdraw the service. Returns `false` if it was not registered.
    pub fn unregister(&self) -> bool {
        let (registration, listeners) = {
            let mut state = self.state.lock();
            let Some(registration) = state.registration.take() else {
                return false;
            };
            (registration, std::mem::take(&mut state.listeners))
        };

        self.registry.unregister(&registration);
        info!(service = self.label(), id = registration.id(), "Service unregistered");
        for resolved in &listeners {
            invoke_listener(&resolved.component, "unregistered", || {
                resolved.listener.unregistered(&registration)
            });
        }
        true
    }

    /// Unregister, then run `on_drained` once every consumer that acquired
    /// the service has released it.
    pub fn quiesce(&self, on_drained: impl FnOnce() + Send + 'static) {
        let Some(registration) = self.registration() else {
            on_drained();
            return;
        };
        self.unregister();

        debug!(
            service = self.label(),
            id = registration.id(),
            "Waiting for consumers to release the service"
        );
        self.registry.when_released(&registration, Box::new(on_drained));
    }
}

impl fmt::Debug for ServiceRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRecipe")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("interfaces", &self.interfaces)
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Recipe for ServiceRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::Service
    }

    fn dependencies(&self, ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        let mut dependencies = self.constructor_dependencies(ctx);
        dependencies.extend(self.listener_components());
        dependencies
    }

    fn constructor_dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        let mut dependencies = self.explicit_dependencies.clone();
        dependencies.push(Arc::clone(&self.target));
        dependencies
    }

    fn create(&self, ctx: &dyn ExecutionContext) -> Result<Instance> {
        if let Some(registration) = self.registration() {
            return Ok(Arc::new(registration));
        }

        for dependency in &self.explicit_dependencies {
            ctx.create_recipe(dependency)?;
        }

        if self.interfaces.is_empty() {
            return Err(BlueprintError::definition(format!(
                "Service '{}' does not declare any interface",
                self.label()
            )));
        }

        let service = ctx.create_recipe(&self.target)?;
        let listeners = self
            .listeners
            .iter()
            .map(|spec| spec.resolve(ctx))
            .collect::<Result<Vec<_>>>()?;

        let registration =
            self.registry
                .register(self.interfaces.clone(), self.service_properties(), service)?;
        {
            let mut state = self.state.lock();
            state.registration = Some(registration.clone());
            state.listeners = listeners.clone();
        }

        info!(service = self.label(), registration = %registration, "Service registered");
        for resolved in &listeners {
            invoke_listener(&resolved.component, "registered", || {
                resolved.listener.registered(&registration)
            });
        }
        Ok(Arc::new(registration))
    }

    fn destroy(&self, _instance: &Instance) {
        self.unregister();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::recipe::testing::StubContext;
    use crate::recipe::{ValueRecipe, instance_as, registration_listener};
    use crate::registry::InMemoryRegistry;
    use crate::service::{ServiceFilter, ServiceRegistry};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl RegistrationListener for Recorder {
        fn registered(&self, service: &ServiceHandle) -> std::result::Result<(), BoxError> {
            self.calls.lock().push(format!("registered:{}", service.id()));
            Ok(())
        }

        fn unregistered(&self, service: &ServiceHandle) -> std::result::Result<(), BoxError> {
            self.calls.lock().push(format!("unregistered:{}", service.id()));
            Ok(())
        }
    }

    fn greeter_ctx() -> StubContext {
        StubContext::default().with(Arc::new(ValueRecipe::new("hello".to_string()).named("greeter")))
    }

    #[test]
    fn registers_target_with_properties() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe = ServiceRecipe::new(Arc::new(RefRecipe::new("greeter")), registry.clone())
            .named("greeterService")
            .interface("Greeter")
            .property("lang", "en")
            .ranking(3);
        let ctx = greeter_ctx();

        let instance = recipe.create(&ctx).unwrap();
        let handle = instance_as::<ServiceHandle>("greeterService", &instance).unwrap();

        assert_eq!(handle.ranking(), 3);
        assert_eq!(
            handle.property(keys::COMPONENT_NAME),
            Some(PropertyValue::Str("greeter".into()))
        );
        assert_eq!(handle.property("lang"), Some(PropertyValue::Str("en".into())));

        let found = registry.current(&ServiceFilter::new().component_name("greeter"));
        assert_eq!(found, vec![(*handle).clone()]);
        let service = registry.acquire(&handle).unwrap();
        assert_eq!(*instance_as::<String>("greeter", &service).unwrap(), "hello");
    }

    #[test]
    fn destroy_unregisters_and_notifies() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let recipe = ServiceRecipe::new(Arc::new(RefRecipe::new("greeter")), registry.clone())
            .interface("Greeter")
            .with_listener(registration_listener::<Recorder>(Arc::new(
                ValueRecipe::from_instance(recorder.clone() as Instance),
            )));

        let instance = recipe.create(&greeter_ctx()).unwrap();
        let id = recipe.registration().unwrap().id();
        recipe.destroy(&instance);
        recipe.destroy(&instance);

        assert!(registry.is_empty());
        assert!(!recipe.is_registered());
        assert_eq!(
            *recorder.calls.lock(),
            vec![format!("registered:{id}"), format!("unregistered:{id}")]
        );
    }

    #[test]
    fn service_without_interface_is_rejected() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe = ServiceRecipe::new(Arc::new(RefRecipe::new("greeter")), registry);
        let result = recipe.create(&greeter_ctx());
        assert!(matches!(result, Err(BlueprintError::ComponentDefinition { .. })));
    }

    #[test]
    fn quiesce_without_calls_completes_immediately() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe = ServiceRecipe::new(Arc::new(RefRecipe::new("greeter")), registry.clone())
            .interface("Greeter");
        recipe.create(&greeter_ctx()).unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        recipe.quiesce(move || flag.store(true, Ordering::SeqCst));

        assert!(drained.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[test]
    fn quiesce_waits_for_consumers_to_release() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe = ServiceRecipe::new(Arc::new(RefRecipe::new("greeter")), registry.clone())
            .interface("Greeter");
        recipe.create(&greeter_ctx()).unwrap();
        let handle = recipe.registration().unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        registry.acquire(&handle).unwrap();
        let flag = drained.clone();
        recipe.quiesce(move || flag.store(true, Ordering::SeqCst));

        assert!(!recipe.is_registered());
        assert!(registry.is_empty());
        assert!(!drained.load(Ordering::SeqCst));
        assert_eq!(registry.use_count(&handle), 1);

        registry.release(&handle);
        assert!(drained.load(Ordering::SeqCst));
    }

    #[test]
    fn quiesce_of_unregistered_service_completes() {
        let registry = Arc::new(InMemoryRegistry::new());
        let recipe = ServiceRecipe::new(Arc::new(RefRecipe::new("greeter")), registry)
            .interface("Greeter");

        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        recipe.quiesce(move || flag.store(true, Ordering::SeqCst));
        assert!(drained.load(Ordering::SeqCst));
    }
}
