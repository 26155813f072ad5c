//! # The Blueprint container
//!
//! Ties a [`Repository`] to the service registry: registers and validates
//! recipes, starts service reference tracking, waits for mandatory
//! references, creates the eager components and tears everything down
//! again.
//!
//! # Architecture
//! ```text
//! BlueprintContainerBuilder ──build()──> BlueprintContainer
//!                                              │
//!                                           start()
//!                                              │
//!                      ┌───────────────────────┼──────────────────────┐
//!                      ▼                       ▼                      ▼
//!              start trackers      wait for satisfaction      create_all(eager)
//! ```
//!
//! # Examples
//! ```rust
//! use blueprint_container::prelude::*;
//! use std::sync::Arc;
//!
//! struct Greeter {
//!     greeting: Arc<String>,
//! }
//!
//! let container = BlueprintContainer::builder("app")
//!     .recipe(ValueRecipe::new(String::from("hello")).named("greeting"))
//!     .recipe(
//!         BeanRecipe::new(|args| Ok(Greeter { greeting: args.get::<String>(0)? }))
//!             .named("greeter")
//!             .argument(Arc::new(RefRecipe::new("greeting"))),
//!     )
//!     .build()
//!     .expect("Failed to build container");
//!
//! container.start().expect("Failed to start container");
//! let greeter = container.component_instance_as::<Greeter>("greeter").unwrap();
//! assert_eq!(*greeter.greeting, "hello");
//! container.destroy();
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::{BlueprintError, Result};
use crate::provider::{Provider, RecipeRegistry};
use crate::quiesce::{QuiesceCallback, QuiesceCoordinator, QuiesceHandle, QuiesceUnit};
use crate::recipe::{ExecutionContext, Instance, Recipe, ServiceRecipe, instance_as};
use crate::repository::Repository;
use crate::settings::ContainerSettings;
use crate::tracker::SatisfactionListener;

// ============================================================
// BlueprintContainerBuilder
// ============================================================

/// Collects the recipes of a container.
///
/// Registration errors are kept and reported by
/// [`build()`](BlueprintContainerBuilder::build), so the builder can be
/// chained freely.
pub struct BlueprintContainerBuilder {
    name: String,
    settings: ContainerSettings,
    recipes: Vec<Arc<dyn Recipe>>,
    index: HashMap<String, usize>,
    lazy: HashSet<String>,
    errors: Vec<BlueprintError>,
}

impl BlueprintContainerBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            settings: ContainerSettings::default(),
            recipes: Vec::new(),
            index: HashMap::new(),
            lazy: HashSet::new(),
            errors: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: ContainerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Allow a later recipe to replace an earlier one with the same name.
    pub fn allow_override(mut self, allow: bool) -> Self {
        self.settings.allow_override = allow;
        self
    }

    /// Register a top-level (named) recipe.
    pub fn recipe(self, recipe: impl Recipe) -> Self {
        self.recipe_arc(Arc::new(recipe))
    }

    pub fn recipe_arc(mut self, recipe: Arc<dyn Recipe>) -> Self {
        RecipeRegistry::register_recipe(&mut self, recipe);
        self
    }

    /// Leave a component out of eager creation at start.
    pub fn lazy(mut self, name: impl Into<String>) -> Self {
        self.lazy.insert(name.into());
        self
    }

    /// Add a [`Provider`] module.
    pub fn add_provider(mut self, provider: &dyn Provider) -> Self {
        debug!(provider = provider.name(), "Adding provider");
        provider.register(&mut self);
        self
    }

    /// Build the container: register every recipe and validate references.
    #[instrument(skip(self), fields(container = %self.name), name = "container_build")]
    pub fn build(self) -> Result<BlueprintContainer> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(first);
        }

        info!(registered = self.recipes.len(), "Building container");
        let repository = Repository::new();
        for recipe in self.recipes {
            if let Some(name) = recipe.name().map(str::to_string) {
                repository.register_recipe(&name, recipe)?;
            }
        }
        repository.validate()?;

        let satisfaction = Arc::new(SatisfactionMonitor::default());
        repository.set_satisfaction_listener(satisfaction.clone());

        info!("Container built successfully");
        Ok(BlueprintContainer {
            name: self.name,
            settings: self.settings,
            repository,
            lazy: self.lazy,
            satisfaction,
            state: Mutex::new(ContainerState::Created),
            quiescer: OnceCell::new(),
        })
    }
}

impl RecipeRegistry for BlueprintContainerBuilder {
    fn register_recipe(&mut self, recipe: Arc<dyn Recipe>) {
        let Some(name) = recipe.name().map(str::to_string) else {
            self.errors.push(BlueprintError::definition(format!(
                "Top-level component {recipe:?} must be named"
            )));
            return;
        };

        match self.index.get(&name) {
            Some(&slot) if self.settings.allow_override => {
                debug!(component = %name, "Overriding component");
                self.recipes[slot] = recipe;
            }
            Some(_) => {
                self.errors.push(BlueprintError::definition(format!(
                    "Component '{name}' is already registered"
                )));
            }
            None => {
                self.index.insert(name, self.recipes.len());
                self.recipes.push(recipe);
            }
        }
    }

    fn mark_lazy(&mut self, name: &str) {
        self.lazy.insert(name.to_string());
    }
}

// ═══════════════════════════════════════════
// SatisfactionMonitor
// ═══════════════════════════════════════════

/// Wakes the container whenever a reference changes satisfaction.
#[derive(Default)]
struct SatisfactionMonitor {
    changes: Mutex<u64>,
    changed: Condvar,
}

impl SatisfactionListener for SatisfactionMonitor {
    fn notify_satisfaction(&self, component: Option<&str>, satisfied: bool) {
        let mut changes = self.changes.lock();
        *changes += 1;
        debug!(
            component = blueprint_support::rendering::display_name(component),
            satisfied,
            "Reference satisfaction changed"
        );
        self.changed.notify_all();
    }
}

// ═══════════════════════════════════════════
// BlueprintContainer
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
    Created,
    Starting,
    Running,
    Destroyed,
}

/// A running set of components.
///
/// Created by [`BlueprintContainerBuilder::build()`].
pub struct BlueprintContainer {
    name: String,
    settings: ContainerSettings,
    repository: Repository,
    lazy: HashSet<String>,
    satisfaction: Arc<SatisfactionMonitor>,
    state: Mutex<ContainerState>,
    quiescer: OnceCell<QuiesceCoordinator>,
}

impl BlueprintContainer {
    /// Create a new builder.
    pub fn builder(name: impl Into<String>) -> BlueprintContainerBuilder {
        BlueprintContainerBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Start tracking references, wait for the mandatory ones and create
    /// every eager component. Calling it again once running is a no-op.
    ///
    /// A failed start stops reference tracking and destroys whatever was
    /// created, leaving the container ready for another attempt.
    ///
    /// # Errors
    /// - [`BlueprintError::ServiceUnavailable`] if mandatory references stay
    ///   unsatisfied for the whole grace period
    /// - any error raised while creating the eager components
    /// - [`BlueprintError::ComponentDefinition`] if the container is already
    ///   starting or has been destroyed
    #[instrument(skip(self), fields(container = %self.name), name = "container_start")]
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ContainerState::Running => return Ok(()),
                ContainerState::Starting => {
                    return Err(BlueprintError::definition(format!(
                        "Container '{}' is already starting",
                        self.name
                    )));
                }
                ContainerState::Destroyed => return Err(self.destroyed()),
                ContainerState::Created => *state = ContainerState::Starting,
            }
        }

        let created = match self.start_components() {
            Ok(created) => created,
            Err(e) => {
                warn!(error = %e, "Container failed to start");
                self.tear_down();
                let mut state = self.state.lock();
                if *state == ContainerState::Starting {
                    *state = ContainerState::Created;
                }
                return Err(e);
            }
        };

        let destroyed = {
            let mut state = self.state.lock();
            if *state == ContainerState::Starting {
                *state = ContainerState::Running;
                false
            } else {
                true
            }
        };
        if destroyed {
            self.tear_down();
            return Err(self.destroyed());
        }

        info!(components = created, "Container started");
        Ok(())
    }

    fn start_components(&self) -> Result<usize> {
        let listener: Arc<dyn SatisfactionListener> = self.satisfaction.clone();
        for recipe in self.satisfiable_recipes() {
            if let Some(satisfiable) = recipe.as_satisfiable() {
                satisfiable.start(Arc::clone(&listener))?;
            }
        }

        if self.settings.wait_for_dependencies
            && !self.wait_for_satisfaction(self.settings.grace_period())
        {
            let missing = self.unsatisfied_filters();
            warn!(missing = ?missing, "Grace period expired");
            let filters = blueprint_support::rendering::render_list(&missing);
            return Err(BlueprintError::unavailable(
                format!(
                    "Timeout waiting for mandatory references of container '{}': {filters}",
                    self.name
                ),
                filters,
            ));
        }

        let eager = self.eager_names();
        let names: Vec<&str> = eager.iter().map(String::as_str).collect();
        self.repository.create_all(&names)?;
        Ok(names.len())
    }

    fn destroyed(&self) -> BlueprintError {
        BlueprintError::definition(format!("Container '{}' has been destroyed", self.name))
    }

    /// Returns `true` if [`start`](Self::start) has completed successfully
    /// and the container has not been destroyed since.
    pub fn is_running(&self) -> bool {
        *self.state.lock() == ContainerState::Running
    }

    /// Returns `true` when every started reference is satisfied.
    pub fn is_satisfied(&self) -> bool {
        self.satisfiable_recipes().iter().all(|recipe| {
            recipe
                .as_satisfiable()
                .is_none_or(|s| !s.is_started() || s.is_satisfied())
        })
    }

    /// Block until every reference is satisfied or `timeout` elapses.
    pub fn wait_for_satisfaction(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut changes = self.satisfaction.changes.lock();
        loop {
            if self.is_satisfied() {
                return true;
            }
            if self
                .satisfaction
                .changed
                .wait_until(&mut changes, deadline)
                .timed_out()
            {
                return self.is_satisfied();
            }
        }
    }

    /// Filters of the mandatory references that are not satisfied.
    pub fn unsatisfied_filters(&self) -> Vec<String> {
        self.satisfiable_recipes()
            .iter()
            .filter_map(|recipe| recipe.as_satisfiable())
            .filter(|s| s.is_started() && !s.is_satisfied())
            .map(|s| s.filter().to_string())
            .collect()
    }

    /// The instance of a component, creating it (and what it depends on)
    /// if it has not been created yet.
    pub fn component_instance(&self, name: &str) -> Result<Instance> {
        self.repository.create(name)
    }

    /// Like [`component_instance`](Self::component_instance), downcast to `T`.
    pub fn component_instance_as<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let instance = self.component_instance(name)?;
        instance_as::<T>(name, &instance)
    }

    pub fn component_names(&self) -> Vec<String> {
        self.repository.names()
    }

    /// Unregister services, destroy components in reverse creation order
    /// and stop every reference.
    #[instrument(skip(self), fields(container = %self.name), name = "container_destroy")]
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state == ContainerState::Destroyed {
                return;
            }
            *state = ContainerState::Destroyed;
        }

        self.tear_down();
        if let Some(coordinator) = self.quiescer.get() {
            coordinator.shutdown();
        }
        info!("Container destroyed");
    }

    /// Unregister this container's services on a coordinator built from
    /// [`ContainerSettings::quiesce`], then notify `callback` once every
    /// consumer has released them.
    pub fn quiesce(self: &Arc<Self>, callback: Arc<dyn QuiesceCallback>) -> QuiesceHandle {
        let coordinator = self
            .quiescer
            .get_or_init(|| QuiesceCoordinator::new(self.settings.quiesce.clone()));
        let unit: Arc<dyn QuiesceUnit> = self.clone();
        coordinator.quiesce(callback, vec![unit])
    }

    fn tear_down(&self) {
        for service in self.repository.service_recipes() {
            service.unregister();
        }
        self.repository.destroy_all();
        for recipe in self.satisfiable_recipes() {
            if let Some(satisfiable) = recipe.as_satisfiable() {
                satisfiable.stop();
            }
        }
    }

    fn satisfiable_recipes(&self) -> Vec<Arc<dyn Recipe>> {
        self.repository
            .all_recipes(None)
            .into_iter()
            .filter(|recipe| recipe.as_satisfiable().is_some())
            .collect()
    }

    fn eager_names(&self) -> Vec<String> {
        self.repository
            .names()
            .into_iter()
            .filter(|name| !self.lazy.contains(name))
            .filter(|name| {
                self.repository
                    .get_recipe(name)
                    .is_some_and(|recipe| !recipe.is_prototype())
            })
            .collect()
    }
}

impl QuiesceUnit for BlueprintContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_recipes(&self) -> Vec<Arc<ServiceRecipe>> {
        self.repository.service_recipes()
    }
}

impl fmt::Debug for BlueprintContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueprintContainer")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .field("components", &self.repository.names().len())
            .finish()
    }
}

// ═══════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════

pub mod prelude {
    pub use super::{BlueprintContainer, BlueprintContainerBuilder};
    pub use crate::error::{BlueprintError, Result};
    pub use crate::provider::{Provider, RecipeRegistry};
    pub use crate::proxy::{DelegatingProxyFactory, ProxyFactory, ServiceProxy};
    pub use crate::quiesce::{QuiesceCallback, QuiesceCoordinator, QuiesceHandle, QuiesceUnit};
    pub use crate::recipe::{
        Availability, BeanRecipe, CollectionRecipe, Damping, IdRefRecipe, Instance, ListenerSpec,
        Recipe, RefRecipe, ReferenceListRecipe, ReferenceListener, ReferenceMetadata, ReferenceRecipe,
        RegistrationListener, ServiceList, ServiceRecipe, ValueRecipe, instance_as,
        reference_listener, registration_listener,
    };
    pub use crate::registry::InMemoryRegistry;
    pub use crate::scope::Scope;
    pub use crate::service::{
        PropertyValue, ServiceFilter, ServiceHandle, ServiceProperties, ServiceRegistry,
    };
    pub use crate::settings::{ContainerSettings, QuiesceSettings, RejectionPolicy};
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════
