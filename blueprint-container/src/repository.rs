//! The component repository.
//!
//! Owns the recipes and the instances they produced. Construction is
//! serialized by one re-entrant lock: the thread that holds it may call
//! back into the repository while building nested components, every other
//! thread waits. Reads of completed instances go through concurrent maps and
//! never take the lock.
//!
//! # Lifecycle
//! ```text
//! register_recipe ──> validate ──> create / create_all ──> destroy_all
//!                                      │
//!                          partial objects visible while
//!                          a singleton is being wired
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{BlueprintError, NoSuchComponentError, Result};
use crate::graph::{DependencyGraph, circular_chain};
use crate::recipe::{
    ExecutionContext, IdRefRecipe, Instance, Recipe, RecipeKind, RefRecipe, ServiceRecipe,
    downcast_recipe, recipe_id,
};
use crate::tracker::{NoopSatisfactionListener, SatisfactionListener};

/// Name → recipe and name → instance maps plus the creation bookkeeping.
pub struct Repository {
    recipes: DashMap<String, Arc<dyn Recipe>>,
    instances: DashMap<String, Instance>,
    partial_objects: Mutex<HashMap<String, Instance>>,
    /// Names in order of completed construction
    creation_order: Mutex<Vec<String>>,
    /// Recipes currently being created, outermost first
    stack: Mutex<Vec<Arc<dyn Recipe>>>,
    instance_lock: ReentrantMutex<()>,
    satisfaction_listener: RwLock<Arc<dyn SatisfactionListener>>,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    pub fn new() -> Self {
        Self {
            recipes: DashMap::new(),
            instances: DashMap::new(),
            partial_objects: Mutex::new(HashMap::new()),
            creation_order: Mutex::new(Vec::new()),
            stack: Mutex::new(Vec::new()),
            instance_lock: ReentrantMutex::new(()),
            satisfaction_listener: RwLock::new(Arc::new(NoopSatisfactionListener)),
        }
    }

    // ── Recipes ──

    /// Register a named recipe.
    ///
    /// Replaces a recipe previously registered under the same name, unless
    /// that name has already been instantiated.
    pub fn register_recipe(&self, name: &str, recipe: Arc<dyn Recipe>) -> Result<()> {
        if recipe.name() != Some(name) {
            return Err(BlueprintError::definition(format!(
                "Recipe {recipe:?} cannot be registered under the name '{name}'"
            )));
        }
        if self.instances.contains_key(name) {
            return Err(BlueprintError::definition(format!(
                "Name '{name}' is already registered as an instance"
            )));
        }

        trace!(component = name, kind = %recipe.kind(), "Recipe registered");
        self.recipes.insert(name.to_string(), recipe);
        Ok(())
    }

    /// Remove a recipe that has not been instantiated yet.
    pub fn remove_recipe(&self, name: &str) -> Result<Option<Arc<dyn Recipe>>> {
        if self.instances.contains_key(name) {
            return Err(BlueprintError::definition(format!(
                "Name '{name}' is already instantiated and cannot be removed"
            )));
        }
        Ok(self.recipes.remove(name).map(|(_, recipe)| recipe))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.recipes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of the realized components, in completion order.
    pub fn creation_order(&self) -> Vec<String> {
        self.creation_order.lock().clone()
    }

    pub fn set_satisfaction_listener(&self, listener: Arc<dyn SatisfactionListener>) {
        *self.satisfaction_listener.write() = listener;
    }

    // ── Creation ──

    /// Realize one component.
    pub fn create(&self, name: &str) -> Result<Instance> {
        let mut created = self.create_all(&[name])?;
        created
            .remove(name)
            .ok_or_else(|| self.no_such_component(name))
    }

    /// Realize a batch of components in dependency order.
    ///
    /// Components completed before a failure stay realized.
    #[instrument(skip(self))]
    pub fn create_all(&self, names: &[&str]) -> Result<HashMap<String, Instance>> {
        let _guard = self.instance_lock.lock();

        let sorted = DependencyGraph::new(self).sorted(names)?;
        let mut created = HashMap::with_capacity(names.len());

        for (name, recipe) in sorted {
            let requested = names.contains(&name.as_str());
            let existing = self.get_instance(&name);
            let instance = match existing {
                Some(instance) => instance,
                None if recipe.is_prototype() && !requested => continue,
                None => self.create_recipe(&recipe)?,
            };
            if requested {
                created.insert(name, instance);
            }
        }

        debug!(requested = names.len(), realized = self.instances.len(), "Batch created");
        Ok(created)
    }

    fn add_full_object(&self, name: &str, instance: Instance) {
        self.instances.insert(name.to_string(), instance);
        self.creation_order.lock().push(name.to_string());
        self.remove_partial_object(name);
    }

    pub fn remove_partial_object(&self, name: &str) -> Option<Instance> {
        self.partial_objects.lock().remove(name)
    }

    // ── Destruction ──

    /// Destroy every realized component, last created first.
    #[instrument(skip(self))]
    pub fn destroy_all(&self) {
        let _guard = self.instance_lock.lock();

        let order = std::mem::take(&mut *self.creation_order.lock());
        info!(count = order.len(), "Destroying components");

        for name in order.iter().rev() {
            let Some((_, instance)) = self.instances.remove(name) else {
                continue;
            };
            let recipe = self.recipes.get(name).map(|r| Arc::clone(r.value()));
            match recipe {
                Some(recipe) => {
                    debug!(component = %name, "Destroying component");
                    recipe.destroy(&instance);
                }
                None => warn!(component = %name, "No recipe left to destroy instance"),
            }
        }

        self.instances.clear();
        self.partial_objects.lock().clear();
    }

    // ── Validation ──

    /// Check references between recipes.
    ///
    /// # Errors
    /// [`BlueprintError::ComponentDefinition`] when a ref or idref points to
    /// an unknown name, or a service or listener targets a `<service>` or
    /// `<reference-list>` component.
    #[instrument(skip(self))]
    pub fn validate(&self) -> Result<()> {
        let recipes = self.all_recipes(None);

        for recipe in &recipes {
            match recipe.kind() {
                RecipeKind::Ref => {
                    if let Some(reference) = downcast_recipe::<RefRecipe>(recipe) {
                        self.ensure_resolvable(reference.target())?;
                    }
                }
                RecipeKind::IdRef => {
                    if let Some(reference) = downcast_recipe::<IdRefRecipe>(recipe) {
                        self.ensure_resolvable(reference.target())?;
                    }
                }
                RecipeKind::Service => {
                    if let Some(service) = downcast_recipe::<ServiceRecipe>(recipe) {
                        self.ensure_target(service.target(), "<service>")?;
                        for listener in service.listener_components() {
                            self.ensure_target(&listener, "<registration-listener>")?;
                        }
                    }
                }
                RecipeKind::Reference | RecipeKind::ReferenceList => {
                    if let Some(satisfiable) = recipe.as_satisfiable() {
                        for listener in satisfiable.listener_components() {
                            self.ensure_target(&listener, "<reference-listener>")?;
                        }
                    }
                }
                _ => {}
            }
        }

        debug!(recipes = recipes.len(), "Repository validated");
        Ok(())
    }

    fn ensure_resolvable(&self, name: &str) -> Result<()> {
        if self.recipes.contains_key(name) || self.instances.contains_key(name) {
            Ok(())
        } else {
            Err(BlueprintError::definition(format!(
                "Unresolved ref/idref to component: {name}"
            )))
        }
    }

    fn ensure_target(&self, target: &Arc<dyn Recipe>, element: &str) -> Result<()> {
        let resolved = match downcast_recipe::<RefRecipe>(target) {
            Some(reference) => match self.get_recipe(reference.target()) {
                Some(recipe) => recipe,
                None => return Ok(()),
            },
            None => Arc::clone(target),
        };

        let forbidden = match resolved.kind() {
            RecipeKind::Service => "<service>",
            RecipeKind::ReferenceList => "<reference-list>",
            _ => return Ok(()),
        };
        Err(BlueprintError::definition(format!(
            "The target for a {element} element must not be {forbidden} element"
        )))
    }

    // ── Queries ──

    /// Recipes reachable from `names` (every registered name when `None`),
    /// each listed once.
    pub fn all_recipes(&self, names: Option<&[&str]>) -> Vec<Arc<dyn Recipe>> {
        let roots: Vec<Arc<dyn Recipe>> = match names {
            Some(names) => names.iter().filter_map(|n| self.get_recipe(n)).collect(),
            None => self
                .names()
                .iter()
                .filter_map(|n| self.get_recipe(n))
                .collect(),
        };

        let mut seen = HashSet::new();
        let mut collected = Vec::new();
        let mut pending = roots;
        pending.reverse();

        while let Some(recipe) = pending.pop() {
            if !seen.insert(recipe_id(&recipe)) {
                continue;
            }
            let mut dependencies = recipe.dependencies(self);
            dependencies.reverse();
            pending.extend(dependencies);
            collected.push(recipe);
        }
        collected
    }

    /// Every `<service>` recipe, nested ones included.
    pub fn service_recipes(&self) -> Vec<Arc<ServiceRecipe>> {
        self.all_recipes(None)
            .iter()
            .filter_map(downcast_recipe::<ServiceRecipe>)
            .collect()
    }

    fn no_such_component(&self, name: &str) -> BlueprintError {
        let names = self.names();
        let available: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut error = NoSuchComponentError::new(name);
        error.suggestions = blueprint_support::rendering::suggest_similar(name, &available, 3);
        BlueprintError::NoSuchComponent(error)
    }
}

impl ExecutionContext for Repository {
    fn create_recipe(&self, recipe: &Arc<dyn Recipe>) -> Result<Instance> {
        let _guard = self.instance_lock.lock();

        let name = recipe.name().filter(|_| !recipe.is_prototype());
        if let Some(name) = name {
            if let Some(instance) = self.get_instance(name) {
                return Ok(instance);
            }
            if let Some(partial) = self.get_partial_object(name) {
                return Ok(partial);
            }
        }

        {
            let mut stack = self.stack.lock();
            if stack.iter().any(|r| recipe_id(r) == recipe_id(recipe)) {
                let error = circular_chain(&stack, recipe);
                warn!(cycle = ?error.chain, "Circular dependency detected during creation");
                return Err(BlueprintError::CircularDependency(error));
            }
            stack.push(Arc::clone(recipe));
        }

        let result = recipe.create(self);
        self.stack.lock().pop();

        match result {
            Ok(instance) => {
                if let Some(name) = name {
                    self.add_full_object(name, Arc::clone(&instance));
                }
                Ok(instance)
            }
            Err(e) => {
                if let Some(name) = name {
                    self.remove_partial_object(name);
                }
                Err(e)
            }
        }
    }

    fn get_recipe(&self, name: &str) -> Option<Arc<dyn Recipe>> {
        self.recipes.get(name).map(|r| Arc::clone(r.value()))
    }

    fn get_instance(&self, name: &str) -> Option<Instance> {
        self.instances.get(name).map(|i| Arc::clone(i.value()))
    }

    fn contains_object(&self, name: &str) -> bool {
        self.recipes.contains_key(name) || self.instances.contains_key(name)
    }

    fn add_partial_object(&self, name: &str, instance: Instance) {
        self.partial_objects.lock().insert(name.to_string(), instance);
    }

    fn get_partial_object(&self, name: &str) -> Option<Instance> {
        self.partial_objects.lock().get(name).cloned()
    }

    fn satisfaction_listener(&self) -> Arc<dyn SatisfactionListener> {
        Arc::clone(&self.satisfaction_listener.read())
    }

    fn component_names(&self) -> Vec<String> {
        self.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::recipe::{BeanRecipe, ValueRecipe, instance_as};
    use crate::registry::InMemoryRegistry;
    use crate::scope::Scope;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn register(repo: &Repository, recipe: impl Recipe) {
        let recipe: Arc<dyn Recipe> = Arc::new(recipe);
        let name = recipe.name().map(str::to_string).unwrap();
        repo.register_recipe(&name, recipe).unwrap();
    }

    fn unit_bean(name: &str) -> BeanRecipe {
        BeanRecipe::new(|_| Ok(())).named(name)
    }

    #[test]
    fn dependencies_created_first() {
        let repo = Repository::new();
        register(
            &repo,
            unit_bean("a").depends_on(Arc::new(RefRecipe::new("b"))),
        );
        register(&repo, unit_bean("b"));

        let created = repo.create_all(&["a"]).unwrap();

        assert_eq!(created.len(), 1);
        assert!(repo.get_instance("a").is_some());
        assert!(repo.get_instance("b").is_some());
        assert_eq!(repo.creation_order(), vec!["b", "a"]);
    }

    #[test]
    fn arguments_are_injected() {
        let repo = Repository::new();
        register(&repo, ValueRecipe::new(20u32).named("base"));
        register(
            &repo,
            BeanRecipe::new(|args| Ok(*args.get::<u32>(0)? + 1))
                .named("next")
                .argument(Arc::new(RefRecipe::new("base"))),
        );

        let next = repo.create("next").unwrap();
        assert_eq!(*instance_as::<u32>("next", &next).unwrap(), 21);
    }

    #[test]
    fn concurrent_create_builds_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(Repository::new());
        register(&repo, {
            let calls = calls.clone();
            BeanRecipe::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                Ok(String::from("slow"))
            })
            .named("slow")
        });

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let repo = repo.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    repo.create("slow").unwrap()
                })
            })
            .collect();
        let results: Vec<Instance> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&results[0], &results[1]));
    }

    #[test]
    fn destroy_runs_in_reverse_creation_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let repo = Repository::new();
        for (name, deps) in [("a", vec!["b", "c"]), ("b", vec!["c"]), ("c", vec![])] {
            let mut recipe = BeanRecipe::new(|_| Ok(())).named(name).destroy_method({
                let log = log.clone();
                let name = name.to_string();
                move |_: &()| {
                    log.lock().push(name.clone());
                    Ok(())
                }
            });
            for dep in deps {
                recipe = recipe.depends_on(Arc::new(RefRecipe::new(dep)));
            }
            register(&repo, recipe);
        }

        repo.create_all(&["a"]).unwrap();
        assert_eq!(repo.creation_order(), vec!["c", "b", "a"]);

        repo.destroy_all();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(repo.creation_order().is_empty());
        assert!(repo.get_instance("a").is_none());
    }

    #[test]
    fn constructor_cycle_fails() {
        let repo = Repository::new();
        register(&repo, unit_bean("a").argument(Arc::new(RefRecipe::new("b"))));
        register(&repo, unit_bean("b").argument(Arc::new(RefRecipe::new("a"))));

        match repo.create("a") {
            Err(BlueprintError::CircularDependency(err)) => {
                assert!(err.contains("a"));
                assert!(err.contains("b"));
            }
            other => panic!("Expected CircularDependency, got: {other:?}"),
        }
        assert!(repo.creation_order().is_empty());
    }

    #[test]
    fn property_cycle_resolved_with_partial_object() {
        #[derive(Default)]
        struct Node {
            peer: once_cell::sync::OnceCell<Arc<Node>>,
        }

        let repo = Repository::new();
        register(
            &repo,
            BeanRecipe::new(|_| Ok(Node::default())).named("a").property(
                "peer",
                Arc::new(RefRecipe::new("b")),
                |node: &Node, peer: Arc<Node>| {
                    let _ = node.peer.set(peer);
                    Ok(())
                },
            ),
        );
        register(
            &repo,
            BeanRecipe::new(|_| Ok(Node::default())).named("b").property(
                "peer",
                Arc::new(RefRecipe::new("a")),
                |node: &Node, peer: Arc<Node>| {
                    let _ = node.peer.set(peer);
                    Ok(())
                },
            ),
        );

        let a = instance_as::<Node>("a", &repo.create("a").unwrap()).unwrap();
        let b = instance_as::<Node>("b", &repo.get_instance("b").unwrap()).unwrap();

        assert!(Arc::ptr_eq(a.peer.get().unwrap(), &b));
        assert!(Arc::ptr_eq(b.peer.get().unwrap(), &a));
        assert_eq!(repo.creation_order(), vec!["b", "a"]);
        assert!(repo.get_partial_object("a").is_none());
    }

    #[test]
    fn failed_batch_keeps_completed_components() {
        let repo = Repository::new();
        register(&repo, unit_bean("ok"));
        register(
            &repo,
            BeanRecipe::new(|_| Err::<(), BoxError>("boom".into()))
                .named("broken")
                .depends_on(Arc::new(RefRecipe::new("ok"))),
        );

        let result = repo.create_all(&["broken"]);
        assert!(matches!(result, Err(BlueprintError::ConstructionFailed { .. })));
        assert_eq!(repo.creation_order(), vec!["ok"]);
    }

    #[test]
    fn prototypes_are_not_cached() {
        let repo = Repository::new();
        register(
            &repo,
            BeanRecipe::new(|_| Ok(String::from("fresh")))
                .named("proto")
                .scope(Scope::Prototype),
        );

        let first = repo.create("proto").unwrap();
        let second = repo.create("proto").unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(repo.get_instance("proto").is_none());
        assert!(repo.creation_order().is_empty());
    }

    #[test]
    fn unknown_name_fails() {
        let repo = Repository::new();
        register(&repo, unit_bean("userService"));

        match repo.create("userServise") {
            Err(BlueprintError::NoSuchComponent(err)) => {
                assert_eq!(err.suggestions, vec!["userService"]);
            }
            other => panic!("Expected NoSuchComponent, got: {other:?}"),
        }
    }

    #[test]
    fn register_over_instance_fails() {
        let repo = Repository::new();
        register(&repo, unit_bean("a"));
        repo.create("a").unwrap();

        let again: Arc<dyn Recipe> = Arc::new(unit_bean("a"));
        assert!(repo.register_recipe("a", again).is_err());
        assert!(repo.remove_recipe("a").is_err());
    }

    #[test]
    fn register_under_wrong_name_fails() {
        let repo = Repository::new();
        let recipe: Arc<dyn Recipe> = Arc::new(unit_bean("a"));
        assert!(repo.register_recipe("b", recipe).is_err());
    }

    #[test]
    fn remove_unrealized_recipe() {
        let repo = Repository::new();
        register(&repo, unit_bean("a"));
        assert!(repo.remove_recipe("a").unwrap().is_some());
        assert!(repo.names().is_empty());
    }

    #[test]
    fn validate_reports_unresolved_ref() {
        let repo = Repository::new();
        register(&repo, unit_bean("a").argument(Arc::new(RefRecipe::new("missing"))));

        match repo.validate() {
            Err(BlueprintError::ComponentDefinition { message, .. }) => {
                assert_eq!(message, "Unresolved ref/idref to component: missing");
            }
            other => panic!("Expected ComponentDefinition, got: {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_service_of_service() {
        let registry = Arc::new(InMemoryRegistry::new());
        let repo = Repository::new();
        register(&repo, unit_bean("bean"));
        register(
            &repo,
            ServiceRecipe::new(Arc::new(RefRecipe::new("bean")), registry.clone())
                .named("inner")
                .interface("Foo"),
        );
        register(
            &repo,
            ServiceRecipe::new(Arc::new(RefRecipe::new("inner")), registry)
                .named("outer")
                .interface("Foo"),
        );

        match repo.validate() {
            Err(BlueprintError::ComponentDefinition { message, .. }) => {
                assert_eq!(
                    message,
                    "The target for a <service> element must not be <service> element"
                );
            }
            other => panic!("Expected ComponentDefinition, got: {other:?}"),
        }
    }

    #[test]
    fn all_recipes_include_nested() {
        let registry = Arc::new(InMemoryRegistry::new());
        let repo = Repository::new();
        register(&repo, unit_bean("bean"));
        register(
            &repo,
            unit_bean("holder").argument(Arc::new(
                ServiceRecipe::new(Arc::new(RefRecipe::new("bean")), registry).interface("Foo"),
            )),
        );

        assert_eq!(repo.service_recipes().len(), 1);
        assert_eq!(repo.all_recipes(Some(&["bean"])).len(), 1);
        // holder, service, ref, bean
        assert_eq!(repo.all_recipes(None).len(), 4);
    }
}
