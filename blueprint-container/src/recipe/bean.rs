//! Bean recipes: components built by a factory closure.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{ExecutionContext, Instance, Recipe, RecipeKind, instance_as};
use crate::error::{BlueprintError, BoxError, Result, TypeMismatchError};
use crate::scope::Scope;
use blueprint_support::rendering::display_name;

type Factory = Arc<dyn Fn(&Arguments) -> std::result::Result<Instance, BoxError> + Send + Sync>;
type Callback = Arc<dyn Fn(&Instance) -> std::result::Result<(), BoxError> + Send + Sync>;
type Setter = Arc<dyn Fn(&Instance, Instance) -> std::result::Result<(), BoxError> + Send + Sync>;

struct Property {
    name: String,
    recipe: Arc<dyn Recipe>,
    setter: Setter,
}

/// Constructor arguments handed to a bean factory, in declaration order.
pub struct Arguments {
    component: String,
    values: Vec<Instance>,
}

impl Arguments {
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Untyped argument at `index`.
    pub fn instance(&self, index: usize) -> Result<Instance> {
        self.values.get(index).cloned().ok_or_else(|| {
            BlueprintError::definition(format!(
                "{} has no constructor argument at index {index} ({} declared)",
                self.component,
                self.values.len()
            ))
        })
    }

    /// Argument at `index`, downcast to `T`.
    ///
    /// ```rust,ignore
    /// BeanRecipe::new(|args| Ok(UserService { repo: args.get::<UserRepo>(0)? }))
    /// ```
    pub fn get<T: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>> {
        let instance = self.instance(index)?;
        instance_as::<T>(&format!("argument {index} of {}", self.component), &instance)
    }
}

fn downcast_bean<T: Send + Sync + 'static>(instance: &Instance) -> std::result::Result<&T, BoxError> {
    instance.downcast_ref::<T>().ok_or_else(|| {
        Box::new(BlueprintError::TypeMismatch(TypeMismatchError {
            component: "bean instance".to_string(),
            expected: type_name::<T>(),
        })) as BoxError
    })
}

/// A component produced by a factory, then wired through properties.
///
/// Creation runs in this order: explicit dependencies, constructor
/// arguments, the factory, property injection, the init method. A named
/// singleton publishes itself as a partial object right after the factory
/// returns, so property cycles resolve to the instance under construction.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use blueprint_container::recipe::{BeanRecipe, RefRecipe};
///
/// struct Repo;
/// struct Service { repo: Arc<Repo> }
///
/// let repo = BeanRecipe::new(|_| Ok(Repo)).named("repo");
/// let service = BeanRecipe::new(|args| Ok(Service { repo: args.get::<Repo>(0)? }))
///     .named("service")
///     .argument(Arc::new(RefRecipe::new("repo")));
/// ```
pub struct BeanRecipe {
    name: Option<String>,
    type_name: &'static str,
    scope: Scope,
    factory: Factory,
    arguments: Vec<Arc<dyn Recipe>>,
    properties: Vec<Property>,
    explicit_dependencies: Vec<Arc<dyn Recipe>>,
    init_method: Option<Callback>,
    destroy_method: Option<Callback>,
}

impl BeanRecipe {
    /// Bean built by a typed factory; the value is stored as `Arc<T>`.
    pub fn new<T, F>(factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Arguments) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let mut recipe = Self::from_factory(move |args| Ok(Arc::new(factory(args)?) as Instance));
        recipe.type_name = type_name::<T>();
        recipe
    }

    /// Bean built by a factory that already produces an [`Instance`].
    pub fn from_factory(
        factory: impl Fn(&Arguments) -> std::result::Result<Instance, BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: None,
            type_name: "dyn Any",
            scope: Scope::Singleton,
            factory: Arc::new(factory),
            arguments: Vec::new(),
            properties: Vec::new(),
            explicit_dependencies: Vec::new(),
            init_method: None,
            destroy_method: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Append a constructor argument.
    pub fn argument(mut self, recipe: Arc<dyn Recipe>) -> Self {
        self.arguments.push(recipe);
        self
    }

    /// Inject a property after construction.
    ///
    /// Beans are shared behind `Arc`, so setters need interior mutability
    /// (a `OnceCell`, `Mutex` or similar) on the bean type.
    pub fn property<T, V>(
        mut self,
        name: impl Into<String>,
        recipe: Arc<dyn Recipe>,
        setter: impl Fn(&T, Arc<V>) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self
    where
        T: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let name = name.into();
        let property = name.clone();
        self.properties.push(Property {
            name,
            recipe,
            setter: Arc::new(move |bean: &Instance, value: Instance| {
                let bean = downcast_bean::<T>(bean)?;
                let value = instance_as::<V>(&format!("property {property}"), &value)?;
                setter(bean, value)
            }),
        });
        self
    }

    /// Run after all properties are injected.
    pub fn init_method<T: Send + Sync + 'static>(
        mut self,
        f: impl Fn(&T) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.init_method = Some(Arc::new(move |bean: &Instance| f(downcast_bean::<T>(bean)?)));
        self
    }

    /// Run when the container destroys the bean.
    pub fn destroy_method<T: Send + Sync + 'static>(
        mut self,
        f: impl Fn(&T) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.destroy_method = Some(Arc::new(move |bean: &Instance| f(downcast_bean::<T>(bean)?)));
        self
    }

    /// Realize `recipe` before this bean, without injecting it.
    pub fn depends_on(mut self, recipe: Arc<dyn Recipe>) -> Self {
        self.explicit_dependencies.push(recipe);
        self
    }

    fn label(&self) -> String {
        display_name(self.name.as_deref()).to_string()
    }

    fn failed(&self, source: BoxError) -> BlueprintError {
        BlueprintError::ConstructionFailed {
            name: self.label(),
            source,
        }
    }
}

impl fmt::Debug for BeanRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanRecipe")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("scope", &self.scope)
            .field("arguments", &self.arguments.len())
            .field(
                "properties",
                &self.properties.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Recipe for BeanRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::Bean
    }

    fn dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        self.explicit_dependencies
            .iter()
            .chain(&self.arguments)
            .cloned()
            .chain(self.properties.iter().map(|p| Arc::clone(&p.recipe)))
            .collect()
    }

    fn constructor_dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        self.explicit_dependencies
            .iter()
            .chain(&self.arguments)
            .cloned()
            .collect()
    }

    fn create(&self, ctx: &dyn ExecutionContext) -> Result<Instance> {
        for dependency in &self.explicit_dependencies {
            ctx.create_recipe(dependency)?;
        }

        let values = self
            .arguments
            .iter()
            .map(|argument| ctx.create_recipe(argument))
            .collect::<Result<Vec<_>>>()?;
        let arguments = Arguments {
            component: self.label(),
            values,
        };

        trace!(bean = %self.label(), ty = self.type_name, "Invoking factory");
        let instance = (self.factory)(&arguments).map_err(|e| self.failed(e))?;

        if let Some(name) = self.name.as_deref() {
            if self.scope.is_cached() {
                ctx.add_partial_object(name, Arc::clone(&instance));
            }
        }

        for property in &self.properties {
            let value = ctx.create_recipe(&property.recipe)?;
            (property.setter)(&instance, value).map_err(|e| self.failed(e))?;
        }

        if let Some(ref init) = self.init_method {
            init(&instance).map_err(|e| self.failed(e))?;
        }

        debug!(bean = %self.label(), scope = %self.scope, "Bean created");
        Ok(instance)
    }

    fn destroy(&self, instance: &Instance) {
        if let Some(ref destroy) = self.destroy_method {
            if let Err(error) = destroy(instance) {
                warn!(bean = %self.label(), %error, "Destroy method failed");
            }
        }
    }

    fn is_prototype(&self) -> bool {
        !self.scope.is_cached()
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
    use crate::recipe::testing::StubContext;
    use crate::recipe::{RefRecipe, ValueRecipe};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Greeter {
        greeting: Arc<String>,
        audience: Mutex<Option<Arc<String>>>,
        ready: Mutex<bool>,
    }

    fn greeter_recipe() -> BeanRecipe {
        BeanRecipe::new(|args| {
            Ok(Greeter {
                greeting: args.get::<String>(0)?,
                audience: Mutex::new(None),
                ready: Mutex::new(false),
            })
        })
        .named("greeter")
        .argument(Arc::new(ValueRecipe::new(String::from("hello"))))
    }

    #[test]
    fn factory_receives_arguments() {
        let ctx = StubContext::default();
        let instance = greeter_recipe().create(&ctx).unwrap();
        let greeter = instance_as::<Greeter>("greeter", &instance).unwrap();
        assert_eq!(*greeter.greeting, "hello");
    }

    #[test]
    fn properties_then_init() {
        let ctx = StubContext::default();
        let recipe = greeter_recipe()
            .property(
                "audience",
                Arc::new(ValueRecipe::new(String::from("world"))),
                |g: &Greeter, v: Arc<String>| {
                    *g.audience.lock() = Some(v);
                    Ok(())
                },
            )
            .init_method(|g: &Greeter| {
                if g.audience.lock().is_none() {
                    return Err("audience not injected".into());
                }
                *g.ready.lock() = true;
                Ok(())
            });

        let instance = recipe.create(&ctx).unwrap();
        let greeter = instance_as::<Greeter>("greeter", &instance).unwrap();
        assert_eq!(greeter.audience.lock().as_deref().map(String::as_str), Some("world"));
        assert!(*greeter.ready.lock());
    }

    #[test]
    fn named_singleton_publishes_partial_object() {
        let ctx = StubContext::default();
        let seen = Arc::new(AtomicU32::new(0));

        let recipe = greeter_recipe().property(
            "audience",
            Arc::new(ValueRecipe::new(String::from("x"))),
            {
                let seen = seen.clone();
                move |_: &Greeter, _: Arc<String>| {
                    seen.store(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        recipe.create(&ctx).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(ctx.get_partial_object("greeter").is_some());
    }

    #[test]
    fn prototype_does_not_publish_partial_object() {
        let ctx = StubContext::default();
        let recipe = greeter_recipe().scope(Scope::Prototype);
        assert!(recipe.is_prototype());

        recipe.create(&ctx).unwrap();
        assert!(ctx.get_partial_object("greeter").is_none());
    }

    #[test]
    fn factory_error_becomes_construction_failed() {
        let ctx = StubContext::default();
        let recipe = BeanRecipe::new::<u32, _>(|_| Err("disk full".into())).named("broken");

        match recipe.create(&ctx) {
            Err(BlueprintError::ConstructionFailed { name, source }) => {
                assert_eq!(name, "broken");
                assert_eq!(source.to_string(), "disk full");
            }
            other => panic!("Expected ConstructionFailed, got: {other:?}"),
        }
    }

    #[test]
    fn missing_argument_is_reported() {
        let ctx = StubContext::default();
        let recipe = BeanRecipe::new(|args| Ok(*args.get::<u32>(0)?)).named("lonely");

        match recipe.create(&ctx) {
            Err(BlueprintError::ConstructionFailed { source, .. }) => {
                assert!(source.to_string().contains("no constructor argument at index 0"));
            }
            other => panic!("Expected ConstructionFailed, got: {other:?}"),
        }
    }

    #[test]
    fn explicit_dependencies_are_created_first() {
        let ctx = StubContext::default().with(Arc::new(ValueRecipe::new(1u8).named("first")));
        let recipe = BeanRecipe::new(|_| Ok(0u8))
            .named("second")
            .depends_on(Arc::new(RefRecipe::new("first")));

        recipe.create(&ctx).unwrap();
        assert!(ctx.get_instance("first").is_some());
    }

    #[test]
    fn constructor_dependencies_exclude_properties() {
        let ctx = StubContext::default();
        let recipe = greeter_recipe().property(
            "audience",
            Arc::new(ValueRecipe::new(String::from("x"))),
            |_: &Greeter, _: Arc<String>| Ok(()),
        );

        assert_eq!(recipe.dependencies(&ctx).len(), 2);
        assert_eq!(recipe.constructor_dependencies(&ctx).len(), 1);
    }

    #[test]
    fn destroy_method_runs() {
        let ctx = StubContext::default();
        let destroyed = Arc::new(AtomicU32::new(0));
        let recipe = BeanRecipe::new(|_| Ok(5u32)).destroy_method({
            let destroyed = destroyed.clone();
            move |v: &u32| {
                destroyed.store(*v, Ordering::SeqCst);
                Ok(())
            }
        });

        let instance = recipe.create(&ctx).unwrap();
        recipe.destroy(&instance);
        assert_eq!(destroyed.load(Ordering::SeqCst), 5);
    }
}
