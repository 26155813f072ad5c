//! Recipes: units of instantiation and destruction logic.
//!
//! Every component the container manages is described by a [`Recipe`].
//! Recipes form a graph through their dependencies; the
//! [`Repository`](crate::repository::Repository) walks that graph to
//! realize components in dependency order.
//!
//! ```text
//! BeanRecipe ──argument──> RefRecipe ──target──> ReferenceRecipe
//!     │                                               │
//!  property                                        tracker
//!     ▼                                               ▼
//! ValueRecipe                                  ServiceRegistry
//! ```

mod basic;
mod bean;
mod listener;
mod reference;
mod reference_list;
mod service;

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

pub use basic::{CollectionRecipe, IdRefRecipe, RefRecipe, ValueRecipe};
pub use bean::{Arguments, BeanRecipe};
pub use listener::{
    ListenerSpec, ReferenceListener, RegistrationListener, reference_listener,
    registration_listener,
};
pub use reference::{Availability, Damping, ReferenceMetadata, ReferenceRecipe};
pub use reference_list::{ReferenceListRecipe, ServiceList};
pub use service::ServiceRecipe;

use crate::error::{BlueprintError, Result, TypeMismatchError};
use crate::tracker::{SatisfactionListener, SatisfiableRecipe};

/// A realized component.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// The variant of a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipeKind {
    Bean,
    Value,
    Ref,
    IdRef,
    Collection,
    Service,
    Reference,
    ReferenceList,
}

impl fmt::Display for RecipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecipeKind::Bean => "bean",
            RecipeKind::Value => "value",
            RecipeKind::Ref => "ref",
            RecipeKind::IdRef => "idref",
            RecipeKind::Collection => "collection",
            RecipeKind::Service => "service",
            RecipeKind::Reference => "reference",
            RecipeKind::ReferenceList => "reference-list",
        };
        f.write_str(label)
    }
}

/// Instantiation logic for one component.
///
/// Recipes are immutable once registered, except for those that carry
/// service tracking or registration state.
pub trait Recipe: Send + Sync + 'static {
    /// Component name; `None` for anonymous (inlined) recipes.
    fn name(&self) -> Option<&str>;

    fn kind(&self) -> RecipeKind;

    /// Every recipe this one may create while running.
    fn dependencies(&self, ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>>;

    /// Dependencies that must be realized before this recipe starts.
    ///
    /// Property and listener edges are left out; cycles through them are
    /// resolved with partial objects.
    fn constructor_dependencies(&self, ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        self.dependencies(ctx)
    }

    /// Build the instance. Nested recipes are created through `ctx`.
    fn create(&self, ctx: &dyn ExecutionContext) -> Result<Instance>;

    /// Tear down an instance previously returned by [`create`](Self::create).
    fn destroy(&self, _instance: &Instance) {}

    /// Prototype recipes produce a fresh instance for every use.
    fn is_prototype(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Recipes tracking services expose their satisfaction state here.
    fn as_satisfiable(&self) -> Option<&dyn SatisfiableRecipe> {
        None
    }
}

impl fmt::Debug for dyn Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), blueprint_support::rendering::display_name(self.name()))
    }
}

/// The repository as seen by a running recipe.
pub trait ExecutionContext {
    /// Create (or fetch, for realized singletons) the instance of a recipe.
    fn create_recipe(&self, recipe: &Arc<dyn Recipe>) -> Result<Instance>;

    fn get_recipe(&self, name: &str) -> Option<Arc<dyn Recipe>>;

    /// Fully realized instance registered under `name`.
    fn get_instance(&self, name: &str) -> Option<Instance>;

    /// Returns `true` if a recipe or an instance exists under `name`.
    fn contains_object(&self, name: &str) -> bool;

    /// Publish a placeholder for a component still under construction.
    fn add_partial_object(&self, name: &str, instance: Instance);

    fn get_partial_object(&self, name: &str) -> Option<Instance>;

    /// Listener that service-tracking recipes report satisfaction changes to.
    fn satisfaction_listener(&self) -> Arc<dyn SatisfactionListener>;

    fn component_names(&self) -> Vec<String>;
}

/// Identity of a recipe, stable for as long as the recipe is alive.
#[inline]
pub fn recipe_id(recipe: &Arc<dyn Recipe>) -> usize {
    Arc::as_ptr(recipe) as *const () as usize
}

/// Downcast a shared recipe to its concrete type.
pub fn downcast_recipe<R: Recipe>(recipe: &Arc<dyn Recipe>) -> Option<Arc<R>> {
    Arc::clone(recipe).into_any().downcast::<R>().ok()
}

/// Downcast an instance, reporting the component it came from on failure.
pub fn instance_as<T: Send + Sync + 'static>(component: &str, instance: &Instance) -> Result<Arc<T>> {
    Arc::clone(instance).downcast::<T>().map_err(|_| {
        BlueprintError::TypeMismatch(TypeMismatchError {
            component: component.to_string(),
            expected: type_name::<T>(),
        })
    })
}
