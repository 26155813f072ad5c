//! Provider trait: a module of related recipe registrations.
//!
//! # Examples
//! ```rust
//! use blueprint_container::prelude::*;
//!
//! struct ConfigProvider;
//!
//! impl Provider for ConfigProvider {
//!     fn register(&self, registry: &mut dyn RecipeRegistry) {
//!         registry.register_recipe(std::sync::Arc::new(
//!             ValueRecipe::new(String::from("jdbc:h2:mem")).named("url"),
//!         ));
//!         registry.mark_lazy("url");
//!     }
//! }
//!
//! let container = BlueprintContainer::builder("app")
//!     .add_provider(&ConfigProvider)
//!     .build()
//!     .unwrap();
//! assert_eq!(container.component_names(), vec!["url"]);
//! ```

use std::sync::Arc;

use crate::recipe::Recipe;

/// A module that contributes recipes to a container.
///
/// Split large blueprints by concern, one provider per area.
pub trait Provider: Send + Sync {
    /// Register recipes. Called once while the container is assembled.
    fn register(&self, registry: &mut dyn RecipeRegistry);

    /// Human-readable name for diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The part of the container builder exposed to providers.
pub trait RecipeRegistry {
    /// Register a named top-level recipe.
    fn register_recipe(&mut self, recipe: Arc<dyn Recipe>);

    /// Exclude a component from eager creation.
    fn mark_lazy(&mut self, name: &str);
}
