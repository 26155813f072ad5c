//! Value, reference and collection recipes.

use std::any::Any;
use std::sync::Arc;

use tracing::trace;

use super::{ExecutionContext, Instance, Recipe, RecipeKind};
use crate::error::{BlueprintError, NoSuchComponentError, Result};

fn no_such_component(ctx: &dyn ExecutionContext, name: &str) -> BlueprintError {
    let names = ctx.component_names();
    let available: Vec<&str> = names.iter().map(String::as_str).collect();
    BlueprintError::NoSuchComponent(NoSuchComponentError {
        name: name.to_string(),
        required_by: None,
        suggestions: blueprint_support::rendering::suggest_similar(name, &available, 3),
    })
}

// ═══════════════════════════════════════════
// ValueRecipe
// ═══════════════════════════════════════════

/// A literal value, returned as-is.
pub struct ValueRecipe {
    name: Option<String>,
    value: Instance,
}

impl ValueRecipe {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self::from_instance(Arc::new(value))
    }

    pub fn from_instance(value: Instance) -> Self {
        Self { name: None, value }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Recipe for ValueRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::Value
    }

    fn dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        Vec::new()
    }

    fn create(&self, _ctx: &dyn ExecutionContext) -> Result<Instance> {
        Ok(Arc::clone(&self.value))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ═══════════════════════════════════════════
// RefRecipe
// ═══════════════════════════════════════════

/// Injects another named component.
///
/// Resolves to the realized instance, the partial object of a component
/// still under construction, or creates the target on demand.
pub struct RefRecipe {
    name: Option<String>,
    target: String,
}

impl RefRecipe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            name: None,
            target: target.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name of the referenced component.
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Recipe for RefRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::Ref
    }

    fn dependencies(&self, ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        ctx.get_recipe(&self.target).into_iter().collect()
    }

    fn create(&self, ctx: &dyn ExecutionContext) -> Result<Instance> {
        if let Some(instance) = ctx.get_instance(&self.target) {
            return Ok(instance);
        }
        if let Some(partial) = ctx.get_partial_object(&self.target) {
            trace!(component = %self.target, "Resolved reference to partial object");
            return Ok(partial);
        }
        match ctx.get_recipe(&self.target) {
            Some(recipe) => ctx.create_recipe(&recipe),
            None => Err(no_such_component(ctx, &self.target)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ═══════════════════════════════════════════
// IdRefRecipe
// ═══════════════════════════════════════════

/// Injects the *name* of another component as an `Arc<String>`, after
/// checking that it exists.
pub struct IdRefRecipe {
    name: Option<String>,
    target: String,
}

impl IdRefRecipe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            name: None,
            target: target.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Recipe for IdRefRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::IdRef
    }

    fn dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        Vec::new()
    }

    fn create(&self, ctx: &dyn ExecutionContext) -> Result<Instance> {
        if !ctx.contains_object(&self.target) {
            return Err(no_such_component(ctx, &self.target));
        }
        Ok(Arc::new(self.target.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ═══════════════════════════════════════════
// CollectionRecipe
// ═══════════════════════════════════════════

/// Creates every item and yields them as an `Arc<Vec<Instance>>`.
pub struct CollectionRecipe {
    name: Option<String>,
    items: Vec<Arc<dyn Recipe>>,
}

impl CollectionRecipe {
    pub fn new(items: Vec<Arc<dyn Recipe>>) -> Self {
        Self { name: None, items }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn push(mut self, item: Arc<dyn Recipe>) -> Self {
        self.items.push(item);
        self
    }
}

impl Recipe for CollectionRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> RecipeKind {
        RecipeKind::Collection
    }

    fn dependencies(&self, _ctx: &dyn ExecutionContext) -> Vec<Arc<dyn Recipe>> {
        self.items.clone()
    }

    fn create(&self, ctx: &dyn ExecutionContext) -> Result<Instance> {
        let items = self
            .items
            .iter()
            .map(|item| ctx.create_recipe(item))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(items))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
