//! Dependency ordering.
//!
//! Computes the order in which named components must be created so that
//! every component comes after the components it is constructed from.
//!
//! # Algorithm
//! Depth-first traversal from each requested name, keeping the current
//! path on a stack. Meeting a recipe that is already on the stack is a
//! circular dependency. Named recipes contribute their constructor
//! dependencies only; anonymous (inlined) recipes are expanded with all of
//! their dependencies, since they are created in place by their parent.
//! Components that are already realized are not entered again, which is
//! what breaks cycles through existing singletons.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::{BlueprintError, CircularDependencyError, NoSuchComponentError, Result};
use crate::recipe::{ExecutionContext, Recipe, recipe_id};
use blueprint_support::rendering::{ANONYMOUS, suggest_similar};

/// Topological sort over the recipes known to an execution context.
pub struct DependencyGraph<'a> {
    ctx: &'a dyn ExecutionContext,
}

#[derive(Default)]
struct Walk {
    /// Current DFS path
    stack: Vec<Arc<dyn Recipe>>,
    /// Fully visited recipes
    visited: HashSet<usize>,
    sorted: Vec<(String, Arc<dyn Recipe>)>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(ctx: &'a dyn ExecutionContext) -> Self {
        Self { ctx }
    }

    /// Named recipes reachable from `names`, dependencies first.
    ///
    /// # Errors
    /// - [`BlueprintError::NoSuchComponent`] if a requested name is unknown
    /// - [`BlueprintError::CircularDependency`] if the constructor graph
    ///   has a cycle through unrealized components
    #[instrument(skip(self), name = "dependency_sort")]
    pub fn sorted(&self, names: &[&str]) -> Result<Vec<(String, Arc<dyn Recipe>)>> {
        let mut walk = Walk::default();

        for &name in names {
            let recipe = self.ctx.get_recipe(name).ok_or_else(|| self.missing(name))?;
            self.visit(&mut walk, recipe)?;
        }

        debug!(
            requested = names.len(),
            ordered = walk.sorted.len(),
            "Dependency order computed"
        );
        Ok(walk.sorted)
    }

    fn visit(&self, walk: &mut Walk, recipe: Arc<dyn Recipe>) -> Result<()> {
        let id = recipe_id(&recipe);

        if walk.stack.iter().any(|r| recipe_id(r) == id) {
            let error = circular_chain(&walk.stack, &recipe);
            warn!(cycle = ?error.chain, "Circular dependency detected");
            return Err(BlueprintError::CircularDependency(error));
        }

        if walk.visited.contains(&id) {
            return Ok(());
        }

        if let Some(name) = recipe.name() {
            if self.ctx.get_instance(name).is_some() {
                walk.visited.insert(id);
                return Ok(());
            }
        }

        let dependencies = if recipe.name().is_some() {
            recipe.constructor_dependencies(self.ctx)
        } else {
            recipe.dependencies(self.ctx)
        };

        walk.stack.push(Arc::clone(&recipe));
        for dependency in dependencies {
            self.visit(walk, dependency)?;
        }
        walk.stack.pop();

        walk.visited.insert(id);
        if let Some(name) = recipe.name() {
            walk.sorted.push((name.to_string(), recipe));
        }
        Ok(())
    }

    fn missing(&self, name: &str) -> BlueprintError {
        let names = self.ctx.component_names();
        let available: Vec<&str> = names.iter().map(String::as_str).collect();
        BlueprintError::NoSuchComponent(NoSuchComponentError {
            name: name.to_string(),
            required_by: None,
            suggestions: suggest_similar(name, &available, 3),
        })
    }
}

/// Build the reported cycle for `repeated`, found again on `stack`.
///
/// The chain runs from the first occurrence of `repeated` to the top of the
/// stack and is closed with `repeated`. Anonymous recipes are dropped
/// except when one opens the chain.
pub(crate) fn circular_chain(
    stack: &[Arc<dyn Recipe>],
    repeated: &Arc<dyn Recipe>,
) -> CircularDependencyError {
    let id = recipe_id(repeated);
    let start = stack.iter().position(|r| recipe_id(r) == id).unwrap_or(0);

    let mut chain: Vec<String> = stack[start..]
        .iter()
        .enumerate()
        .filter_map(|(i, r)| match r.name() {
            Some(name) => Some(name.to_string()),
            None if i == 0 => Some(ANONYMOUS.to_string()),
            None => None,
        })
        .collect();
    chain.push(repeated.name().unwrap_or(ANONYMOUS).to_string());

    CircularDependencyError { chain }
}
