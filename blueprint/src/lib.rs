//! # Blueprint: a component container for Rust
//!
//! Declarative components wired from recipes, with dynamic references to
//! services in a shared registry and graceful quiesce.
//!
//! ```rust
//! use blueprint::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(InMemoryRegistry::new());
//! let container = BlueprintContainer::builder("app")
//!     .recipe(ValueRecipe::new(42u32).named("answer"))
//!     .recipe(
//!         ServiceRecipe::new(Arc::new(RefRecipe::new("answer")), registry.clone())
//!             .named("answerService")
//!             .interface("Answer"),
//!     )
//!     .build()?;
//!
//! container.start()?;
//! assert_eq!(registry.len(), 1);
//! container.destroy();
//! assert!(registry.is_empty());
//! # Ok::<(), BlueprintError>(())
//! ```

pub use blueprint_container::*;
pub use blueprint_support::*;
