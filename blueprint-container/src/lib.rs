//! Core of the Blueprint component container.

pub mod container;
pub mod error;
pub mod graph;
pub mod provider;
pub mod proxy;
pub mod quiesce;
pub mod recipe;
pub mod registry;
pub mod repository;
pub mod scope;
pub mod service;
pub mod settings;
pub mod tracker;

pub use container::{BlueprintContainer, BlueprintContainerBuilder, prelude};
pub use error::{BlueprintError, Result};
pub use scope::Scope;
