//! Error types for Blueprint container operations.
//!
//! Errors carry enough context to find the offending component:
//! the full cycle for circular dependencies, suggestions for
//! unknown names and the service filter for unavailable services.

use std::fmt;

use blueprint_support::rendering::{render_chain, shorten_type_name};

/// Boxed error returned by user callbacks (factories, setters, listeners).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for all Blueprint operations.
#[derive(Debug, thiserror::Error)]
pub enum BlueprintError {
    /// Static or structural misconfiguration. Never retried.
    #[error("Component definition error: {message}")]
    ComponentDefinition {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Circular dependency between components that are not yet realized.
    #[error("{}", .0)]
    CircularDependency(CircularDependencyError),

    /// Requested component was never registered.
    #[error("{}", .0)]
    NoSuchComponent(NoSuchComponentError),

    /// No service is bound to a reference (timeout or container shutdown).
    #[error("{message}")]
    ServiceUnavailable { message: String, filter: String },

    /// A bind/unbind/registration listener failed. Logged, never propagated
    /// out of service tracking.
    #[error("Error invoking {action} on listener of {component}: {source}")]
    ListenerInvocation {
        component: String,
        action: &'static str,
        #[source]
        source: BoxError,
    },

    /// A factory, property setter or lifecycle callback failed.
    #[error("Failed to construct {name}: {source}")]
    ConstructionFailed {
        name: String,
        #[source]
        source: BoxError,
    },

    /// An instance could not be downcast to the requested type.
    #[error("{}", .0)]
    TypeMismatch(TypeMismatchError),
}

impl BlueprintError {
    /// Builds a [`BlueprintError::ComponentDefinition`] without a source.
    pub fn definition(message: impl Into<String>) -> Self {
        BlueprintError::ComponentDefinition {
            message: message.into(),
            source: None,
        }
    }

    /// Builds a [`BlueprintError::ServiceUnavailable`] for a filter.
    pub fn unavailable(message: impl Into<String>, filter: impl Into<String>) -> Self {
        BlueprintError::ServiceUnavailable {
            message: message.into(),
            filter: filter.into(),
        }
    }

    /// Returns `true` for errors a caller may recover from by retrying later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BlueprintError::ServiceUnavailable { .. })
    }
}

/// Error when a circular dependency is detected.
///
/// The chain starts and ends with the same component so the whole
/// circuit is visible. Anonymous intermediate components are left out.
#[derive(Debug, Clone)]
pub struct CircularDependencyError {
    /// Example: `["a", "b", "c", "a"]`
    pub chain: Vec<String>,
}

impl CircularDependencyError {
    /// Returns `true` if the named component takes part in the cycle.
    pub fn contains(&self, name: &str) -> bool {
        self.chain.iter().any(|n| n == name)
    }
}

impl fmt::Display for CircularDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circular dependency detected:\n  ")?;
        write!(f, "{}", render_chain(&self.chain))?;
        write!(
            f,
            "\n  Hint: inject one side through a property or a service reference instead of a constructor argument"
        )
    }
}

/// Error when a component name was never registered.
#[derive(Debug, Clone)]
pub struct NoSuchComponentError {
    /// The name that was requested
    pub name: String,
    /// What required this component (if known)
    pub required_by: Option<String>,
    /// Registered names that look similar
    pub suggestions: Vec<String>,
}

impl NoSuchComponentError {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_by: None,
            suggestions: Vec::new(),
        }
    }
}

impl fmt::Display for NoSuchComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "No component registered under name: {}", self.name)?;

        if let Some(ref parent) = self.required_by {
            write!(f, "\n  Required by: {parent}")?;
        }

        if !self.suggestions.is_empty() {
            write!(f, "\n  Did you mean one of:")?;
            for suggestion in &self.suggestions {
                write!(f, "\n    - {suggestion}")?;
            }
        }

        Ok(())
    }
}

/// Error when an instance is not of the type a caller asked for.
#[derive(Debug, Clone)]
pub struct TypeMismatchError {
    /// Component (or reference) the instance came from
    pub component: String,
    /// Fully qualified name of the requested type
    pub expected: &'static str,
}

impl fmt::Display for TypeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Type mismatch for {}: instance is not a {}",
            self.component,
            shorten_type_name(self.expected),
        )
    }
}

/// Convenient Result type for Blueprint operations.
pub type Result<T> = std::result::Result<T, BlueprintError>;
