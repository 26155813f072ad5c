//! Bean lifecycle scopes.
//!
//! Scopes determine how often a bean recipe is instantiated:
//! - [`Scope::Singleton`]: one instance per container
//! - [`Scope::Prototype`]: a new instance for every use
use std::fmt;

/// Defines the lifetime of a bean within the container.
///
/// # Examples
/// ```
/// use blueprint_container::scope::Scope;
///
/// assert!(Scope::Singleton.is_cached());
/// assert!(!Scope::Prototype.is_cached());
/// assert_eq!(Scope::default(), Scope::Singleton);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One instance shared by every consumer.
    ///
    /// Created the first time the component is requested (or at start for
    /// eager components), stored in the repository and destroyed with the
    /// container in reverse creation order.
    #[default]
    Singleton,

    /// A fresh instance every time the bean is injected or requested.
    ///
    /// Never stored in the repository, never published as a partial object
    /// and never destroyed by the container.
    Prototype,
}

impl Scope {
    /// Returns `true` if instances of this scope are kept by the repository.
    #[inline]
    pub fn is_cached(&self) -> bool {
        matches!(self, Scope::Singleton)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Singleton => write!(f, "singleton"),
            Scope::Prototype => write!(f, "prototype"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_singletons_are_cached() {
        assert!(Scope::Singleton.is_cached());
        assert!(!Scope::Prototype.is_cached());
    }

    #[test]
    fn display() {
        assert_eq!(Scope::Singleton.to_string(), "singleton");
        assert_eq!(Scope::Prototype.to_string(), "prototype");
    }
}
