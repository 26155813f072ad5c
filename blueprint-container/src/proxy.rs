//! Dynamic proxies for service references.
//!
//! A proxy is a stable object handed to consumers in place of the real
//! service. Every call goes through a [`Dispatcher`] which asks the
//! reference for its current target, so the proxy keeps working while
//! the underlying service is replaced.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::error::{BlueprintError, Result, TypeMismatchError};
use crate::recipe::Instance;

/// Zero-argument supplier of the current service object.
///
/// Returns `Ok(None)` when no service is bound and absence is acceptable
/// (optional references), or an error such as
/// [`BlueprintError::ServiceUnavailable`].
pub type Dispatcher = Arc<dyn Fn() -> Result<Option<Instance>> + Send + Sync>;

/// Produces proxies for a set of interfaces.
///
/// Custom factories can return any type as long as it dispatches through
/// the supplied closure on every call.
pub trait ProxyFactory: Send + Sync {
    fn create_proxy(&self, interfaces: &[String], dispatcher: Dispatcher) -> Result<Instance>;
}

/// Default factory returning [`ServiceProxy`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelegatingProxyFactory;

impl ProxyFactory for DelegatingProxyFactory {
    fn create_proxy(&self, interfaces: &[String], dispatcher: Dispatcher) -> Result<Instance> {
        Ok(Arc::new(ServiceProxy::new(interfaces.to_vec(), dispatcher)))
    }
}

/// Proxy that resolves its target on every access.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use blueprint_container::proxy::ServiceProxy;
/// use blueprint_container::recipe::Instance;
///
/// let proxy = ServiceProxy::new(
///     vec!["app::Clock".into()],
///     Arc::new(|| Ok(Some(Arc::new(42u64) as Instance))),
/// );
/// assert_eq!(*proxy.require::<u64>().unwrap(), 42);
/// ```
pub struct ServiceProxy {
    interfaces: Vec<String>,
    dispatcher: Dispatcher,
}

impl ServiceProxy {
    pub fn new(interfaces: Vec<String>, dispatcher: Dispatcher) -> Self {
        Self {
            interfaces,
            dispatcher,
        }
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Current target, as returned by the dispatcher.
    pub fn target(&self) -> Result<Option<Instance>> {
        (self.dispatcher)()
    }

    /// Current target downcast to `T`.
    pub fn target_as<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        match self.target()? {
            Some(instance) => instance.downcast::<T>().map(Some).map_err(|_| {
                BlueprintError::TypeMismatch(TypeMismatchError {
                    component: self.describe(),
                    expected: type_name::<T>(),
                })
            }),
            None => Ok(None),
        }
    }

    /// Current target downcast to `T`, failing when nothing is bound.
    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.target_as::<T>()?.ok_or_else(|| {
            BlueprintError::unavailable(
                format!("No service is bound to the proxy for {}", self.describe()),
                self.describe(),
            )
        })
    }

    fn describe(&self) -> String {
        format!("[{}]", self.interfaces.join(", "))
    }
}

impl fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("interfaces", &self.interfaces)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn proxy_follows_dispatcher() {
        let current: Arc<Mutex<Option<Instance>>> = Arc::new(Mutex::new(None));
        let factory = DelegatingProxyFactory;

        let proxy = factory
            .create_proxy(&["Clock".into()], {
                let current = current.clone();
                Arc::new(move || Ok(current.lock().clone()))
            })
            .unwrap();
        let proxy = proxy.downcast::<ServiceProxy>().unwrap();

        assert!(proxy.target().unwrap().is_none());

        *current.lock() = Some(Arc::new(1u32));
        assert_eq!(*proxy.require::<u32>().unwrap(), 1);

        *current.lock() = Some(Arc::new(2u32));
        assert_eq!(*proxy.require::<u32>().unwrap(), 2);
    }

    #[test]
    fn missing_target_is_unavailable() {
        let proxy = ServiceProxy::new(vec!["Clock".into()], Arc::new(|| Ok(None)));
        match proxy.require::<u32>() {
            Err(BlueprintError::ServiceUnavailable { message, .. }) => {
                assert!(message.contains("Clock"));
            }
            other => panic!("Expected ServiceUnavailable, got: {other:?}"),
        }
    }

    #[test]
    fn wrong_type_is_reported() {
        let proxy = ServiceProxy::new(
            vec!["Clock".into()],
            Arc::new(|| Ok(Some(Arc::new("tick") as Instance))),
        );
        assert!(matches!(
            proxy.target_as::<u32>(),
            Err(BlueprintError::TypeMismatch(_))
        ));
    }
}
