//! Statically typed reference and registration listeners.
//!
//! Listener components are ordinary recipes. A [`ListenerSpec`] pairs the
//! component with an adapter that turns its instance into the listener
//! trait object, so loaders resolve callbacks once at load time instead of
//! looking them up on every event.

use std::any::type_name;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::error;

use super::{ExecutionContext, Instance, Recipe, instance_as};
use crate::error::{BlueprintError, BoxError, Result};
use crate::service::ServiceHandle;
use blueprint_support::rendering::display_name;

/// Receives bind/unbind callbacks from a service reference.
pub trait ReferenceListener: Send + Sync {
    /// A service was bound (or, for lists, added).
    fn bind(&self, reference: &ServiceHandle) -> std::result::Result<(), BoxError>;

    /// A service went away. `None` signals that the reference currently
    /// has nothing bound, as sent once when listeners are installed.
    fn unbind(&self, reference: Option<&ServiceHandle>) -> std::result::Result<(), BoxError>;
}

/// Receives callbacks when an exported service is registered or
/// unregistered.
pub trait RegistrationListener: Send + Sync {
    fn registered(&self, service: &ServiceHandle) -> std::result::Result<(), BoxError>;

    fn unregistered(&self, service: &ServiceHandle) -> std::result::Result<(), BoxError>;
}

type Adapter<L> = Arc<dyn Fn(Instance) -> Result<Arc<L>> + Send + Sync>;

/// A listener component plus the adapter producing the listener object.
pub struct ListenerSpec<L: ?Sized> {
    component: Arc<dyn Recipe>,
    adapter: Adapter<L>,
}

impl<L: ?Sized> Clone for ListenerSpec<L> {
    fn clone(&self) -> Self {
        Self {
            component: Arc::clone(&self.component),
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<L: ?Sized> ListenerSpec<L> {
    pub fn new(
        component: Arc<dyn Recipe>,
        adapter: impl Fn(Instance) -> Result<Arc<L>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            component,
            adapter: Arc::new(adapter),
        }
    }

    /// The recipe that provides the listener instance.
    pub fn component(&self) -> &Arc<dyn Recipe> {
        &self.component
    }

    /// Create the listener component and adapt it.
    pub(crate) fn resolve(&self, ctx: &dyn ExecutionContext) -> Result<ResolvedListener<L>> {
        let instance = ctx.create_recipe(&self.component)?;
        Ok(ResolvedListener {
            component: display_name(self.component.name()).to_string(),
            listener: (self.adapter)(instance)?,
        })
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSpec<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSpec")
            .field("component", &self.component)
            .field("listener", &type_name::<L>())
            .finish()
    }
}

/// Adapt a component whose instance type `T` implements [`ReferenceListener`].
pub fn reference_listener<T>(component: Arc<dyn Recipe>) -> ListenerSpec<dyn ReferenceListener>
where
    T: ReferenceListener + 'static,
{
    let label = display_name(component.name()).to_string();
    ListenerSpec::new(component, move |instance| {
        Ok(instance_as::<T>(&label, &instance)? as Arc<dyn ReferenceListener>)
    })
}

/// Adapt a component whose instance type `T` implements [`RegistrationListener`].
pub fn registration_listener<T>(component: Arc<dyn Recipe>) -> ListenerSpec<dyn RegistrationListener>
where
    T: RegistrationListener + 'static,
{
    let label = display_name(component.name()).to_string();
    ListenerSpec::new(component, move |instance| {
        Ok(instance_as::<T>(&label, &instance)? as Arc<dyn RegistrationListener>)
    })
}

/// A listener ready to be called.
pub(crate) struct ResolvedListener<L: ?Sized> {
    pub(crate) component: String,
    pub(crate) listener: Arc<L>,
}

impl<L: ?Sized> Clone for ResolvedListener<L> {
    fn clone(&self) -> Self {
        Self {
            component: self.component.clone(),
            listener: Arc::clone(&self.listener),
        }
    }
}

/// Invoke a listener callback, logging and swallowing failures and panics.
///
/// Returns `true` if the callback succeeded.
pub(crate) fn invoke_listener(
    component: &str,
    action: &'static str,
    callback: impl FnOnce() -> std::result::Result<(), BoxError>,
) -> bool {
    let source: BoxError = match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => e,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "listener panicked".to_string());
            message.into()
        }
    };

    let failure = BlueprintError::ListenerInvocation {
        component: component.to_string(),
        action,
        source,
    };
    error!(component, action, error = %failure, "Listener invocation failed");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::ValueRecipe;
    use crate::recipe::testing::StubContext;
    use crate::service::ServiceProperties;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ReferenceListener for Recorder {
        fn bind(&self, reference: &ServiceHandle) -> std::result::Result<(), BoxError> {
            self.calls.lock().push(format!("bind:{}", reference.id()));
            Ok(())
        }

        fn unbind(&self, reference: Option<&ServiceHandle>) -> std::result::Result<(), BoxError> {
            self.calls
                .lock()
                .push(format!("unbind:{}", reference.map_or(0, |r| r.id())));
            Ok(())
        }
    }

    #[test]
    fn adapter_resolves_component() {
        let ctx = StubContext::default();
        let spec = reference_listener::<Recorder>(Arc::new(
            ValueRecipe::new(Recorder::default()).named("recorder"),
        ));

        let resolved = spec.resolve(&ctx).unwrap();
        assert_eq!(resolved.component, "recorder");

        let handle = ServiceHandle::new(3, vec!["Foo".into()], ServiceProperties::new());
        resolved.listener.bind(&handle).unwrap();
        resolved.listener.unbind(None).unwrap();
    }

    #[test]
    fn adapter_rejects_wrong_type() {
        let ctx = StubContext::default();
        let spec = reference_listener::<Recorder>(Arc::new(ValueRecipe::new(1u8)));
        assert!(matches!(spec.resolve(&ctx), Err(BlueprintError::TypeMismatch(_))));
    }

    #[test]
    fn failures_and_panics_are_swallowed() {
        assert!(invoke_listener("ok", "bind", || Ok(())));
        assert!(!invoke_listener("failing", "bind", || Err("boom".into())));
        assert!(!invoke_listener("panicking", "unbind", || panic!("boom")));
    }
}
