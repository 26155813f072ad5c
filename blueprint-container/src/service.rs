//! Service registry abstractions.
//!
//! The container consumes a dynamic service registry through the
//! [`ServiceRegistry`] trait. Services are identified by a
//! [`ServiceHandle`] which carries the registration id, the exported
//! interfaces and a (mutable) property map.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{BlueprintError, Result};
use crate::recipe::Instance;

/// Well-known service property keys.
pub mod keys {
    /// Registration id assigned by the registry.
    pub const SERVICE_ID: &str = "service.id";
    /// Ranking used to pick the best service; absent means 0.
    pub const SERVICE_RANKING: &str = "service.ranking";
    /// Interfaces a service is exported under.
    pub const OBJECT_CLASS: &str = "objectClass";
    /// Name of the component that exported the service.
    pub const COMPONENT_NAME: &str = "osgi.service.blueprint.compname";
}

/// A single service property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl PropertyValue {
    /// Returns `true` if this value equals `other` or, for lists,
    /// contains it.
    fn satisfies(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (PropertyValue::List(items), PropertyValue::Str(s)) => items.contains(s),
            _ => self == other,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Str(s) => write!(f, "{s}"),
            PropertyValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

/// Service properties, ordered by key.
pub type ServiceProperties = BTreeMap<String, PropertyValue>;

struct HandleInner {
    id: u64,
    interfaces: Vec<String>,
    properties: RwLock<ServiceProperties>,
}

/// Handle to a registered service.
///
/// Cloning is cheap; clones share the property map, so a `Modified`
/// event is visible through every clone. Two handles are equal when
/// their registration ids are equal.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<HandleInner>,
}

impl ServiceHandle {
    /// Creates a handle. `service.id` and `objectClass` are always set
    /// from `id` and `interfaces`, overriding whatever `properties` holds.
    pub fn new(id: u64, interfaces: Vec<String>, mut properties: ServiceProperties) -> Self {
        properties.insert(keys::SERVICE_ID.to_string(), PropertyValue::Int(id as i64));
        properties.insert(
            keys::OBJECT_CLASS.to_string(),
            PropertyValue::List(interfaces.clone()),
        );
        Self {
            inner: Arc::new(HandleInner {
                id,
                interfaces,
                properties: RwLock::new(properties),
            }),
        }
    }

    /// Registration id. Lower ids were registered earlier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.inner.properties.read().get(key).cloned()
    }

    /// Snapshot of all properties.
    pub fn properties(&self) -> ServiceProperties {
        self.inner.properties.read().clone()
    }

    /// Service ranking; absent, non-numeric or out-of-range values count as 0.
    pub fn ranking(&self) -> i32 {
        match self.inner.properties.read().get(keys::SERVICE_RANKING) {
            Some(PropertyValue::Int(value)) => i32::try_from(*value).unwrap_or(0),
            _ => 0,
        }
    }

    /// Replaces the properties, keeping `service.id` and `objectClass`.
    pub fn update_properties(&self, mut properties: ServiceProperties) {
        properties.insert(
            keys::SERVICE_ID.to_string(),
            PropertyValue::Int(self.inner.id as i64),
        );
        properties.insert(
            keys::OBJECT_CLASS.to_string(),
            PropertyValue::List(self.inner.interfaces.clone()),
        );
        *self.inner.properties.write() = properties;
    }
}

impl PartialEq for ServiceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ServiceHandle {}

impl Hash for ServiceHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.inner.id)
            .field("interfaces", &self.inner.interfaces)
            .field("ranking", &self.ranking())
            .finish()
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] (service.id={})", self.inner.interfaces.join(", "), self.inner.id)
    }
}

/// Typed service filter: a conjunction of interface, component name and
/// property equality constraints.
///
/// # Examples
/// ```
/// use blueprint_container::service::ServiceFilter;
///
/// let filter = ServiceFilter::new()
///     .interface("app::Greeter")
///     .component_name("englishGreeter");
/// assert_eq!(
///     filter.to_string(),
///     "(&(objectClass=app::Greeter)(osgi.service.blueprint.compname=englishGreeter))"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    interface: Option<String>,
    component_name: Option<String>,
    properties: Vec<(String, PropertyValue)>,
}

impl ServiceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn component_name(mut self, name: impl Into<String>) -> Self {
        self.component_name = Some(name.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Returns `true` if no constraint was specified.
    pub fn is_empty(&self) -> bool {
        self.interface.is_none() && self.component_name.is_none() && self.properties.is_empty()
    }

    /// Fails with a component definition error when no constraint was set.
    pub fn ensure_constrained(&self) -> Result<()> {
        if self.is_empty() {
            return Err(BlueprintError::definition(
                "No constraints were specified on the service reference",
            ));
        }
        Ok(())
    }

    pub fn matches(&self, handle: &ServiceHandle) -> bool {
        if let Some(ref interface) = self.interface {
            if !handle.interfaces().iter().any(|i| i == interface) {
                return false;
            }
        }

        let properties = handle.inner.properties.read();

        if let Some(ref name) = self.component_name {
            match properties.get(keys::COMPONENT_NAME) {
                Some(PropertyValue::Str(actual)) if actual == name => {}
                _ => return false,
            }
        }

        self.properties.iter().all(|(key, expected)| {
            properties
                .get(key)
                .is_some_and(|actual| actual.satisfies(expected))
        })
    }
}

impl fmt::Display for ServiceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut members: Vec<String> = self
            .properties
            .iter()
            .map(|(key, value)| format!("({key}={value})"))
            .collect();
        if let Some(ref interface) = self.interface {
            members.push(format!("({}={interface})", keys::OBJECT_CLASS));
        }
        if let Some(ref name) = self.component_name {
            members.push(format!("({}={name})", keys::COMPONENT_NAME));
        }

        match members.len() {
            0 => write!(f, "({}=*)", keys::OBJECT_CLASS),
            1 => write!(f, "{}", members[0]),
            _ => write!(f, "(&{})", members.concat()),
        }
    }
}

/// A change in the registry, delivered to subscribed listeners.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Registered(ServiceHandle),
    Modified(ServiceHandle),
    Unregistering(ServiceHandle),
}

impl ServiceEvent {
    pub fn handle(&self) -> &ServiceHandle {
        match self {
            ServiceEvent::Registered(h)
            | ServiceEvent::Modified(h)
            | ServiceEvent::Unregistering(h) => h,
        }
    }
}

/// Receives registry events for a subscription.
///
/// Events may arrive on any thread.
pub trait ServiceListener: Send + Sync {
    fn service_changed(&self, event: &ServiceEvent);
}

/// Identifies a registry subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Runs once the last acquired use of a service has been released.
pub type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// The dynamic service registry the container tracks and exports into.
///
/// Implementations must deliver an event to every listener that was
/// subscribed before the event fired, and must not hold internal locks
/// while calling listeners.
///
/// Trackers call [`acquire`](Self::acquire) and [`release`](Self::release)
/// while holding their binding monitor. Neither may call back into a
/// tracker (deliver events, subscribe, unsubscribe) on the calling thread,
/// or that tracker deadlocks.
pub trait ServiceRegistry: Send + Sync {
    /// Subscribe to events for services matching `filter`.
    fn subscribe(
        &self,
        filter: &ServiceFilter,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<SubscriptionId>;

    fn unsubscribe(&self, subscription: SubscriptionId);

    /// Services currently matching `filter`, in registration order.
    fn current(&self, filter: &ServiceFilter) -> Vec<ServiceHandle>;

    /// Obtain the service object; `None` if it has gone away.
    fn acquire(&self, handle: &ServiceHandle) -> Option<Instance>;

    /// Release a service obtained through [`acquire`](Self::acquire).
    fn release(&self, handle: &ServiceHandle);

    /// Run `callback` once no acquired use of the service remains.
    ///
    /// Fires immediately when the service is unused or unknown. Otherwise it
    /// runs on the thread performing the final [`release`](Self::release),
    /// after the registry's own lock has been dropped. A service that was
    /// unregistered while still in use keeps counting releases until it
    /// drains.
    fn when_released(&self, handle: &ServiceHandle, callback: ReleaseCallback);

    /// Export a service.
    fn register(
        &self,
        interfaces: Vec<String>,
        properties: ServiceProperties,
        service: Instance,
    ) -> Result<ServiceHandle>;

    fn unregister(&self, handle: &ServiceHandle);

    /// Replace the properties of a registered service.
    fn modify(&self, handle: &ServiceHandle, properties: ServiceProperties);
}
