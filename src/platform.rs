//! Provides a tiny DI like container which keeps the central components of a node together.
//!
//! The platform is more or less a map from component type to an **Arc** of the component,
//! along with the central **is_running** flag which is toggled to *false* once
//! [Platform::terminate](Platform::terminate) is invoked. Components register themselves during
//! startup (commonly via the [Builder](crate::builder::Builder)) and are resolved by the parts
//! of the system which depend on them - e.g. the server fetches the
//! [GroupRegistry](crate::group::GroupRegistry) for each incoming request.
//!
//! [Platform::require](Platform::require) is the common way of fetching a component which is
//! known to be present. Once a shutdown has been initiated, the internal map is cleared (so
//! that all **Drop** handlers run), therefore code which might execute during shutdown should
//! use [Platform::find](Platform::find) and handle the **None** case gracefully.
//!
//! # Examples
//! ```
//! # use std::sync::Arc;
//! # use ganymede::platform::Platform;
//! struct Service {
//!     value: i32,
//! }
//!
//! let platform = Platform::new();
//! platform.register::<Service>(Arc::new(Service { value: 42 }));
//!
//! assert_eq!(platform.require::<Service>().value, 42);
//! assert_eq!(platform.is_running(), true);
//!
//! // Once terminated, all components are released and the platform reports itself
//! // as halted...
//! platform.terminate();
//! assert_eq!(platform.find::<Service>().is_none(), true);
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps all central components of a node in a single place.
pub struct Platform {
    components: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            components: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a component.
    ///
    /// A component registered for the same type twice replaces its predecessor.
    pub fn register<T>(&self, component: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .components
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), component);
    }

    /// Tries to resolve a previously registered component.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let components = self.components.lock().unwrap();
        components
            .get(&TypeId::of::<T>())
            .and_then(|component| component.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered component.
    ///
    /// # Panics
    /// Panics if the requested component isn't available. Note that during a shutdown all
    /// components are evicted, therefore this might panic even if it worked before
    /// [terminate](Platform::terminate) was invoked.
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if self.is_running() {
            match self.find::<T>() {
                Some(component) => component,
                None => panic!(
                    "A required component ({}) was not available in the platform registry!",
                    std::any::type_name::<T>()
                ),
            }
        } else {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }
    }

    /// Determines if the platform is still running or if [terminate](Platform::terminate) has
    /// already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all components (so that their **Drop** handlers run
    /// eventually) and toggle the [is_running](Platform::is_running) flag to **false**, which
    /// in turn makes all event loops wind down.
    pub fn terminate(&self) {
        self.components.lock().unwrap().clear();
        self.is_running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use crate::platform::Platform;
    use std::sync::Arc;

    struct Component {
        value: i32,
    }

    struct AbsentComponent;

    #[test]
    fn components_can_be_registered_and_resolved() {
        let platform = Platform::new();
        platform.register::<Component>(Arc::new(Component { value: 42 }));

        assert_eq!(platform.require::<Component>().value, 42);
        assert_eq!(platform.find::<AbsentComponent>().is_none(), true);
    }

    #[test]
    #[should_panic]
    fn requiring_an_absent_component_panics() {
        let platform = Platform::new();
        let _ = platform.require::<AbsentComponent>();
    }

    #[test]
    fn terminate_releases_all_components() {
        let platform = Platform::new();
        platform.register::<Component>(Arc::new(Component { value: 42 }));
        assert_eq!(platform.is_running(), true);

        platform.terminate();

        assert_eq!(platform.find::<Component>().is_none(), true);
        assert_eq!(platform.is_running(), false);
    }
}
