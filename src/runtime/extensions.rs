//! Host-supplied services looked up by type
//!
//! Extensions are configured before a workflow runs and are read-only
//! afterwards. Each executor owns its own collection.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Typed service collection
#[derive(Clone, Default)]
pub struct Extensions {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, replacing any previous service of the same type
    pub fn add<T: Send + Sync + 'static>(&mut self, service: T) -> &mut Self {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    /// Add a shared service
    pub fn add_shared<T: Send + Sync + 'static>(&mut self, service: Arc<T>) -> &mut Self {
        self.services.insert(TypeId::of::<T>(), service);
        self
    }

    /// Look up a service
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when no service is configured
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("count", &self.services.len())
            .finish()
    }
}
