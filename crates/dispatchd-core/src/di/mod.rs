//! Typed service registry for supervisor components.
//!
//! The teacher's `HarnessRegistry` is a named map of one trait object
//! kind; the supervisor wires together several different component
//! kinds (event bus, queue, pool, scheduler, store...), so this
//! generalizes the same insert/get/list/len/is_empty shape to a closed
//! `ServiceKey` enum with singleton, transient, and direct-value
//! registrations, keeping the map typed per slot via `Any` plus a typed
//! accessor at the call site rather than casting ad hoc.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// One variant per supervisor component the container can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    EventBus,
    TaskQueue,
    DependencyGraph,
    WorkerPool,
    ResourceMonitor,
    Scheduler,
    Store,
    Isolation,
}

impl ServiceKey {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKey::EventBus => "event_bus",
            ServiceKey::TaskQueue => "task_queue",
            ServiceKey::DependencyGraph => "dependency_graph",
            ServiceKey::WorkerPool => "worker_pool",
            ServiceKey::ResourceMonitor => "resource_monitor",
            ServiceKey::Scheduler => "scheduler",
            ServiceKey::Store => "store",
            ServiceKey::Isolation => "isolation",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiError {
    #[error("service {0:?} is already registered")]
    DuplicateRegistration(ServiceKey),
    #[error("service {0:?} is not registered")]
    NotFound(ServiceKey),
    #[error("circular dependency detected resolving {0:?}")]
    CircularDependency(ServiceKey),
    #[error("service {0:?} was registered as an async factory; use resolve() not get()")]
    AsyncFactoryNeedsResolve(ServiceKey),
    #[error("service {0:?} failed to downcast to the requested type")]
    TypeMismatch(ServiceKey),
}

type BoxAny = Box<dyn Any + Send + Sync>;
type AsyncFactory =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = BoxAny> + Send>> + Send + Sync>;

enum Registration {
    Value(BoxAny),
    Singleton { factory: AsyncFactory, cached: Mutex<Option<Arc<BoxAny>>> },
    Transient(AsyncFactory),
}

/// Services that need an orderly teardown step participate in shutdown
/// by implementing this; everything else gets the default no-op.
#[async_trait::async_trait]
pub trait Shutdownable: Send + Sync {
    async fn shutdown(&self) {}
}

/// Named service registry keyed by [`ServiceKey`].
#[derive(Default)]
pub struct Container {
    registrations: HashMap<ServiceKey, Registration>,
    resolving: Mutex<HashSet<ServiceKey>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_value<T: Send + Sync + 'static>(
        &mut self,
        key: ServiceKey,
        value: T,
    ) -> Result<(), DiError> {
        if self.registrations.contains_key(&key) {
            return Err(DiError::DuplicateRegistration(key));
        }
        self.registrations
            .insert(key, Registration::Value(Box::new(value)));
        Ok(())
    }

    pub fn register_singleton<T, F, Fut>(&mut self, key: ServiceKey, factory: F) -> Result<(), DiError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.registrations.contains_key(&key) {
            return Err(DiError::DuplicateRegistration(key));
        }
        let factory: AsyncFactory = Arc::new(move || {
            let fut = factory();
            Box::pin(async move { Box::new(fut.await) as BoxAny })
        });
        self.registrations.insert(
            key,
            Registration::Singleton { factory, cached: Mutex::new(None) },
        );
        Ok(())
    }

    pub fn register_transient<T, F, Fut>(&mut self, key: ServiceKey, factory: F) -> Result<(), DiError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.registrations.contains_key(&key) {
            return Err(DiError::DuplicateRegistration(key));
        }
        let factory: AsyncFactory = Arc::new(move || {
            let fut = factory();
            Box::pin(async move { Box::new(fut.await) as BoxAny })
        });
        self.registrations.insert(key, Registration::Transient(factory));
        Ok(())
    }

    /// Resolve a service, running its factory if necessary. Detects
    /// re-entrant cycles (A's factory resolving A again) via a
    /// resolving-set tracked for the duration of the call.
    pub async fn resolve<T: Clone + Send + Sync + 'static>(&self, key: ServiceKey) -> Result<T, DiError> {
        {
            let mut resolving = self.resolving.lock().unwrap();
            if !resolving.insert(key) {
                return Err(DiError::CircularDependency(key));
            }
        }
        let result = self.resolve_inner::<T>(key).await;
        self.resolving.lock().unwrap().remove(&key);
        result
    }

    async fn resolve_inner<T: Clone + Send + Sync + 'static>(&self, key: ServiceKey) -> Result<T, DiError> {
        let registration = self
            .registrations
            .get(&key)
            .ok_or(DiError::NotFound(key))?;

        match registration {
            Registration::Value(v) => v
                .downcast_ref::<T>()
                .cloned()
                .ok_or(DiError::TypeMismatch(key)),
            Registration::Transient(factory) => {
                let boxed = factory().await;
                boxed
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or(DiError::TypeMismatch(key))
            }
            Registration::Singleton { factory, cached } => {
                let existing = cached.lock().unwrap().clone();
                let instance = match existing {
                    Some(instance) => instance,
                    None => {
                        let boxed = Arc::new(factory().await);
                        *cached.lock().unwrap() = Some(Arc::clone(&boxed));
                        boxed
                    }
                };
                instance
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or(DiError::TypeMismatch(key))
            }
        }
    }

    /// Synchronous lookup for a value already registered directly
    /// (`register_value`). Singletons and transients always require
    /// [`Container::resolve`] since their factories are async.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: ServiceKey) -> Result<T, DiError> {
        match self.registrations.get(&key) {
            None => Err(DiError::NotFound(key)),
            Some(Registration::Value(v)) => {
                v.downcast_ref::<T>().cloned().ok_or(DiError::TypeMismatch(key))
            }
            Some(Registration::Singleton { cached, .. }) => {
                let guard = cached.lock().unwrap();
                match guard.as_ref() {
                    Some(instance) => instance
                        .downcast_ref::<T>()
                        .cloned()
                        .ok_or(DiError::TypeMismatch(key)),
                    None => Err(DiError::AsyncFactoryNeedsResolve(key)),
                }
            }
            Some(Registration::Transient(_)) => Err(DiError::AsyncFactoryNeedsResolve(key)),
        }
    }

    pub fn list(&self) -> Vec<ServiceKey> {
        self.registrations.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Spawn a child container that inherits registrations but not
    /// memoized singleton instances.
    pub fn child(&self) -> Container {
        let mut child = Container::new();
        for (key, registration) in &self.registrations {
            let cloned = match registration {
                Registration::Value(_) => continue,
                Registration::Singleton { factory, .. } => {
                    Registration::Singleton { factory: Arc::clone(factory), cached: Mutex::new(None) }
                }
                Registration::Transient(factory) => Registration::Transient(Arc::clone(factory)),
            };
            child.registrations.insert(*key, cloned);
        }
        child
    }

    /// Clear every registration. Called as the last step of the
    /// supervisor's shutdown sequence.
    pub fn clear(&mut self) {
        self.registrations.clear();
    }
}
