//! Services, the builder that binds their methods, and the registry that
//! routes `Service.Method` strings to them.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use trpc::service::{ServiceBuilder, ServiceRegistry};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! struct Foo;
//!
//! let service = ServiceBuilder::new("Foo", Foo)
//!     .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
//!         Ok::<_, String>(args.num1 + args.num2)
//!     })
//!     .build()
//!     .unwrap();
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register(service).unwrap();
//! assert!(registry.resolve("Foo.Sum").is_ok());
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::method::{Invocation, MethodType, TypedHandler};
use crate::error::{Result, RpcError};

/// A named set of methods bound to one receiver.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Service name, the part before the `.` in a call target.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method descriptor by name.
    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Names of all bound methods, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run a bound invocation of `method`, counting the call.
    pub async fn call(&self, method: &MethodType, invocation: Invocation) -> Result<Vec<u8>> {
        method.record_call();
        invocation.await
    }
}

/// Fluent builder that binds typed handlers to a receiver.
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Start a service named `name` around `receiver`.
    pub fn new(name: &str, receiver: S) -> Self {
        Self::with_shared(name, Arc::new(receiver))
    }

    /// Start a service around a receiver that is shared elsewhere.
    pub fn with_shared(name: &str, receiver: Arc<S>) -> Self {
        Self {
            name: name.to_string(),
            receiver,
            methods: HashMap::new(),
        }
    }

    /// Bind a method.
    ///
    /// The handler receives the receiver and the decoded argument and
    /// returns the reply or an error whose text is sent to the caller.
    /// Names that are not exported identifiers (leading uppercase ASCII
    /// letter, no `.`) are skipped with a warning.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        if !is_exported(name) {
            tracing::warn!("rpc server: skipping {}.{}: not an exported name", self.name, name);
            return self;
        }

        let typed: TypedHandler<S, F, A, R, E, Fut> = TypedHandler::new(self.receiver.clone(), handler);
        let method = MethodType::new::<A, R>(name, Box::new(typed));
        if self.methods.insert(name.to_string(), Arc::new(method)).is_some() {
            tracing::warn!("rpc server: {}.{} bound twice, keeping the last", self.name, name);
        }
        self
    }

    /// Finish the service.
    ///
    /// Fails if the service name is not an exported identifier.
    pub fn build(self) -> Result<Service> {
        if !is_exported(&self.name) {
            return Err(RpcError::InvalidServiceName(self.name));
        }
        if self.methods.is_empty() {
            tracing::warn!("rpc server: service {} has no methods", self.name);
        }

        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Mapping from service name to service.
///
/// Filled before serving starts and read-only afterwards, so lookups take
/// no lock.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. Fails if its name is already taken.
    pub fn register(&mut self, service: Service) -> Result<()> {
        if self.services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }

        for method in service.method_names() {
            tracing::info!("rpc server: register {}.{}", service.name(), method);
        }
        self.services
            .insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Get a service by name.
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).cloned()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Route `Service.Method` to its service and method descriptor.
    ///
    /// Splits on the last `.`.
    pub fn resolve(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodType>)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::IllFormedMethod(service_method.to_string()))?;

        let service = self
            .get(service_name)
            .ok_or_else(|| RpcError::UnknownService(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| RpcError::UnknownMethod(method_name.to_string()))?;

        Ok((service, method))
    }
}

/// Exported-name rule: leading uppercase ASCII letter, then letters, digits
/// or underscores.
fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}
