//! Service module - method binding, registration and routing.
//!
//! Provides:
//! - [`ServiceBuilder`] - binds typed async handlers to a receiver
//! - [`Service`] / [`MethodType`] - the bound services and their methods
//! - [`ServiceRegistry`] - routes `Service.Method` to a method descriptor
//!
//! A method takes exactly one argument and produces either a reply or an
//! error. Both shapes are enforced by the handler bounds at compile time:
//! the argument must be `DeserializeOwned`, the reply `Serialize`, the error
//! `Display`.

mod method;
mod registry;

pub use method::{BoxFuture, Handler, Invocation, MethodType, TypedHandler};
pub use registry::{Service, ServiceBuilder, ServiceRegistry};
