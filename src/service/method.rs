//! Method descriptors and the type-erased handler behind them.

use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bound call: argument decoded, receiver captured, not yet started.
///
/// Resolves to the encoded reply, or to the handler's error.
pub type Invocation = BoxFuture<'static, Result<Vec<u8>>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Decode the argument from `body` and bind it into an invocation.
    ///
    /// Fails only if the body does not decode as the argument type; nothing
    /// of the handler runs until the returned future is polled.
    fn bind(&self, codec: CodecType, body: &[u8]) -> Result<Invocation>;
}

/// Wrapper that decodes the argument and encodes the reply around a typed
/// handler `Fn(Arc<S>, A) -> Future<Output = Result<R, E>>`.
pub struct TypedHandler<S, F, A, R, E, Fut> {
    receiver: Arc<S>,
    handler: Arc<F>,
    _phantom: PhantomData<fn(A) -> (R, E, Fut)>,
}

impl<S, F, A, R, E, Fut> TypedHandler<S, F, A, R, E, Fut>
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    /// Create a new typed handler bound to `receiver`.
    pub fn new(receiver: Arc<S>, handler: F) -> Self {
        Self {
            receiver,
            handler: Arc::new(handler),
            _phantom: PhantomData,
        }
    }
}

impl<S, F, A, R, E, Fut> Handler for TypedHandler<S, F, A, R, E, Fut>
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    fn bind(&self, codec: CodecType, body: &[u8]) -> Result<Invocation> {
        let argv: A = codec.decode(body)?;
        let receiver = self.receiver.clone();
        let handler = self.handler.clone();

        Ok(Box::pin(async move {
            match handler(receiver, argv).await {
                Ok(reply) => codec.encode(&reply),
                Err(e) => Err(RpcError::Handler(e.to_string())),
            }
        }))
    }
}

/// Descriptor of one registered method.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    handler: Box<dyn Handler>,
    num_calls: AtomicU64,
}

impl MethodType {
    pub(crate) fn new<A, R>(name: &str, handler: Box<dyn Handler>) -> Self {
        Self {
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            handler,
            num_calls: AtomicU64::new(0),
        }
    }

    /// Method name (without the service prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the argument.
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Rust type name of the reply.
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of invocations started so far.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode a request body into a bound invocation.
    pub fn bind(&self, codec: CodecType, body: &[u8]) -> Result<Invocation> {
        self.handler.bind(codec, body)
    }

    pub(crate) fn record_call(&self) {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    struct Foo;

    fn sum_method() -> MethodType {
        let handler = TypedHandler::new(Arc::new(Foo), |_foo: Arc<Foo>, args: Args| async move {
            Ok::<_, String>(args.num1 + args.num2)
        });
        MethodType::new::<Args, i64>("Sum", Box::new(handler))
    }

    #[tokio::test]
    async fn test_bind_and_run() {
        let method = sum_method();
        let body = CodecType::MsgPack.encode(&Args { num1: 2, num2: 3 }).unwrap();

        let invocation = method.bind(CodecType::MsgPack, &body).unwrap();
        let reply = invocation.await.unwrap();

        let sum: i64 = CodecType::MsgPack.decode(&reply).unwrap();
        assert_eq!(sum, 5);
    }

    #[test]
    fn test_bind_rejects_wrong_shape() {
        let method = sum_method();
        let body = CodecType::Json.encode(&"not args").unwrap();

        assert!(method.bind(CodecType::Json, &body).is_err());
    }

    #[tokio::test]
    async fn test_handler_error_surfaces_as_text() {
        let handler = TypedHandler::new(Arc::new(Foo), |_foo: Arc<Foo>, divisor: i64| async move {
            if divisor == 0 {
                return Err("divide by zero");
            }
            Ok(100 / divisor)
        });
        let method = MethodType::new::<i64, i64>("Div", Box::new(handler));

        let body = CodecType::Json.encode(&0i64).unwrap();
        let result = method.bind(CodecType::Json, &body).unwrap().await;

        assert!(matches!(result, Err(RpcError::Handler(ref m)) if m == "divide by zero"));
    }

    #[test]
    fn test_descriptor_metadata() {
        let method = sum_method();
        assert_eq!(method.name(), "Sum");
        assert!(method.arg_type().ends_with("Args"));
        assert_eq!(method.reply_type(), "i64");
        assert_eq!(method.num_calls(), 0);

        method.record_call();
        method.record_call();
        assert_eq!(method.num_calls(), 2);
    }
}
