//! Server builder and per-connection runtime loop.
//!
//! The [`ServerBuilder`] provides a fluent API for registering services and
//! tuning limits. The [`Server`] serves each connection:
//! 1. Read the option handshake (wrong magic or unknown codec: drop)
//! 2. Read request frames and resolve `Service.Method`
//! 3. Dispatch each request to its own task, bounded per connection
//! 4. Send exactly one response per request through the writer task
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use tokio::net::TcpListener;
//! use trpc::{Server, ServiceBuilder};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! struct Foo;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let foo = ServiceBuilder::new("Foo", Foo)
//!         .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
//!             Ok::<_, String>(args.num1 + args.num2)
//!         })
//!         .build()?;
//!
//!     let server = Server::builder().register(foo)?.build();
//!     let listener = TcpListener::bind("127.0.0.1:9999").await?;
//!     server.accept(listener).await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;

use crate::codec::CodecType;
use crate::error::{Result, RpcError};
use crate::protocol::{read_options, FrameReader, Header, OutboundFrame, DEFAULT_MAX_FRAME_SIZE};
use crate::service::{Invocation, MethodType, Service, ServiceRegistry};
use crate::transport::Listener;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum requests handled concurrently on one connection.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Builder for configuring and creating a [`Server`].
///
/// Register every service before building; the registry is read-only once
/// serving starts.
pub struct ServerBuilder {
    registry: ServiceRegistry,
    writer_config: WriterConfig,
    max_concurrent_requests: usize,
    max_frame_size: u32,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            registry: ServiceRegistry::new(),
            writer_config: WriterConfig::default(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Register a service.
    ///
    /// Fails if a service with the same name is already registered.
    pub fn register(mut self, service: Service) -> Result<Self> {
        self.registry.register(service)?;
        Ok(self)
    }

    /// Set the maximum number of requests handled concurrently per
    /// connection.
    ///
    /// When this limit is reached, the connection stops reading requests
    /// until a handler finishes.
    /// Default: 256
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit.max(1);
        self
    }

    /// Set the maximum size of a header or body segment.
    ///
    /// Default: 64 MB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set how many response frames may queue for the writer task.
    ///
    /// Handlers wait for room when the queue is full.
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Build the server.
    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                registry: self.registry,
                writer_config: self.writer_config,
                max_concurrent_requests: self.max_concurrent_requests,
                max_frame_size: self.max_frame_size,
            }),
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    registry: ServiceRegistry,
    writer_config: WriterConfig,
    max_concurrent_requests: usize,
    max_frame_size: u32,
}

/// An RPC server.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// A request whose body decoded and whose handler is bound.
struct Request {
    header: Header,
    service: Arc<Service>,
    method: Arc<MethodType>,
    invocation: Invocation,
}

/// Why reading a request failed.
enum ReadError {
    /// The transport is still healthy; answer with an error response.
    Request(RpcError),
    /// The stream is unusable; stop serving the connection.
    Transport(RpcError),
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Number of calls started for `Service.Method`, if it is registered.
    pub fn num_calls(&self, service_method: &str) -> Option<u64> {
        self.inner
            .registry
            .resolve(service_method)
            .ok()
            .map(|(_, method)| method.num_calls())
    }

    /// Accept connections until the listener fails, serving each on its own
    /// task.
    pub async fn accept<L: Listener>(&self, listener: L) {
        loop {
            let stream = match listener.accept_conn().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("rpc server: accept error: {}", e);
                    return;
                }
            };

            let server = self.clone();
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }

    /// Serve one connection until the peer closes it or the stream fails.
    ///
    /// Returns after every handler started on the connection has finished.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let options = match read_options(&mut reader).await {
            Ok(options) => options,
            Err(RpcError::ConnectionClosed) => return,
            Err(e) => {
                tracing::error!("rpc server: options error: {}", e);
                return;
            }
        };
        tracing::debug!(
            "rpc server: connection using {} (handle timeout {:?})",
            options.codec_type,
            options.handle_timeout
        );

        let frames = FrameReader::with_max_frame_size(reader, options.codec_type, self.inner.max_frame_size);
        let (writer, writer_task) = spawn_writer_task(write_half, self.inner.writer_config.clone());

        self.serve_codec(frames, writer, options.handle_timeout).await;

        // The writer task ends once every handle is dropped.
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("rpc server: writer error: {}", e),
            Err(e) => tracing::error!("rpc server: writer task failed: {}", e),
        }
    }

    async fn serve_codec<R>(&self, mut frames: FrameReader<R>, writer: WriterHandle, handle_timeout: Duration)
    where
        R: AsyncRead + Unpin,
    {
        let codec = frames.codec();
        let max = self.inner.max_concurrent_requests;
        let permits = Arc::new(Semaphore::new(max));

        loop {
            let header = match frames.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("rpc server: read header error: {}", e);
                    break;
                }
            };

            let request = match self.read_request(&mut frames, header).await {
                Ok(request) => request,
                Err((header, ReadError::Request(e))) => {
                    tracing::debug!("rpc server: bad request {} (seq {}): {}", header.service_method, header.seq, e);
                    if send_error(&writer, codec, &header, e.to_string()).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err((_, ReadError::Transport(e))) => {
                    tracing::error!("rpc server: read body error: {}", e);
                    break;
                }
            };

            // Waits while the connection is at its limit.
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            tokio::spawn(handle_request(request, codec, writer.clone(), handle_timeout, permit));
        }

        // Every permit back means every handler is done.
        let max = u32::try_from(max).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(max).await;
    }

    /// Resolve the target, then read and bind the body.
    async fn read_request<R>(
        &self,
        frames: &mut FrameReader<R>,
        header: Header,
    ) -> std::result::Result<Request, (Header, ReadError)>
    where
        R: AsyncRead + Unpin,
    {
        let (service, method) = match self.inner.registry.resolve(&header.service_method) {
            Ok(found) => found,
            Err(e) => {
                // Skip the body so the next frame starts on a boundary.
                return match frames.discard_body().await {
                    Ok(()) => Err((header, ReadError::Request(e))),
                    Err(io) => Err((header, ReadError::Transport(io))),
                };
            }
        };

        let body = match frames.read_body().await {
            Ok(body) => body,
            Err(e) => return Err((header, ReadError::Transport(e))),
        };

        match method.bind(frames.codec(), &body) {
            Ok(invocation) => Ok(Request {
                header,
                service,
                method,
                invocation,
            }),
            Err(e) => Err((header, ReadError::Request(e))),
        }
    }
}

/// One handling unit: run the invocation and send its single response.
///
/// With a non-zero `handle_timeout`, a timeout response is sent when the
/// deadline passes first; the invocation still runs to completion and keeps
/// its permit until then, and its result is dropped.
async fn handle_request(
    request: Request,
    codec: CodecType,
    writer: WriterHandle,
    handle_timeout: Duration,
    permit: OwnedSemaphorePermit,
) {
    let Request {
        header,
        service,
        method,
        invocation,
    } = request;

    let mut task = tokio::spawn(async move { service.call(&method, invocation).await });

    let joined = if handle_timeout.is_zero() {
        task.await
    } else {
        match tokio::time::timeout(handle_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let e = RpcError::HandleTimeout(handle_timeout);
                tracing::warn!("rpc server: {} (seq {}): {}", header.service_method, header.seq, e);
                if let Err(e) = send_error(&writer, codec, &header, e.to_string()).await {
                    tracing::debug!("rpc server: response for seq {} not sent: {}", header.seq, e);
                }

                if let Err(e) = task.await {
                    log_join_error(&header, &e);
                }
                drop(permit);
                return;
            }
        }
    };

    let sent = match joined {
        Ok(Ok(body)) => send_reply(&writer, codec, &header, &body).await,
        Ok(Err(e)) => {
            tracing::debug!("rpc server: {} (seq {}) failed: {}", header.service_method, header.seq, e);
            send_error(&writer, codec, &header, e.to_string()).await
        }
        Err(e) => {
            log_join_error(&header, &e);
            send_error(&writer, codec, &header, "rpc server: handler panicked".to_string()).await
        }
    };
    if let Err(e) = sent {
        tracing::debug!("rpc server: response for seq {} not sent: {}", header.seq, e);
    }
    drop(permit);
}

async fn send_reply(writer: &WriterHandle, codec: CodecType, header: &Header, body: &[u8]) -> Result<()> {
    let frame = match OutboundFrame::from_encoded_body(codec, &header.reply(), body) {
        Ok(frame) => frame,
        Err(e) => {
            // Reply too large to frame: report instead.
            return send_error(writer, codec, header, e.to_string()).await;
        }
    };
    writer.send(frame).await
}

async fn send_error(
    writer: &WriterHandle,
    codec: CodecType,
    header: &Header,
    error: String,
) -> Result<()> {
    let frame = OutboundFrame::error(codec, &header.reply_error(error))?;
    writer.send(frame).await
}

fn log_join_error(header: &Header, e: &JoinError) {
    tracing::error!(
        "rpc server: handler for {} (seq {}) did not complete: {}",
        header.service_method,
        header.seq,
        e
    );
}
